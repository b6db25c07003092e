use std::collections::HashMap;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use pixel_common::fingerprint::{EventHasher, HashKeyError};
use pixel_common::platform::Platform;
use pixel_common::retry::RetryPolicy;

use crate::destinations::DestinationList;
use crate::error::ConfigError;
use crate::tracker::TrackerSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "5000")]
    pub dedup_ttl_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub sweep_interval_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub ready_timeout_ms: EnvMsDuration,

    #[envconfig(default = "1500")]
    pub settle_timeout_ms: EnvMsDuration,

    #[envconfig(default = "3")]
    pub max_retries: u32,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    /// `platform=id` pairs, `!` prefix for disabled ones.
    #[envconfig(default = "")]
    pub destinations: DestinationList,

    /// `platform=url` pairs. Each listed platform gets a hook forwarding its calls to the url.
    #[envconfig(default = "")]
    pub hook_endpoints: HookEndpoints,

    #[envconfig(default = "5000")]
    pub hook_timeout_ms: EnvMsDuration,

    /// Directory for persisted dedup state. Kept in memory when unset.
    pub storage_dir: Option<NonEmptyString>,

    pub analytics_url: Option<NonEmptyString>,

    #[envconfig(default = "USD")]
    pub default_currency: NonEmptyString,

    #[envconfig(default = "1800")]
    pub session_idle_timeout_secs: u64,

    /// 32 hex characters keying the event fingerprint hash.
    pub hash_key: Option<NonEmptyString>,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            dedup_ttl: self.dedup_ttl_ms.0,
            sweep_interval: self.sweep_interval_ms.0,
            ready_timeout: self.ready_timeout_ms.0,
            settle_timeout: self.settle_timeout_ms.0,
            default_currency: self.default_currency.as_str().to_ascii_uppercase(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
            Some(self.retry_policy.maximum_interval.0),
        )
    }

    pub fn hasher(&self) -> Result<EventHasher, HashKeyError> {
        match &self.hash_key {
            Some(key) => EventHasher::from_hex(key.as_str()),
            None => Ok(EventHasher::default()),
        }
    }

    pub fn session_idle_timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.session_idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Backoff between attempts to find a pixel's platform hook.
#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL_MS", default = "500")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL_MS", default = "10000")]
    pub maximum_interval: EnvMsDuration,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Relay endpoint per platform, parsed from `platform=url` pairs separated by commas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookEndpoints(pub HashMap<Platform, String>);

impl FromStr for HookEndpoints {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut endpoints = HashMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((platform, url)) = entry.split_once('=') else {
                return Err(ConfigError::InvalidHookEndpoint(entry.to_owned()));
            };
            let url = url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidHookEndpoint(entry.to_owned()));
            }
            endpoints.insert(Platform::from_str(platform)?, url.to_owned());
        }
        Ok(HookEndpoints(endpoints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&vars).unwrap()
    }

    #[test]
    fn defaults() {
        let config = from_vars(&[]);

        assert_eq!(config.bind(), "0.0.0.0:3310");
        let settings = config.tracker_settings();
        assert_eq!(settings.dedup_ttl, time::Duration::from_millis(5000));
        assert_eq!(settings.sweep_interval, time::Duration::from_secs(10));
        assert_eq!(settings.ready_timeout, time::Duration::from_secs(10));
        assert_eq!(settings.settle_timeout, time::Duration::from_millis(1500));
        assert_eq!(settings.default_currency, "USD");
        assert_eq!(config.max_retries, 3);
        assert!(config.destinations.0.is_empty());
        assert!(config.hook_endpoints.0.is_empty());
        assert!(config.storage_dir.is_none());
        assert!(config.export_prometheus);
        assert_eq!(
            config.retry_policy().time_until_next_retry(1),
            time::Duration::from_secs(1)
        );
    }

    #[test]
    fn parses_destinations_and_endpoints() {
        let config = from_vars(&[
            ("DESTINATIONS", "meta_pixel=123,!google_ads=AW-9"),
            ("HOOK_ENDPOINTS", "meta_pixel=http://relay.local/fbq"),
            ("DEDUP_TTL_MS", "250"),
            ("DEFAULT_CURRENCY", "inr"),
        ]);

        assert_eq!(config.destinations.0.len(), 2);
        assert_eq!(config.destinations.enabled().count(), 1);
        assert_eq!(
            config.hook_endpoints.0.get(&Platform::MetaPixel).map(String::as_str),
            Some("http://relay.local/fbq")
        );
        assert_eq!(config.tracker_settings().dedup_ttl, time::Duration::from_millis(250));
        assert_eq!(config.tracker_settings().default_currency, "INR");
    }

    #[test]
    fn rejects_bad_values() {
        let vars = |k: &str, v: &str| -> HashMap<String, String> {
            HashMap::from([(k.to_owned(), v.to_owned())])
        };

        assert!(Config::init_from_hashmap(&vars("DESTINATIONS", "nope")).is_err());
        assert!(Config::init_from_hashmap(&vars("HOOK_ENDPOINTS", "meta_pixel=ftp://x")).is_err());
        assert!(Config::init_from_hashmap(&vars("DEDUP_TTL_MS", "soon")).is_err());
    }

    #[test]
    fn hash_key_must_be_valid_hex() {
        let config = from_vars(&[("HASH_KEY", "zz")]);
        assert!(config.hasher().is_err());

        let config = from_vars(&[("HASH_KEY", "000102030405060708090a0b0c0d0e0f")]);
        assert!(config.hasher().is_ok());
    }
}
