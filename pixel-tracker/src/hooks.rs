//! The platform entry points adapters call into (`gtag`, `fbq`, `ttq`, ...).
//!
//! A hook only exists once the platform's script has attached it, so every adapter looks its
//! hook up through the [`HookRegistry`] on each call and treats absence as a normal no-op.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time;

use pixel_common::platform::Platform;
use reqwest::header;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::HookError;
use crate::metrics_consts::HOOK_FORWARDS_TOTAL;

/// An injected platform global. `method` is the command (`"event"`, `"track"`, ...) and
/// `args` the remaining positional arguments, as the platform's own snippet would pass them.
pub trait PlatformHook: Send + Sync {
    fn call(&self, method: &str, args: Vec<Value>) -> Result<(), HookError>;
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<Platform, Arc<dyn PlatformHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, platform: Platform, hook: Arc<dyn PlatformHook>) {
        debug!(%platform, global = platform.global_name(), "platform hook installed");
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(platform, hook);
    }

    pub fn remove(&self, platform: Platform) -> Option<Arc<dyn PlatformHook>> {
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&platform)
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformHook>> {
        self.hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&platform)
            .cloned()
    }

    pub fn is_installed(&self, platform: Platform) -> bool {
        self.get(platform).is_some()
    }
}

/// Forwards every call as JSON to a relay endpoint (a server-side conversions gateway, a
/// tag-manager container, ...). Delivery is fire-and-forget: the call returns once the request
/// is spawned, and delivery failures are only logged.
pub struct HttpForwardHook {
    platform: Platform,
    url: String,
    client: reqwest::Client,
}

impl HttpForwardHook {
    pub fn new(
        platform: Platform,
        url: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("pixel-tracker hook forwarder")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            platform,
            url: url.to_owned(),
            client,
        })
    }
}

impl PlatformHook for HttpForwardHook {
    fn call(&self, method: &str, args: Vec<Value>) -> Result<(), HookError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| HookError::NoRuntime)?;

        let body = json!({
            "platform": self.platform,
            "global": self.platform.global_name(),
            "method": method,
            "args": args,
        });
        let request = self.client.post(&self.url).json(&body);
        let platform = self.platform.as_str();

        runtime.spawn(async move {
            let outcome = match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => "ok",
                Err(error) => {
                    warn!(platform, %error, "failed to forward platform call");
                    "error"
                }
            };
            metrics::counter!(HOOK_FORWARDS_TOTAL, "platform" => platform, "outcome" => outcome)
                .increment(1);
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingHook;
    use httpmock::prelude::*;

    #[test]
    fn install_and_remove_hooks() {
        let registry = HookRegistry::new();
        assert!(!registry.is_installed(Platform::MetaPixel));

        registry.install(Platform::MetaPixel, Arc::new(RecordingHook::default()));
        assert!(registry.is_installed(Platform::MetaPixel));
        assert!(!registry.is_installed(Platform::TiktokPixel));

        assert!(registry.remove(Platform::MetaPixel).is_some());
        assert!(!registry.is_installed(Platform::MetaPixel));
    }

    #[test]
    fn forward_hook_needs_a_runtime() {
        let hook = HttpForwardHook::new(
            Platform::MetaPixel,
            "http://localhost:1/never",
            time::Duration::from_secs(1),
        )
        .unwrap();

        assert!(matches!(
            hook.call("track", vec![json!("PageView")]),
            Err(HookError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn forward_hook_posts_the_call() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/relay").json_body(json!({
                "platform": "meta_pixel",
                "global": "fbq",
                "method": "trackSingle",
                "args": ["123", "PageView", {}],
            }));
            then.status(200);
        });

        let hook = HttpForwardHook::new(
            Platform::MetaPixel,
            &server.url("/relay"),
            time::Duration::from_secs(5),
        )
        .unwrap();
        hook.call("trackSingle", vec![json!("123"), json!("PageView"), json!({})])
            .unwrap();

        for _ in 0..50 {
            if mock.hits() == 1 {
                break;
            }
            tokio::time::sleep(time::Duration::from_millis(20)).await;
        }
        mock.assert();
    }
}
