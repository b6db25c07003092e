use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Advertising platforms the storefront can mirror events to.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    GoogleAnalytics,
    GoogleAds,
    MetaPixel,
    TiktokPixel,
    PinterestTag,
    SnapchatPixel,
    TwitterPixel,
    LinkedinInsight,
    MicrosoftUet,
    RedditPixel,
}

impl Platform {
    pub const ALL: [Platform; 10] = [
        Platform::GoogleAnalytics,
        Platform::GoogleAds,
        Platform::MetaPixel,
        Platform::TiktokPixel,
        Platform::PinterestTag,
        Platform::SnapchatPixel,
        Platform::TwitterPixel,
        Platform::LinkedinInsight,
        Platform::MicrosoftUet,
        Platform::RedditPixel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::GoogleAnalytics => "google_analytics",
            Platform::GoogleAds => "google_ads",
            Platform::MetaPixel => "meta_pixel",
            Platform::TiktokPixel => "tiktok_pixel",
            Platform::PinterestTag => "pinterest_tag",
            Platform::SnapchatPixel => "snapchat_pixel",
            Platform::TwitterPixel => "twitter_pixel",
            Platform::LinkedinInsight => "linkedin_insight",
            Platform::MicrosoftUet => "microsoft_uet",
            Platform::RedditPixel => "reddit_pixel",
        }
    }

    /// Name of the entry point the platform's script injects into the page.
    pub fn global_name(&self) -> &'static str {
        match self {
            Platform::GoogleAnalytics | Platform::GoogleAds => "gtag",
            Platform::MetaPixel => "fbq",
            Platform::TiktokPixel => "ttq",
            Platform::PinterestTag => "pintrk",
            Platform::SnapchatPixel => "snaptr",
            Platform::TwitterPixel => "twq",
            Platform::LinkedinInsight => "lintrk",
            Platform::MicrosoftUet => "uetq",
            Platform::RedditPixel => "rdt",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a known platform")]
pub struct UnknownPlatformError(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|platform| platform.as_str() == normalized)
            .ok_or_else(|| UnknownPlatformError(s.to_owned()))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A (platform, account) pair events are dispatched to. Read-only configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelDestination {
    pub platform: Platform,
    pub destination_id: String,
    pub is_enabled: bool,
}

impl PixelDestination {
    pub fn key(&self) -> PixelKey {
        PixelKey::new(self.platform, &self.destination_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PixelKey {
    pub platform: Platform,
    pub destination_id: String,
}

impl PixelKey {
    pub fn new(platform: Platform, destination_id: &str) -> Self {
        Self {
            platform,
            destination_id: destination_id.to_owned(),
        }
    }
}

impl fmt::Display for PixelKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.destination_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_names_round_trip() {
        for platform in Platform::ALL {
            assert_eq!(Platform::from_str(platform.as_str()), Ok(platform));
            assert_eq!(
                serde_json::to_value(platform).unwrap(),
                serde_json::Value::String(platform.to_string())
            );
        }
        assert_eq!(Platform::from_str(" Meta_Pixel "), Ok(Platform::MetaPixel));
        assert!(Platform::from_str("myspace").is_err());
    }

    #[test]
    fn key_display() {
        let destination = PixelDestination {
            platform: Platform::GoogleAds,
            destination_id: "AW-123".to_owned(),
            is_enabled: true,
        };
        assert_eq!(destination.key().to_string(), "google_ads:AW-123");
    }
}
