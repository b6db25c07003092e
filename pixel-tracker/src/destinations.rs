//! Where the list of pixel destinations comes from.
use std::str::FromStr;

use async_trait::async_trait;
use pixel_common::platform::{PixelDestination, Platform};

use crate::error::DestinationError;

#[async_trait]
pub trait DestinationSource: Send + Sync {
    /// Every configured destination, disabled ones included.
    async fn load(&self) -> Result<Vec<PixelDestination>, DestinationError>;
}

/// Destinations parsed from `platform=id` pairs separated by commas. A leading `!` keeps the
/// destination configured but disabled: `meta_pixel=123,!tiktok_pixel=ABC`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationList(pub Vec<PixelDestination>);

impl FromStr for DestinationList {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut destinations = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (is_enabled, pair) = match entry.strip_prefix('!') {
                Some(rest) => (false, rest),
                None => (true, entry),
            };
            let Some((platform, id)) = pair.split_once('=') else {
                return Err(DestinationError::InvalidEntry(entry.to_owned()));
            };
            let id = id.trim();
            if id.is_empty() {
                return Err(DestinationError::InvalidEntry(entry.to_owned()));
            }
            destinations.push(PixelDestination {
                platform: Platform::from_str(platform)?,
                destination_id: id.to_owned(),
                is_enabled,
            });
        }
        Ok(DestinationList(destinations))
    }
}

impl DestinationList {
    pub fn enabled(&self) -> impl Iterator<Item = &PixelDestination> {
        self.0.iter().filter(|d| d.is_enabled)
    }
}

/// A fixed destination list, typically read from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticDestinations {
    destinations: Vec<PixelDestination>,
}

impl StaticDestinations {
    pub fn new(destinations: Vec<PixelDestination>) -> Self {
        Self { destinations }
    }
}

impl From<DestinationList> for StaticDestinations {
    fn from(list: DestinationList) -> Self {
        Self::new(list.0)
    }
}

#[async_trait]
impl DestinationSource for StaticDestinations {
    async fn load(&self) -> Result<Vec<PixelDestination>, DestinationError> {
        Ok(self.destinations.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_destination_list() {
        let list: DestinationList =
            " meta_pixel=123, !tiktok_pixel=ABC ,google_ads=AW-1/label,"
                .parse()
                .unwrap();

        assert_eq!(
            list.0,
            vec![
                PixelDestination {
                    platform: Platform::MetaPixel,
                    destination_id: "123".to_owned(),
                    is_enabled: true,
                },
                PixelDestination {
                    platform: Platform::TiktokPixel,
                    destination_id: "ABC".to_owned(),
                    is_enabled: false,
                },
                PixelDestination {
                    platform: Platform::GoogleAds,
                    destination_id: "AW-1/label".to_owned(),
                    is_enabled: true,
                },
            ]
        );
        assert_eq!(list.enabled().count(), 2);
    }

    #[test]
    fn empty_list_is_valid() {
        assert_eq!("".parse::<DestinationList>().unwrap(), DestinationList::default());
    }

    #[test]
    fn rejects_bad_entries() {
        assert!(matches!(
            "meta_pixel".parse::<DestinationList>(),
            Err(DestinationError::InvalidEntry(_))
        ));
        assert!(matches!(
            "meta_pixel=".parse::<DestinationList>(),
            Err(DestinationError::InvalidEntry(_))
        ));
        assert!(matches!(
            "myspace=1".parse::<DestinationList>(),
            Err(DestinationError::UnknownPlatform(_))
        ));
    }

    #[tokio::test]
    async fn static_source_returns_everything() {
        let source = StaticDestinations::from(
            "meta_pixel=1,!reddit_pixel=t2".parse::<DestinationList>().unwrap(),
        );
        assert_eq!(source.load().await.unwrap().len(), 2);
    }
}
