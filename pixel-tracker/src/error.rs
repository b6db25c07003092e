use pixel_common::platform::Platform;
use thiserror::Error;

/// Failures raised by an injected platform entry point.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("platform call was rejected: {0}")]
    Rejected(String),
    #[error("no async runtime available to forward the call")]
    NoRuntime,
}

/// Failures while handing a canonical event to one destination. Never propagated past the
/// fan-out: each one is logged and counted against its destination only.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{platform} call `{method}` failed: {source}")]
    Hook {
        platform: Platform,
        method: String,
        #[source]
        source: HookError,
    },
    #[error("no adapter registered for {0}")]
    NoAdapter(Platform),
}

/// Failures while loading the destination configuration.
#[derive(Error, Debug)]
pub enum DestinationError {
    #[error("invalid destination entry {0:?}, expected platform=id")]
    InvalidEntry(String),
    #[error(transparent)]
    UnknownPlatform(#[from] pixel_common::platform::UnknownPlatformError),
    #[error("failed to load destinations: {0}")]
    Source(String),
}

/// Invalid values in the environment configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid hook endpoint {0:?}, expected platform=http(s)://url")]
    InvalidHookEndpoint(String),
    #[error(transparent)]
    UnknownPlatform(#[from] pixel_common::platform::UnknownPlatformError),
}
