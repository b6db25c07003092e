pub mod event;
pub mod fingerprint;
pub mod metrics;
pub mod metrics_consts;
pub mod platform;
pub mod readiness;
pub mod retry;
pub mod storage;
pub mod time;
