pub mod adapters;
pub mod analytics;
pub mod api;
pub mod catalog;
pub mod config;
pub mod destinations;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod metrics_consts;
pub mod router;
pub mod server;
pub mod sessions;
pub mod test_utils;
pub mod tracker;
