/// Canonical events received, labelled by event type.
pub const EVENTS_RECEIVED_TOTAL: &str = "pixel_events_received_total";

/// Per-destination dispatch results, labelled by platform and outcome
/// (`sent`, `unavailable`, `unsupported`, `failed`).
pub const DISPATCH_RESULTS_TOTAL: &str = "pixel_dispatch_results_total";

/// Time spent fanning one event out to every destination.
pub const DISPATCH_DURATION_SECONDS: &str = "pixel_dispatch_duration_seconds";

/// Price or quantity values replaced by a safe default, labelled by field.
pub const SANITIZED_VALUES_TOTAL: &str = "pixel_sanitized_values_total";

/// Catalog snapshots received, labelled by outcome (`synced`, `unchanged`).
pub const CATALOG_SYNCS_TOTAL: &str = "pixel_catalog_syncs_total";

/// Calls forwarded by HTTP hooks, labelled by platform and outcome.
pub const HOOK_FORWARDS_TOTAL: &str = "pixel_hook_forwards_total";

/// First-party analytics posts, labelled by kind and outcome.
pub const ANALYTICS_POSTS_TOTAL: &str = "pixel_analytics_posts_total";

/// Session trackers currently cached.
pub const ACTIVE_SESSIONS: &str = "pixel_active_sessions";
