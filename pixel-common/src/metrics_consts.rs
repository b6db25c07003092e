/// Dedup decisions, labelled by event type and outcome (`tracked` / `suppressed`).
pub const DEDUP_DECISIONS_TOTAL: &str = "pixel_dedup_decisions_total";

/// Fingerprints removed by the background sweep.
pub const DEDUP_FINGERPRINTS_SWEPT: &str = "pixel_dedup_fingerprints_swept_total";

/// Session storage failures, labelled by operation.
pub const DEDUP_STORAGE_ERRORS_TOTAL: &str = "pixel_dedup_storage_errors_total";

/// Readiness transitions, labelled by platform and state.
pub const PIXEL_STATE_TRANSITIONS_TOTAL: &str = "pixel_state_transitions_total";

/// `wait_for_ready` calls that hit their deadline.
pub const PIXEL_READY_TIMEOUTS_TOTAL: &str = "pixel_ready_timeouts_total";
