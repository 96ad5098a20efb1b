pub const PIPELINE_STARTED: &str = "event_pipeline_started";
pub const PIPELINE_TIME: &str = "event_pipeline_duration_ms";
pub const PROCESSED_AND_INGESTED: &str = "event_pipeline_processed_and_ingested";
pub const STEP_COMPLETED: &str = "event_pipeline_step_completed";
pub const STEP_TIME: &str = "event_pipeline_step_duration_ms";
pub const STEP_LAST: &str = "event_pipeline_step_last";
pub const STEP_ERROR: &str = "event_pipeline_step_error";
pub const DEAD_LETTER_ADDED: &str = "events_added_to_dead_letter_queue";
pub const DEAD_LETTER_FAILED: &str = "events_dead_letter_queue_failed";
