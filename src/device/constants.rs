/**
 * How often (milliseconds) a characteristic that can only be read is polled for a new value.
 */
pub const POLL_INTERVAL: u64 = 100;

/**
 * How long (milliseconds) a single transport operation (connect, discover, subscribe, read) may
 * take before it is reported as failed.
 */
pub const OPERATION_DEADLINE: u64 = 5000;

/**
 * How many inputs (transport events + user commands) may be queued for the session loop.
 */
pub const INPUT_CHANNEL_SIZE: usize = 128;

/**
 * Multiply a value in pounds by this factor to get kilograms.
 */
pub const LB_TO_KG: f64 = 0.453592;
