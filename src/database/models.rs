/// Channel number recorded for the baseline sample taken with all outputs off.
pub const ZERO_CAL_CHANNEL: i32 = -1;

/// One characterization session of a single driver board.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: i64,
    pub name: String,
    pub uut_mac: u32,
    pub created: f64, // unix timestamp in fractional seconds
}

/// One oversampled probe reading at a commanded duty cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub run_id: i64,
    pub channel: i32,
    pub duty_cycle: f64,
    pub voltage: f64,
    pub voltage_stdev: f64,
}
