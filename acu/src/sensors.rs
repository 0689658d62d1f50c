/// Attitude in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// Position in decimal degrees and meters above ground.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f32,
}

/// Narrow read interface over whatever sensing stack the aircraft
/// carries. Implementations own their hardware I/O and calibration;
/// the control side only samples.
pub trait TelemetrySource: Send + Sync {
    fn attitude(&self) -> Attitude;

    fn position(&self) -> Position;

    fn battery_voltage(&self) -> f32;

    fn calibrated(&self) -> bool;
}
