use anyhow::Result;

/// Actuator channels, four outputs in raw units 0..=4095.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Ailerons,
    Elevator,
    Rudder,
    Motor,
}

pub const CHANNELS: [Channel; 4] = [Channel::Ailerons, Channel::Elevator, Channel::Rudder, Channel::Motor];

impl Channel {
    pub fn index(self) -> usize {
        match self {
            Channel::Ailerons => 0,
            Channel::Elevator => 1,
            Channel::Rudder => 2,
            Channel::Motor => 3,
        }
    }
}

/// Narrow write interface over the actuator stage. Implementations own
/// the pulse generation; the control loop only sets channel values.
pub trait ActuatorSink: Send + Sync {
    /// Brings the output stage to a known, stopped state.
    fn init(&self) -> Result<()>;

    fn set_output(&self, channel: Channel, value: u16);

    fn output(&self, channel: Channel) -> u16;

    /// Immediately forces every channel to zero.
    fn all_stop(&self);
}
