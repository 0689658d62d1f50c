//! Bench stand-ins for the sensing and actuator stacks, used by the
//! binary when no hardware is attached and by the tests to script
//! readings.

use std::sync::Mutex;

use anyhow::{bail, Result};

use crate::actuators::{ActuatorSink, Channel};
use crate::sensors::{Attitude, Position, TelemetrySource};

struct SimReadings {
    attitude: Attitude,
    position: Position,
    battery_voltage: f32,
    calibrated: bool,
}

pub struct SimSensors {
    readings: Mutex<SimReadings>,
}

impl SimSensors {
    pub fn new() -> Self {
        Self {
            readings: Mutex::new(SimReadings {
                attitude: Attitude::default(),
                position: Position::default(),
                battery_voltage: 15.8,
                calibrated: true,
            }),
        }
    }

    pub fn set_attitude(&self, attitude: Attitude) {
        self.lock().attitude = attitude;
    }

    pub fn set_position(&self, position: Position) {
        self.lock().position = position;
    }

    pub fn set_battery_voltage(&self, volts: f32) {
        self.lock().battery_voltage = volts;
    }

    pub fn set_calibrated(&self, calibrated: bool) {
        self.lock().calibrated = calibrated;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimReadings> {
        match self.readings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SimSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SimSensors {
    fn attitude(&self) -> Attitude {
        self.lock().attitude
    }

    fn position(&self) -> Position {
        self.lock().position
    }

    fn battery_voltage(&self) -> f32 {
        self.lock().battery_voltage
    }

    fn calibrated(&self) -> bool {
        self.lock().calibrated
    }
}

pub struct SimActuators {
    channels: Mutex<[u16; 4]>,
    fail_init: bool,
}

impl SimActuators {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new([0; 4]),
            fail_init: false,
        }
    }

    /// Stand-in whose `init` always fails, for exercising the error
    /// path to the terminal state.
    pub fn failing() -> Self {
        Self {
            channels: Mutex::new([0; 4]),
            fail_init: true,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [u16; 4]> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SimActuators {
    fn default() -> Self {
        Self::new()
    }
}

impl ActuatorSink for SimActuators {
    fn init(&self) -> Result<()> {
        if self.fail_init {
            bail!("Actuator stage unavailable");
        }
        self.all_stop();
        Ok(())
    }

    fn set_output(&self, channel: Channel, value: u16) {
        self.lock()[channel.index()] = value;
    }

    fn output(&self, channel: Channel) -> u16 {
        self.lock()[channel.index()]
    }

    fn all_stop(&self) {
        *self.lock() = [0; 4];
    }
}
