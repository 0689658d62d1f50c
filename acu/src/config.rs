use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

const CONFIG_FILE: &str = "acu";

/// Proportional, integral and derivative gains for one axis.
#[derive(Deserialize, Default, Copy, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl PidGains {
    pub fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
        }
    }
}

/// Gains for the four controlled axes.
#[derive(Deserialize, Copy, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PidConfig {
    pub roll: PidGains,
    pub pitch: PidGains,
    pub yaw: PidGains,
    pub altitude: PidGains,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            roll: PidGains::new(1.0, 0.0, 0.2),
            pitch: PidGains::new(1.0, 0.0, 0.2),
            yaw: PidGains::new(2.0, 0.0, 0.0),
            altitude: PidGains::new(1.0, 0.1, 0.1),
        }
    }
}

/// Interlock thresholds consumed by the state machine and the control
/// loop.
#[derive(Deserialize, Copy, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SafetyConfig {
    /// Volts; below this the aircraft goes to emergency.
    pub min_battery_voltage: f32,
    /// Degrees of roll or pitch beyond which flight is unsafe.
    pub max_safe_angle: f32,
    /// Minimum stay in emergency before recovery is considered.
    pub emergency_dwell_ms: u64,
    /// Raw thrust above which an armed aircraft counts as flying.
    pub takeoff_thrust: u16,
    /// Raw thrust below which altitude hold stays disengaged.
    pub min_throttle: u16,
    /// Differentiate the measurement instead of the error. The default
    /// differentiates the error, which spikes on setpoint steps.
    pub derivative_on_measurement: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_battery_voltage: 14.0,
            max_safe_angle: 45.0,
            emergency_dwell_ms: 5000,
            takeoff_thrust: 1200,
            min_throttle: 100,
            derivative_on_measurement: false,
        }
    }
}

impl SafetyConfig {
    pub fn emergency_dwell(&self) -> Duration {
        Duration::from_millis(self.emergency_dwell_ms)
    }
}

/// Aircraft-side parameters. Loaded once at startup; the rest of the
/// system only ever sees the in-memory value.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AcuConfig {
    /// Identity broadcast in discovery beacons, 8 bytes at most.
    pub drone_id: String,
    pub capabilities: u32,
    pub firmware_version: u16,
    /// Ground station endpoint for everything we send.
    pub gcu_address: String,
    pub gcu_port: u16,
    pub local_port: u16,
    /// Control loop rate in Hz.
    pub control_rate: u32,
    pub telemetry_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub discovery_interval_ms: u64,
    pub link_timeout_ms: u64,
    pub pid: PidConfig,
    pub safety: SafetyConfig,
}

impl Default for AcuConfig {
    fn default() -> Self {
        Self {
            drone_id: "ACU-0001".into(),
            capabilities: 0,
            firmware_version: 1,
            gcu_address: "192.168.1.10".into(),
            gcu_port: airlink::DEFAULT_GCU_PORT,
            local_port: airlink::DEFAULT_ACU_PORT,
            control_rate: 200,
            telemetry_interval_ms: airlink::TELEMETRY_INTERVAL.as_millis() as u64,
            heartbeat_interval_ms: airlink::HEARTBEAT_INTERVAL.as_millis() as u64,
            discovery_interval_ms: airlink::DISCOVERY_INTERVAL.as_millis() as u64,
            link_timeout_ms: airlink::LINK_TIMEOUT.as_millis() as u64,
            pid: PidConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

impl AcuConfig {
    /// Reads `acu.toml` when present, overlaid with `ACU__*` environment
    /// variables. Missing file and variables leave the defaults.
    pub fn load() -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix("ACU").separator("__"))
            .build()
            .context("Cannot read configuration")?
            .try_deserialize()
            .context("Cannot parse configuration")
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.control_rate.max(1)))
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AcuConfig::default();
        assert_eq!(config.local_port, 5760);
        assert_eq!(config.gcu_port, 5761);
        assert_eq!(config.control_rate, 200);
        assert_eq!(config.control_period(), Duration::from_millis(5));
        assert_eq!(config.link_timeout(), Duration::from_millis(500));
        assert_eq!(config.safety.min_battery_voltage, 14.0);
        assert_eq!(config.safety.max_safe_angle, 45.0);
        assert_eq!(config.safety.emergency_dwell(), Duration::from_secs(5));
        assert!(!config.safety.derivative_on_measurement);
        assert_eq!(config.pid.roll, PidGains::new(1.0, 0.0, 0.2));
        assert_eq!(config.pid.yaw, PidGains::new(2.0, 0.0, 0.0));
        assert_eq!(config.pid.altitude, PidGains::new(1.0, 0.1, 0.1));
    }
}
