//! Fixed-rate PID attitude and altitude control with the safety
//! interlocks that gate it.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use airlink::time::unix_millis;
use airlink::{ConfigData, ControlData, TelemetryData};

use crate::actuators::{ActuatorSink, Channel};
use crate::config::{PidConfig, PidGains, SafetyConfig};
use crate::sensors::TelemetrySource;

/// Anti-windup bound on every integral accumulator.
pub const MAX_INTEGRAL: f32 = 20.0;

const AXIS_CENTER: f32 = 2048.0;
const AXIS_MAX: u16 = 4095;

struct AxisPid {
    gains: PidGains,
    integral: f32,
    last_error: f32,
    last_measurement: f32,
}

impl AxisPid {
    fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_error: 0.0,
            last_measurement: 0.0,
        }
    }

    /// One control step. The derivative differentiates the error by
    /// default; `on_measurement` switches it to the measurement, which
    /// does not spike when the setpoint steps.
    fn update(&mut self, error: f32, measurement: f32, dt: f32, on_measurement: bool) -> f32 {
        self.integral = (self.integral + error * dt).clamp(-MAX_INTEGRAL, MAX_INTEGRAL);
        let derivative = if dt > 0.0 {
            if on_measurement {
                -(measurement - self.last_measurement) / dt
            } else {
                (error - self.last_error) / dt
            }
        } else {
            0.0
        };
        self.last_error = error;
        self.last_measurement = measurement;
        self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative
    }

    fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_measurement = 0.0;
    }
}

#[derive(Clone, Copy, Default)]
struct Targets {
    roll: f32,
    pitch: f32,
    yaw: f32,
    thrust: u16,
}

/// Intent flags of the latest received command. Recorded on every
/// submission, armed or not, so the state machine can see arm and stop
/// requests while the axes themselves are discarded.
#[derive(Clone, Copy, Debug)]
pub struct CommandRequest {
    pub armed: bool,
    pub emergency_stop: bool,
    pub thrust: u16,
    pub received: Instant,
}

struct ControlState {
    armed: bool,
    emergency: bool,
    targets: Targets,
    request: Option<CommandRequest>,
    roll: AxisPid,
    pitch: AxisPid,
    yaw: AxisPid,
    altitude: AxisPid,
    altitude_hold: Option<f32>,
    snapshot: TelemetryData,
}

impl ControlState {
    fn new(pid: &PidConfig) -> Self {
        Self {
            armed: false,
            emergency: false,
            targets: Targets::default(),
            request: None,
            roll: AxisPid::new(pid.roll),
            pitch: AxisPid::new(pid.pitch),
            yaw: AxisPid::new(pid.yaw),
            altitude: AxisPid::new(pid.altitude),
            altitude_hold: None,
            snapshot: TelemetryData::default(),
        }
    }

    fn reset(&mut self) {
        self.armed = false;
        self.emergency = false;
        self.targets = Targets::default();
        self.request = None;
        self.roll.reset();
        self.pitch.reset();
        self.yaw.reset();
        self.altitude.reset();
        self.altitude_hold = None;
    }
}

/// The control loop state shared between the control thread, the
/// receive loop and the state machine. The lock is never held across
/// sensor or actuator calls.
pub struct FlightController {
    sensors: Arc<dyn TelemetrySource>,
    actuators: Arc<dyn ActuatorSink>,
    safety: SafetyConfig,
    state: Mutex<ControlState>,
}

impl FlightController {
    pub fn new(
        pid: &PidConfig,
        safety: SafetyConfig,
        sensors: Arc<dyn TelemetrySource>,
        actuators: Arc<dyn ActuatorSink>,
    ) -> Self {
        Self {
            sensors,
            actuators,
            safety,
            state: Mutex::new(ControlState::new(pid)),
        }
    }

    /// Brings the actuator stage up and clears every flag and PID
    /// accumulator. Also serves as the re-init after an emergency
    /// recovery.
    pub fn init(&self) -> anyhow::Result<()> {
        self.actuators.init()?;
        self.lock().reset();
        Ok(())
    }

    /// Clears flags and PID state without touching the actuator stage.
    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn arm(&self) {
        let mut state = self.lock();
        if state.emergency {
            log::warn!("Refusing to arm while in emergency");
            return;
        }
        if !state.armed {
            state.armed = true;
            log::info!("Control loop armed");
        }
    }

    pub fn disarm(&self) {
        self.lock().armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    pub fn is_emergency(&self) -> bool {
        self.lock().emergency
    }

    pub fn request(&self) -> Option<CommandRequest> {
        self.lock().request
    }

    /// Latest received command. The intent flags are always recorded;
    /// the axis targets only move while armed and not in emergency.
    pub fn submit_command(&self, cmd: &ControlData) {
        let mut state = self.lock();
        state.request = Some(CommandRequest {
            armed: cmd.armed,
            emergency_stop: cmd.emergency_stop,
            thrust: cmd.thrust.min(AXIS_MAX),
            received: Instant::now(),
        });
        if state.armed && !state.emergency {
            let angle_scale = self.safety.max_safe_angle / AXIS_CENTER;
            state.targets.roll = (f32::from(cmd.ailerons.min(AXIS_MAX)) - AXIS_CENTER) * angle_scale;
            state.targets.pitch = (f32::from(cmd.elevator.min(AXIS_MAX)) - AXIS_CENTER) * angle_scale;
            state.targets.yaw = (f32::from(cmd.rudder.min(AXIS_MAX)) - AXIS_CENTER) * (180.0 / AXIS_CENTER);
            state.targets.thrust = cmd.thrust.min(AXIS_MAX);
        }
        drop(state);
        if cmd.emergency_stop {
            self.emergency_stop();
        }
    }

    /// Idempotent. Forces every channel to zero, disarms and latches
    /// the emergency flag for the state machine to observe.
    pub fn emergency_stop(&self) {
        let mut state = self.lock();
        let first = !state.emergency;
        state.emergency = true;
        state.armed = false;
        state.targets = Targets::default();
        state.altitude_hold = None;
        drop(state);
        self.actuators.all_stop();
        if first {
            log::warn!("Emergency stop engaged");
        }
    }

    /// One control step of `dt` seconds. No-op unless armed and not in
    /// emergency; the safety interlock runs before any output.
    pub fn tick(&self, dt: f32) {
        let attitude = self.sensors.attitude();
        let battery = self.sensors.battery_voltage();
        let altitude = self.sensors.position().altitude;

        let mut state = self.lock();
        if !state.armed || state.emergency {
            return;
        }

        if battery < self.safety.min_battery_voltage
            || attitude.roll.abs() > self.safety.max_safe_angle
            || attitude.pitch.abs() > self.safety.max_safe_angle
        {
            drop(state);
            log::warn!(
                "Safety violation: battery {:.2} V, roll {:.1} deg, pitch {:.1} deg",
                battery,
                attitude.roll,
                attitude.pitch
            );
            self.emergency_stop();
            return;
        }

        let on_measurement = self.safety.derivative_on_measurement;
        let roll_error = state.targets.roll - attitude.roll;
        let pitch_error = state.targets.pitch - attitude.pitch;
        let yaw_error = state.targets.yaw - attitude.yaw;
        let roll_out = state.roll.update(roll_error, attitude.roll, dt, on_measurement);
        let pitch_out = state.pitch.update(pitch_error, attitude.pitch, dt, on_measurement);
        let yaw_out = state.yaw.update(yaw_error, attitude.yaw, dt, on_measurement);

        let thrust = state.targets.thrust;
        let motor = if thrust > self.safety.min_throttle {
            let hold = *state.altitude_hold.get_or_insert(altitude);
            let altitude_out = state.altitude.update(hold - altitude, altitude, dt, on_measurement);
            (f32::from(thrust) + altitude_out).clamp(0.0, f32::from(AXIS_MAX)) as u16
        } else {
            state.altitude_hold = None;
            thrust
        };
        drop(state);

        self.actuators.set_output(Channel::Ailerons, centered(roll_out));
        self.actuators.set_output(Channel::Elevator, centered(pitch_out));
        self.actuators.set_output(Channel::Rudder, centered(yaw_out));
        self.actuators.set_output(Channel::Motor, motor);
    }

    /// Rebuilds the telemetry snapshot from the collaborators. Called
    /// every loop iteration, armed or not, and served to the ground
    /// link from the cache.
    pub fn refresh_telemetry(&self) -> TelemetryData {
        let attitude = self.sensors.attitude();
        let position = self.sensors.position();
        let battery = self.sensors.battery_voltage();
        let snapshot = TelemetryData {
            roll: attitude.roll,
            pitch: attitude.pitch,
            yaw: attitude.yaw,
            latitude: position.latitude,
            longitude: position.longitude,
            altitude: position.altitude,
            battery_voltage: battery,
            ailerons_actual: self.actuators.output(Channel::Ailerons),
            elevator_actual: self.actuators.output(Channel::Elevator),
            rudder_actual: self.actuators.output(Channel::Rudder),
            thrust_actual: self.actuators.output(Channel::Motor),
            timestamp: unix_millis(),
        };
        self.lock().snapshot = snapshot;
        snapshot
    }

    pub fn telemetry(&self) -> TelemetryData {
        self.lock().snapshot
    }

    /// Applies the kp/ki/kd triplets of a configuration packet in
    /// roll, pitch, yaw, altitude order. Accumulators are kept.
    pub fn apply_config(&self, config: &ConfigData) {
        let g = &config.pid_gains;
        let mut state = self.lock();
        state.roll.gains = PidGains::new(g[0], g[1], g[2]);
        state.pitch.gains = PidGains::new(g[3], g[4], g[5]);
        state.yaw.gains = PidGains::new(g[6], g[7], g[8]);
        state.altitude.gains = PidGains::new(g[9], g[10], g[11]);
        drop(state);
        log::info!("Applied new PID gains from configuration packet");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn centered(output: f32) -> u16 {
    (AXIS_CENTER + output).clamp(0.0, f32::from(AXIS_MAX)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcuConfig;
    use crate::sensors::Attitude;
    use crate::sensors::Position;
    use crate::sim::{SimActuators, SimSensors};

    fn rig() -> (Arc<SimSensors>, Arc<SimActuators>, FlightController) {
        let config = AcuConfig::default();
        let sensors = Arc::new(SimSensors::new());
        let actuators = Arc::new(SimActuators::new());
        let controller = FlightController::new(
            &config.pid,
            config.safety,
            sensors.clone() as Arc<dyn TelemetrySource>,
            actuators.clone() as Arc<dyn ActuatorSink>,
        );
        controller.init().unwrap();
        (sensors, actuators, controller)
    }

    fn command(thrust: u16) -> ControlData {
        ControlData {
            thrust,
            armed: true,
            timestamp: unix_millis(),
            ..Default::default()
        }
    }

    #[test]
    fn integral_saturates_at_bound() {
        let mut pid = AxisPid::new(PidGains::new(0.0, 1.0, 0.0));
        let mut previous = 0.0;
        for step in 1..=30 {
            let out = pid.update(5.0, 0.0, 1.0, false);
            if step < 4 {
                assert!(out > previous, "integral must grow until saturation");
            }
            previous = out;
            assert!(pid.integral <= MAX_INTEGRAL);
        }
        assert_eq!(pid.integral, MAX_INTEGRAL);
        assert_eq!(previous, MAX_INTEGRAL);

        let mut pid = AxisPid::new(PidGains::new(0.0, 1.0, 0.0));
        for _ in 0..30 {
            pid.update(-5.0, 0.0, 1.0, false);
        }
        assert_eq!(pid.integral, -MAX_INTEGRAL);
    }

    #[test]
    fn derivative_on_measurement_ignores_setpoint_steps() {
        let mut on_error = AxisPid::new(PidGains::new(0.0, 0.0, 1.0));
        let mut on_measurement = AxisPid::new(PidGains::new(0.0, 0.0, 1.0));
        // Setpoint steps from 0 to 10 while the measurement stays put.
        let spike = on_error.update(10.0, 0.0, 0.1, false);
        let steady = on_measurement.update(10.0, 0.0, 0.1, true);
        assert!(spike > 50.0);
        assert_eq!(steady, 0.0);
    }

    #[test]
    fn centered_neutral_mapping() {
        let (_sensors, actuators, controller) = rig();
        controller.arm();
        controller.submit_command(&command(1500));
        controller.tick(0.005);
        assert_eq!(actuators.output(Channel::Ailerons), 2048);
        assert_eq!(actuators.output(Channel::Elevator), 2048);
        assert_eq!(actuators.output(Channel::Rudder), 2048);
        assert_eq!(actuators.output(Channel::Motor), 1500);
    }

    #[test]
    fn disarmed_commands_keep_intent_only() {
        let (_sensors, actuators, controller) = rig();
        controller.submit_command(&command(3000));
        controller.tick(0.005);
        assert_eq!(actuators.output(Channel::Motor), 0);
        let request = controller.request().unwrap();
        assert!(request.armed);
        assert_eq!(request.thrust, 3000);
    }

    #[test]
    fn command_emergency_stop_flag_is_honored() {
        let (_sensors, actuators, controller) = rig();
        controller.arm();
        controller.submit_command(&command(2000));
        controller.tick(0.005);
        assert_eq!(actuators.output(Channel::Motor), 2000);

        let mut stop = command(2000);
        stop.emergency_stop = true;
        controller.submit_command(&stop);
        assert!(controller.is_emergency());
        assert!(!controller.is_armed());
        assert_eq!(actuators.output(Channel::Motor), 0);

        // Idempotent second stop.
        controller.emergency_stop();
        assert!(controller.is_emergency());
        assert_eq!(actuators.output(Channel::Ailerons), 0);
    }

    #[test]
    fn low_battery_trips_the_interlock() {
        let (sensors, actuators, controller) = rig();
        controller.arm();
        controller.submit_command(&command(2000));
        controller.tick(0.005);
        assert_eq!(actuators.output(Channel::Motor), 2000);

        sensors.set_battery_voltage(13.0);
        controller.tick(0.005);
        assert!(controller.is_emergency());
        assert_eq!(actuators.output(Channel::Motor), 0);
    }

    #[test]
    fn steep_attitude_trips_the_interlock() {
        let (sensors, _actuators, controller) = rig();
        controller.arm();
        controller.submit_command(&command(2000));
        sensors.set_attitude(Attitude {
            roll: 50.0,
            pitch: 0.0,
            yaw: 0.0,
        });
        controller.tick(0.005);
        assert!(controller.is_emergency());
    }

    #[test]
    fn altitude_hold_latches_and_releases() {
        let (sensors, actuators, controller) = rig();
        sensors.set_position(Position {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 50.0,
        });
        controller.arm();
        controller.submit_command(&command(2000));
        controller.tick(0.005);
        assert_eq!(actuators.output(Channel::Motor), 2000);

        // Sinking below the latched altitude pushes the motor up.
        sensors.set_position(Position {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 48.0,
        });
        controller.tick(0.005);
        assert!(actuators.output(Channel::Motor) > 2000);

        // Dropping below the throttle floor releases the hold.
        controller.submit_command(&command(50));
        controller.tick(0.005);
        assert_eq!(actuators.output(Channel::Motor), 50);
    }

    #[test]
    fn config_packet_changes_gains() {
        let (sensors, actuators, controller) = rig();
        sensors.set_attitude(Attitude {
            roll: -10.0,
            pitch: 0.0,
            yaw: 0.0,
        });
        controller.arm();
        controller.submit_command(&command(0));
        // Two ticks settle the derivative term.
        controller.tick(0.005);
        controller.tick(0.005);
        assert_eq!(actuators.output(Channel::Ailerons), 2058);

        let mut config = ConfigData::default();
        config.pid_gains = [2.0, 0.0, 0.0, 1.0, 0.0, 0.2, 2.0, 0.0, 0.0, 1.0, 0.1, 0.1];
        controller.apply_config(&config);
        controller.tick(0.005);
        assert_eq!(actuators.output(Channel::Ailerons), 2068);
    }

    #[test]
    fn init_resets_accumulators() {
        let (sensors, _actuators, controller) = rig();
        sensors.set_attitude(Attitude {
            roll: -10.0,
            pitch: 0.0,
            yaw: 0.0,
        });
        controller.arm();
        controller.submit_command(&command(0));
        controller.tick(0.005);
        controller.emergency_stop();

        controller.init().unwrap();
        assert!(!controller.is_emergency());
        assert!(!controller.is_armed());
        assert!(controller.request().is_none());
    }
}
