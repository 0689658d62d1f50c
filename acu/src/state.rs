//! Operational state machine gating arming, takeoff and emergency
//! handling.

use std::time::{Duration, Instant};

use crate::config::SafetyConfig;
use crate::control::FlightController;

/// Top-level operational state. `Error` is terminal and only a process
/// restart leaves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationalState {
    Initializing,
    Calibrating,
    Idle,
    Armed,
    Flying,
    Emergency,
    Error,
}

/// Safety predicate inputs, sampled once per tick by the caller from
/// the link monitor and the sensor collaborators.
#[derive(Clone, Copy, Debug)]
pub struct SafetyConditions {
    pub link_connected: bool,
    pub calibrated: bool,
    pub battery_voltage: f32,
    pub roll: f32,
    pub pitch: f32,
}

/// Drives the operational state once per control tick. All transitions
/// happen here; entering `Armed` arms the control loop and entering
/// `Emergency` or `Error` forces an emergency stop.
pub struct FlightStateMachine {
    state: OperationalState,
    previous: OperationalState,
    entered_at: Instant,
    safety: SafetyConfig,
    link_timeout: Duration,
}

impl FlightStateMachine {
    pub fn new(safety: SafetyConfig, link_timeout: Duration) -> Self {
        Self {
            state: OperationalState::Initializing,
            previous: OperationalState::Initializing,
            entered_at: Instant::now(),
            safety,
            link_timeout,
        }
    }

    pub fn state(&self) -> OperationalState {
        self.state
    }

    pub fn previous(&self) -> OperationalState {
        self.previous
    }

    /// One evaluation: the current state's handler first, then the
    /// emergency predicates in every state except `Emergency` and
    /// `Error` themselves.
    pub fn tick(&mut self, conditions: &SafetyConditions, controller: &FlightController) {
        match self.state {
            OperationalState::Initializing => self.handle_initializing(controller),
            OperationalState::Calibrating => self.handle_calibrating(conditions, controller),
            OperationalState::Idle => self.handle_idle(controller),
            OperationalState::Armed => self.handle_armed(controller),
            OperationalState::Flying => {},
            OperationalState::Emergency => self.handle_emergency(conditions, controller),
            OperationalState::Error => {},
        }

        if self.state != OperationalState::Emergency
            && self.state != OperationalState::Error
            && (!self.predicates_pass(conditions) || controller.is_emergency())
        {
            self.transition(OperationalState::Emergency, controller);
        }
    }

    fn handle_initializing(&mut self, controller: &FlightController) {
        match controller.init() {
            Ok(()) => self.transition(OperationalState::Calibrating, controller),
            Err(e) => {
                log::error!("Flight control initialization failed: {}", e);
                self.transition(OperationalState::Error, controller);
            },
        }
    }

    fn handle_calibrating(&mut self, conditions: &SafetyConditions, controller: &FlightController) {
        if conditions.calibrated {
            self.transition(OperationalState::Idle, controller);
        }
    }

    fn handle_idle(&mut self, controller: &FlightController) {
        if let Some(request) = controller.request() {
            if request.armed && request.received.elapsed() <= self.link_timeout {
                self.transition(OperationalState::Armed, controller);
            }
        }
    }

    fn handle_armed(&mut self, controller: &FlightController) {
        if let Some(request) = controller.request() {
            if request.armed
                && request.thrust > self.safety.takeoff_thrust
                && request.received.elapsed() <= self.link_timeout
            {
                self.transition(OperationalState::Flying, controller);
            }
        }
    }

    fn handle_emergency(&mut self, conditions: &SafetyConditions, controller: &FlightController) {
        if self.entered_at.elapsed() >= self.safety.emergency_dwell()
            && self.predicates_pass(conditions)
        {
            controller.reset();
            self.transition(OperationalState::Idle, controller);
        }
    }

    fn predicates_pass(&self, conditions: &SafetyConditions) -> bool {
        conditions.link_connected
            && conditions.calibrated
            && conditions.battery_voltage >= self.safety.min_battery_voltage
            && conditions.roll.abs() <= self.safety.max_safe_angle
            && conditions.pitch.abs() <= self.safety.max_safe_angle
    }

    fn transition(&mut self, next: OperationalState, controller: &FlightController) {
        if next == self.state {
            return;
        }
        self.previous = self.state;
        self.state = next;
        self.entered_at = Instant::now();
        log::info!("Flight state {:?} -> {:?}", self.previous, self.state);
        match self.state {
            OperationalState::Armed => controller.arm(),
            OperationalState::Emergency | OperationalState::Error => controller.emergency_stop(),
            _ => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use airlink::time::unix_millis;
    use airlink::ControlData;

    use crate::config::AcuConfig;
    use crate::sim::{SimActuators, SimSensors};

    fn make_controller() -> FlightController {
        let config = AcuConfig::default();
        FlightController::new(
            &config.pid,
            config.safety,
            Arc::new(SimSensors::new()),
            Arc::new(SimActuators::new()),
        )
    }

    fn good_conditions() -> SafetyConditions {
        SafetyConditions {
            link_connected: true,
            calibrated: true,
            battery_voltage: 15.8,
            roll: 0.0,
            pitch: 0.0,
        }
    }

    fn short_dwell() -> SafetyConfig {
        SafetyConfig {
            emergency_dwell_ms: 50,
            ..SafetyConfig::default()
        }
    }

    fn command(armed: bool, thrust: u16) -> ControlData {
        ControlData {
            armed,
            thrust,
            timestamp: unix_millis(),
            ..Default::default()
        }
    }

    #[test]
    fn battery_dip_trips_and_recovers() {
        let controller = make_controller();
        let mut machine = FlightStateMachine::new(short_dwell(), Duration::from_millis(500));
        let good = good_conditions();
        machine.tick(&good, &controller);
        machine.tick(&good, &controller);
        assert_eq!(machine.state(), OperationalState::Idle);

        let low = SafetyConditions {
            battery_voltage: 13.9,
            ..good
        };
        machine.tick(&low, &controller);
        assert_eq!(machine.state(), OperationalState::Emergency);
        assert_eq!(machine.previous(), OperationalState::Idle);
        assert!(controller.is_emergency());

        // Restored supply alone is not enough before the dwell passes.
        let restored = SafetyConditions {
            battery_voltage: 14.5,
            ..good
        };
        machine.tick(&restored, &controller);
        assert_eq!(machine.state(), OperationalState::Emergency);

        thread::sleep(Duration::from_millis(60));
        machine.tick(&restored, &controller);
        assert_eq!(machine.state(), OperationalState::Idle);
        assert!(!controller.is_emergency());
    }

    #[test]
    fn arm_request_and_takeoff() {
        let controller = make_controller();
        let mut machine =
            FlightStateMachine::new(SafetyConfig::default(), Duration::from_millis(500));
        let good = good_conditions();
        machine.tick(&good, &controller);
        machine.tick(&good, &controller);
        assert_eq!(machine.state(), OperationalState::Idle);

        controller.submit_command(&command(true, 0));
        machine.tick(&good, &controller);
        assert_eq!(machine.state(), OperationalState::Armed);
        assert!(controller.is_armed());

        controller.submit_command(&command(true, 1500));
        machine.tick(&good, &controller);
        assert_eq!(machine.state(), OperationalState::Flying);
    }

    #[test]
    fn stale_arm_request_is_ignored() {
        let controller = make_controller();
        let mut machine =
            FlightStateMachine::new(SafetyConfig::default(), Duration::from_millis(50));
        let good = good_conditions();
        machine.tick(&good, &controller);
        machine.tick(&good, &controller);
        assert_eq!(machine.state(), OperationalState::Idle);

        controller.submit_command(&command(true, 0));
        thread::sleep(Duration::from_millis(80));
        machine.tick(&good, &controller);
        assert_eq!(machine.state(), OperationalState::Idle);
    }

    #[test]
    fn failed_init_is_terminal() {
        let config = AcuConfig::default();
        let controller = FlightController::new(
            &config.pid,
            config.safety,
            Arc::new(SimSensors::new()),
            Arc::new(SimActuators::failing()),
        );
        let mut machine =
            FlightStateMachine::new(SafetyConfig::default(), Duration::from_millis(500));
        let good = good_conditions();
        machine.tick(&good, &controller);
        assert_eq!(machine.state(), OperationalState::Error);

        for _ in 0..3 {
            machine.tick(&good, &controller);
        }
        assert_eq!(machine.state(), OperationalState::Error);
    }

    #[test]
    fn uncalibrated_boot_holds_in_emergency() {
        let controller = make_controller();
        let mut machine = FlightStateMachine::new(short_dwell(), Duration::from_millis(500));
        let uncalibrated = SafetyConditions {
            calibrated: false,
            ..good_conditions()
        };
        machine.tick(&uncalibrated, &controller);
        assert_eq!(machine.state(), OperationalState::Emergency);
        assert_eq!(machine.previous(), OperationalState::Calibrating);

        thread::sleep(Duration::from_millis(60));
        machine.tick(&good_conditions(), &controller);
        assert_eq!(machine.state(), OperationalState::Idle);
    }

    #[test]
    fn link_loss_aborts_flight() {
        let controller = make_controller();
        let mut machine =
            FlightStateMachine::new(SafetyConfig::default(), Duration::from_millis(500));
        let good = good_conditions();
        machine.tick(&good, &controller);
        machine.tick(&good, &controller);
        controller.submit_command(&command(true, 0));
        machine.tick(&good, &controller);
        controller.submit_command(&command(true, 1500));
        machine.tick(&good, &controller);
        assert_eq!(machine.state(), OperationalState::Flying);

        let lost = SafetyConditions {
            link_connected: false,
            ..good
        };
        machine.tick(&lost, &controller);
        assert_eq!(machine.state(), OperationalState::Emergency);
        assert!(!controller.is_armed());
    }
}
