//! Wires the control loop, state machine and ground link together and
//! owns their threads.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ScheduleParams, ThreadBuilder, ThreadPriority,
    ThreadSchedulePolicy,
};

use airlink::{LinkMonitor, TelemetryData};

use crate::actuators::ActuatorSink;
use crate::comm::{GroundLink, LinkHandle};
use crate::config::AcuConfig;
use crate::control::FlightController;
use crate::sensors::TelemetrySource;
use crate::state::{FlightStateMachine, OperationalState, SafetyConditions};

/// The aircraft-side application: a realtime control thread plus the
/// ground link's receive loop, stopped together through one shared
/// flag.
pub struct Acu {
    link: GroundLink,
    controller: Arc<FlightController>,
    monitor: Arc<LinkMonitor>,
    sensors: Arc<dyn TelemetrySource>,
    actuators: Arc<dyn ActuatorSink>,
    machine: Arc<Mutex<FlightStateMachine>>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
    control: Option<JoinHandle<()>>,
}

impl Acu {
    pub fn new(
        config: AcuConfig,
        sensors: Arc<dyn TelemetrySource>,
        actuators: Arc<dyn ActuatorSink>,
    ) -> Result<Self> {
        let monitor = Arc::new(LinkMonitor::new(config.link_timeout()));
        let controller = Arc::new(FlightController::new(
            &config.pid,
            config.safety,
            sensors.clone(),
            actuators.clone(),
        ));
        let link = GroundLink::new(&config, controller.clone(), monitor.clone())?;
        let machine = Arc::new(Mutex::new(FlightStateMachine::new(
            config.safety,
            config.link_timeout(),
        )));

        Ok(Self {
            link,
            controller,
            monitor,
            sensors,
            actuators,
            machine,
            period: config.control_period(),
            shutdown: Arc::new(AtomicBool::new(false)),
            control: None,
        })
    }

    /// Starts the receive loop and the realtime control thread.
    pub fn start(&mut self) -> Result<()> {
        if self.control.is_some() {
            return Ok(());
        }
        self.link.start(self.shutdown.clone());

        let controller = self.controller.clone();
        let monitor = self.monitor.clone();
        let sensors = self.sensors.clone();
        let machine = self.machine.clone();
        let link = self.link.handle();
        let period = self.period;
        let stop = self.shutdown.clone();
        let handle = ThreadBuilder::default()
            .name("control")
            .policy(ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo))
            .priority(ThreadPriority::from_posix(ScheduleParams {
                sched_priority: 40,
            }))
            .spawn_careless(move || {
                control_loop(&controller, &monitor, &*sensors, &machine, &link, period, &stop);
            })
            .context("Cannot spawn control thread")?;
        self.control = Some(handle);
        log::info!("Flight systems started, control link on {}", self.link.local_addr());
        Ok(())
    }

    /// Raises the stop flag and blocks until both loops have exited,
    /// then forces the actuator stage to neutral.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.control.take() {
            let _ = handle.join();
        }
        self.link.stop();
        self.actuators.all_stop();
        log::info!("Flight systems stopped");
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.local_addr()
    }

    pub fn state(&self) -> OperationalState {
        lock(&self.machine).state()
    }

    pub fn telemetry(&self) -> TelemetryData {
        self.controller.telemetry()
    }

    pub fn is_connected(&self) -> bool {
        self.monitor.is_connected()
    }
}

fn control_loop(
    controller: &FlightController,
    monitor: &LinkMonitor,
    sensors: &dyn TelemetrySource,
    machine: &Mutex<FlightStateMachine>,
    link: &LinkHandle,
    period: Duration,
    stop: &AtomicBool,
) {
    let dt = period.as_secs_f32();
    while !stop.load(Ordering::Relaxed) {
        let started = Instant::now();

        let telemetry = controller.refresh_telemetry();
        let conditions = SafetyConditions {
            link_connected: monitor.is_connected(),
            calibrated: sensors.calibrated(),
            battery_voltage: telemetry.battery_voltage,
            roll: telemetry.roll,
            pitch: telemetry.pitch,
        };
        lock(machine).tick(&conditions, controller);
        controller.tick(dt);
        link.update(&telemetry);

        if let Some(remaining) = period.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
