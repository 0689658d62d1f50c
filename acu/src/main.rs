use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use acu::app::Acu;
use acu::config::AcuConfig;
use acu::sim::{SimActuators, SimSensors};
use airlink::log::Logger;
use airlink::time::Ticker;

fn main() -> Result<()> {
    let mut log_sink = Logger::init();

    let config = AcuConfig::load()?;
    let mut acu = Acu::new(config, Arc::new(SimSensors::new()), Arc::new(SimActuators::new()))?;

    let shutdown = acu.shutdown_flag();
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())
        .context("Cannot register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())
        .context("Cannot register SIGTERM handler")?;

    acu.start()?;

    let mut status = Ticker::new(Duration::from_secs(1));
    while !shutdown.load(Ordering::Relaxed) {
        if status.due(Instant::now()) {
            let telemetry = acu.telemetry();
            log::info!(
                "{:?}: roll {:.1} pitch {:.1} alt {:.1} m battery {:.1} V, link {}",
                acu.state(),
                telemetry.roll,
                telemetry.pitch,
                telemetry.altitude,
                telemetry.battery_voltage,
                if acu.is_connected() { "up" } else { "down" }
            );
        }
        log_sink.handle_logs();
        thread::sleep(Duration::from_millis(10));
    }

    acu.stop();
    log_sink.handle_logs();
    Ok(())
}
