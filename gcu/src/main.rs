use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use airlink::log::Logger;
use airlink::time::Ticker;
use gcu::comm::{DroneLink, LinkEvent};
use gcu::config::GcuConfig;

fn main() -> Result<()> {
    let mut log_sink = Logger::init();

    let config = GcuConfig::load()?;
    let mut link = DroneLink::new(&config)?;
    log::info!("Ground station listening on {}", link.local_addr());

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())
        .context("Cannot register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())
        .context("Cannot register SIGTERM handler")?;

    link.start(shutdown.clone());

    let mut summary = Ticker::new(Duration::from_secs(1));
    while !shutdown.load(Ordering::Relaxed) {
        for event in link.poll_events() {
            match event {
                LinkEvent::Discovered { id, capabilities } => {
                    log::info!("Discovered aircraft {} (capabilities {:#06x})", id, capabilities)
                },
                LinkEvent::Connected { id, address } => {
                    log::info!("Aircraft {} connected, assigned {}", id, address)
                },
                LinkEvent::Disconnected { id } => log::warn!("Aircraft {} disconnected", id),
                LinkEvent::LinkUp => log::info!("Fleet link up"),
                LinkEvent::LinkDown => log::warn!("Fleet link down"),
            }
        }
        if summary.due(Instant::now()) {
            if let Some(telemetry) = link.latest_telemetry() {
                log::info!(
                    "Telemetry: roll {:.1} pitch {:.1} yaw {:.1} alt {:.1} m battery {:.1} V",
                    telemetry.roll,
                    telemetry.pitch,
                    telemetry.yaw,
                    telemetry.altitude,
                    telemetry.battery_voltage
                );
            }
        }
        log_sink.handle_logs();
        thread::sleep(Duration::from_millis(10));
    }

    link.stop();
    log_sink.handle_logs();
    Ok(())
}
