//! UDP link to the ground station: outbound pacing, the discovery
//! pairing driver and the receive loop.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mio::net::UdpSocket;
use mio::{Interest, Token};

use airlink::polling::Poller;
use airlink::time::{unix_millis, Ticker};
use airlink::{
    AckData, BeaconData, HeartbeatData, LinkMonitor, LinkTransition, OutboundQueue, Packet,
    PacketType, PeerId, SynAckData, SynData, TelemetryData, MAX_DATAGRAM,
};

use crate::config::AcuConfig;
use crate::control::FlightController;

const SOCKET: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const QUEUE_DEPTH: usize = 64;

enum Pairing {
    Unpaired { beacons_sent: u32 },
    Paired { token: u64, address: Ipv4Addr },
}

struct Pacing {
    telemetry: Ticker,
    heartbeat: Ticker,
    discovery: Ticker,
}

struct LinkShared {
    queue: OutboundQueue,
    monitor: Arc<LinkMonitor>,
    controller: Arc<FlightController>,
    pacing: Mutex<Pacing>,
    pairing: Mutex<Pairing>,
    started_at: Instant,
    id: PeerId,
    capabilities: u32,
    firmware_version: u16,
    gcu: SocketAddr,
    link_timeout: Duration,
}

/// Owns the socket towards the ground station. Sending happens through
/// the outbound queue, drained by the receive loop thread so the
/// control thread never touches the socket.
pub struct GroundLink {
    shared: Arc<LinkShared>,
    local: SocketAddr,
    socket: Option<(UdpSocket, Poller)>,
    handle: Option<JoinHandle<()>>,
}

/// Cheap clone of the link state for the control thread.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<LinkShared>,
}

impl GroundLink {
    pub fn new(
        config: &AcuConfig,
        controller: Arc<FlightController>,
        monitor: Arc<LinkMonitor>,
    ) -> Result<Self> {
        let gcu = format!("{}:{}", config.gcu_address, config.gcu_port)
            .parse()
            .context("Invalid ground station address")?;
        let mut socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], config.local_port)))
            .context("Cannot bind local socket")?;
        let local = socket.local_addr().context("Cannot read local socket address")?;
        let mut poller = Poller::new(8)?;
        poller.register(&mut socket, SOCKET, Interest::READABLE)?;

        let shared = Arc::new(LinkShared {
            queue: OutboundQueue::new(QUEUE_DEPTH),
            monitor,
            controller,
            pacing: Mutex::new(Pacing {
                telemetry: Ticker::new(config.telemetry_interval()),
                heartbeat: Ticker::new(config.heartbeat_interval()),
                discovery: Ticker::new(config.discovery_interval()),
            }),
            pairing: Mutex::new(Pairing::Unpaired { beacons_sent: 0 }),
            started_at: Instant::now(),
            id: PeerId::from_str(&config.drone_id),
            capabilities: config.capabilities,
            firmware_version: config.firmware_version,
            gcu,
            link_timeout: config.link_timeout(),
        });

        Ok(Self {
            shared,
            local,
            socket: Some((socket, poller)),
            handle: None,
        })
    }

    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Spawns the receive loop. The loop exits once `stop` turns true.
    pub fn start(&mut self, stop: Arc<AtomicBool>) {
        if self.handle.is_some() {
            return;
        }
        if let Some((socket, poller)) = self.socket.take() {
            let shared = self.shared.clone();
            self.handle = Some(thread::spawn(move || {
                receive_loop(&shared, socket, poller, &stop);
            }));
        }
    }

    /// Blocks until the receive loop has exited and released the
    /// socket. The caller raises the stop flag first.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LinkHandle {
    /// Called once per control iteration: paces telemetry, heartbeat
    /// and discovery traffic and reacts to link transitions.
    pub fn update(&self, telemetry: &TelemetryData) {
        let now = Instant::now();
        let mut pacing = lock(&self.shared.pacing);
        let telemetry_due = pacing.telemetry.due(now);
        let heartbeat_due = pacing.heartbeat.due(now);
        let discovery_due = pacing.discovery.due(now);
        drop(pacing);

        if telemetry_due {
            self.shared.queue.push(self.shared.gcu, Packet::telemetry(telemetry));
        }
        if heartbeat_due {
            let heartbeat = HeartbeatData {
                timestamp: unix_millis(),
                uptime: self.shared.started_at.elapsed().as_secs() as u32,
                ..Default::default()
            };
            self.shared.queue.push(self.shared.gcu, Packet::heartbeat(&heartbeat));
        }
        if discovery_due {
            self.shared.drive_pairing();
        }

        match self.shared.monitor.poll_transition() {
            Some(LinkTransition::Established) => log::info!("Ground link established"),
            Some(LinkTransition::Lost) => {
                log::warn!("Ground link lost");
                self.shared.unpair();
            },
            None => {},
        }
    }

    pub fn is_paired(&self) -> bool {
        matches!(*lock(&self.shared.pairing), Pairing::Paired { .. })
    }
}

impl LinkShared {
    /// One discovery tick. Beacons go out unconditionally so a
    /// restarted ground station rediscovers us; the connection request
    /// only while unpaired, and only after at least one announcement.
    fn drive_pairing(&self) {
        let beacon = BeaconData {
            id: self.id,
            capabilities: self.capabilities,
            version: self.firmware_version,
        };
        self.queue.push(self.gcu, Packet::beacon(&beacon));

        let mut pairing = lock(&self.pairing);
        if let Pairing::Unpaired { beacons_sent } = &mut *pairing {
            if *beacons_sent > 0 {
                self.queue.push(self.gcu, Packet::syn(&SynData { id: self.id }));
            }
            *beacons_sent += 1;
        }
    }

    fn unpair(&self) {
        let mut pairing = lock(&self.pairing);
        if let Pairing::Paired { .. } = *pairing {
            log::info!("Dropping pairing after link loss");
            *pairing = Pairing::Unpaired { beacons_sent: 0 };
        }
    }

    fn handle_ack(&self, ack: &AckData) {
        if ack.id != self.id {
            return;
        }
        let mut pairing = lock(&self.pairing);
        match *pairing {
            Pairing::Unpaired { .. } => {
                *pairing = Pairing::Paired {
                    token: ack.token,
                    address: ack.address,
                };
                drop(pairing);
                self.queue.push(
                    self.gcu,
                    Packet::syn_ack(&SynAckData {
                        id: self.id,
                        token: ack.token,
                    }),
                );
                log::info!("Paired with ground station, assigned address {}", ack.address);
            },
            Pairing::Paired { token, .. } if token == ack.token => {
                // Duplicate of the assignment we already hold: our
                // confirmation was lost, repeat it.
                drop(pairing);
                self.queue.push(
                    self.gcu,
                    Packet::syn_ack(&SynAckData {
                        id: self.id,
                        token: ack.token,
                    }),
                );
            },
            Pairing::Paired { .. } => {
                log::debug!("Ignoring assignment with unknown session token");
            },
        }
    }

    fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping malformed datagram from {}: {}", from, e);
                return;
            },
        };
        match packet.packet_type() {
            Some(PacketType::Control) => match packet.control_data() {
                Ok(control) => {
                    self.monitor.mark_alive();
                    if packet.is_stale(self.link_timeout) {
                        log::debug!("Dropping stale control command");
                    } else {
                        self.controller.submit_command(&control);
                    }
                },
                Err(e) => log::debug!("Dropping control packet: {}", e),
            },
            Some(PacketType::Heartbeat) => match packet.heartbeat_data() {
                Ok(_) => self.monitor.mark_alive(),
                Err(e) => log::debug!("Dropping heartbeat: {}", e),
            },
            Some(PacketType::Config) => match packet.config_data() {
                Ok(config) => self.controller.apply_config(&config),
                Err(e) => log::debug!("Dropping config packet: {}", e),
            },
            Some(PacketType::Ack) => match packet.ack_data() {
                Ok(ack) => self.handle_ack(&ack),
                Err(e) => log::debug!("Dropping ack packet: {}", e),
            },
            _ => log::debug!(
                "Ignoring packet type 0x{:02x} from {}",
                packet.type_tag(),
                from
            ),
        }
    }
}

fn receive_loop(
    shared: &LinkShared,
    mut socket: UdpSocket,
    mut poller: Poller,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while !stop.load(Ordering::Relaxed) {
        while let Some(out) = shared.queue.pop() {
            if let Err(e) = socket.send_to(&out.packet.encode(), out.target) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    log::debug!("Send to {} failed: {}", out.target, e);
                }
            }
        }

        match poller.poll(Some(POLL_TIMEOUT)) {
            Ok(events) => {
                if events.is_empty() {
                    continue;
                }
            },
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<io::Error>() {
                    if io_err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                }
                log::error!("Ground link poll failed: {}", e);
                break;
            },
        }

        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => shared.dispatch(&buf[..len], from),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Receive failed: {}", e);
                    break;
                },
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
