//! UDP link to the fleet: heartbeat fan-out, session dispatch and the
//! eviction sweeper.

use std::collections::{HashMap, VecDeque};
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
    ConfigData, ControlData, HeartbeatData, LinkMonitor, LinkTransition, OutboundQueue, Packet,
    PacketType, PeerId, TelemetryData, MAX_DATAGRAM,
};

use crate::config::GcuConfig;
use crate::session::{AddressPool, SessionTable};

const SOCKET: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const QUEUE_DEPTH: usize = 64;
const EVENT_DEPTH: usize = 64;

/// Link happenings the operator loop reports on. Drained in order
/// through [`DroneLink::poll_events`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Discovered { id: PeerId, capabilities: u32 },
    Connected { id: PeerId, address: Ipv4Addr },
    Disconnected { id: PeerId },
    /// Liveness flips track received traffic, not session state, so
    /// they react within the link timeout rather than the session one.
    LinkUp,
    LinkDown,
}

struct GcuShared {
    queue: OutboundQueue,
    monitor: LinkMonitor,
    sessions: Mutex<SessionTable>,
    telemetry: Mutex<HashMap<PeerId, TelemetryData>>,
    latest: Mutex<Option<TelemetryData>>,
    events: Mutex<VecDeque<LinkEvent>>,
    /// Aircraft endpoint used while no session is active.
    fallback: SocketAddr,
    started_at: Instant,
}

/// Owns the socket towards the fleet. Commands go through the outbound
/// queue, drained by the receive loop thread; a second thread sweeps
/// expired sessions.
pub struct DroneLink {
    shared: Arc<GcuShared>,
    local: SocketAddr,
    socket: Option<(UdpSocket, Poller)>,
    receiver: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
    connection_timeout: Duration,
}

impl DroneLink {
    pub fn new(config: &GcuConfig) -> Result<Self> {
        let pool = AddressPool::from_prefix(&config.address_prefix, config.pool_first, config.pool_last)?;
        let fallback = format!("{}:{}", config.drone_address, config.drone_port)
            .parse()
            .context("Invalid aircraft address")?;
        let mut socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], config.local_port)))
            .context("Cannot bind local socket")?;
        let local = socket.local_addr().context("Cannot read local socket address")?;
        let mut poller = Poller::new(8)?;
        poller.register(&mut socket, SOCKET, Interest::READABLE)?;

        let shared = Arc::new(GcuShared {
            queue: OutboundQueue::new(QUEUE_DEPTH),
            monitor: LinkMonitor::new(config.link_timeout()),
            sessions: Mutex::new(SessionTable::new(pool)),
            telemetry: Mutex::new(HashMap::new()),
            latest: Mutex::new(None),
            events: Mutex::new(VecDeque::new()),
            fallback,
            started_at: Instant::now(),
        });

        Ok(Self {
            shared,
            local,
            socket: Some((socket, poller)),
            receiver: None,
            sweeper: None,
            heartbeat_interval: config.heartbeat_interval(),
            sweep_interval: config.discovery_interval(),
            connection_timeout: config.connection_timeout(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Spawns the receive loop and the session sweeper. Both exit once
    /// `stop` turns true.
    pub fn start(&mut self, stop: Arc<AtomicBool>) {
        if self.receiver.is_some() {
            return;
        }
        if let Some((socket, poller)) = self.socket.take() {
            let shared = self.shared.clone();
            let heartbeat_interval = self.heartbeat_interval;
            let receive_stop = stop.clone();
            self.receiver = Some(thread::spawn(move || {
                receive_loop(&shared, socket, poller, heartbeat_interval, &receive_stop);
            }));

            let shared = self.shared.clone();
            let period = self.sweep_interval;
            let timeout = self.connection_timeout;
            self.sweeper = Some(thread::spawn(move || {
                sweep_loop(&shared, period, timeout, &stop);
            }));
        }
    }

    /// Blocks until both threads have exited. The caller raises the
    /// stop flag first.
    pub fn stop(&mut self) {
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
    }

    /// Queues a control command for every active aircraft, or for the
    /// configured address while none is connected.
    pub fn send_control(&self, control: &ControlData) {
        self.shared.fan_out(Packet::control(control));
    }

    pub fn send_config(&self, config: &ConfigData) {
        self.shared.fan_out(Packet::config(config));
    }

    pub fn poll_events(&self) -> Vec<LinkEvent> {
        lock(&self.shared.events).drain(..).collect()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.sessions).any_active()
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.shared.monitor.last_heartbeat()
    }

    pub fn telemetry(&self, id: &PeerId) -> Option<TelemetryData> {
        lock(&self.shared.telemetry).get(id).copied()
    }

    pub fn latest_telemetry(&self) -> Option<TelemetryData> {
        *lock(&self.shared.latest)
    }

    pub fn active_peers(&self) -> Vec<PeerId> {
        lock(&self.shared.sessions).active().map(|session| session.id).collect()
    }
}

impl GcuShared {
    /// Queues `packet` for every active session; with none, for the
    /// fallback address.
    fn fan_out(&self, packet: Packet) {
        let targets: Vec<SocketAddr> = lock(&self.sessions).active().map(|session| session.remote).collect();
        if targets.is_empty() {
            self.queue.push(self.fallback, packet);
            return;
        }
        for target in targets {
            self.queue.push(target, packet.clone());
        }
    }

    fn queue_heartbeats(&self) {
        let heartbeat = HeartbeatData {
            timestamp: unix_millis(),
            uptime: self.started_at.elapsed().as_secs() as u32,
            ..Default::default()
        };
        self.fan_out(Packet::heartbeat(&heartbeat));
    }

    fn push_event(&self, event: LinkEvent) {
        let mut events = lock(&self.events);
        if events.len() == EVENT_DEPTH {
            events.pop_front();
        }
        events.push_back(event);
    }

    fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping malformed datagram from {}: {}", from, e);
                return;
            },
        };
        let now = Instant::now();
        match packet.packet_type() {
            Some(PacketType::Beacon) => match packet.beacon_data() {
                Ok(beacon) => {
                    if lock(&self.sessions).handle_beacon(&beacon, from, now) {
                        log::debug!("Discovered aircraft {} at {}", beacon.id, from);
                        self.push_event(LinkEvent::Discovered {
                            id: beacon.id,
                            capabilities: beacon.capabilities,
                        });
                    }
                },
                Err(e) => log::debug!("Dropping beacon: {}", e),
            },
            Some(PacketType::Syn) => match packet.syn_data() {
                Ok(syn) => {
                    if let Some(ack) = lock(&self.sessions).handle_syn(&syn, now) {
                        log::debug!("Offering {} to {}", ack.address, syn.id);
                        self.queue.push(from, Packet::ack(&ack));
                    }
                },
                Err(e) => log::debug!("Dropping connection request: {}", e),
            },
            Some(PacketType::SynAck) => match packet.syn_ack_data() {
                Ok(syn_ack) => {
                    if let Some(address) = lock(&self.sessions).handle_syn_ack(&syn_ack, now) {
                        self.push_event(LinkEvent::Connected {
                            id: syn_ack.id,
                            address,
                        });
                    }
                },
                Err(e) => log::debug!("Dropping confirmation: {}", e),
            },
            Some(PacketType::Telemetry) => match packet.telemetry_data() {
                Ok(telemetry) => {
                    self.monitor.mark_alive();
                    let id = lock(&self.sessions).touch_addr(from, now);
                    if let Some(id) = id {
                        lock(&self.telemetry).insert(id, telemetry);
                    }
                    *lock(&self.latest) = Some(telemetry);
                },
                Err(e) => log::debug!("Dropping telemetry: {}", e),
            },
            Some(PacketType::Heartbeat) => match packet.heartbeat_data() {
                Ok(_) => {
                    self.monitor.mark_alive();
                    lock(&self.sessions).touch_addr(from, now);
                },
                Err(e) => log::debug!("Dropping heartbeat: {}", e),
            },
            _ => log::debug!(
                "Ignoring packet type 0x{:02x} from {}",
                packet.type_tag(),
                from
            ),
        }
    }

    /// Evicts sessions unseen for longer than `timeout` and reports the
    /// fallout as events.
    fn sweep(&self, timeout: Duration) {
        let evicted = lock(&self.sessions).sweep(timeout, Instant::now());
        if evicted.is_empty() {
            return;
        }
        let mut telemetry = lock(&self.telemetry);
        for eviction in &evicted {
            telemetry.remove(&eviction.id);
        }
        drop(telemetry);
        for eviction in evicted {
            log::debug!("Evicting session {}", eviction.id);
            if eviction.was_active {
                self.push_event(LinkEvent::Disconnected {
                    id: eviction.id,
                });
            }
        }
    }
}

fn receive_loop(
    shared: &GcuShared,
    mut socket: UdpSocket,
    mut poller: Poller,
    heartbeat_interval: Duration,
    stop: &AtomicBool,
) {
    let mut heartbeat = Ticker::new(heartbeat_interval);
    let mut buf = [0u8; MAX_DATAGRAM];
    while !stop.load(Ordering::Relaxed) {
        if heartbeat.due(Instant::now()) {
            shared.queue_heartbeats();
        }
        while let Some(out) = shared.queue.pop() {
            if let Err(e) = socket.send_to(&out.packet.encode(), out.target) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    log::debug!("Send to {} failed: {}", out.target, e);
                }
            }
        }

        match shared.monitor.poll_transition() {
            Some(LinkTransition::Established) => shared.push_event(LinkEvent::LinkUp),
            Some(LinkTransition::Lost) => shared.push_event(LinkEvent::LinkDown),
            None => {},
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
                log::error!("Fleet link poll failed: {}", e);
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

fn sweep_loop(shared: &GcuShared, period: Duration, timeout: Duration, stop: &AtomicBool) {
    let mut cadence = Ticker::new(period);
    while !stop.load(Ordering::Relaxed) {
        if cadence.due(Instant::now()) {
            shared.sweep(timeout);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlink::{BeaconData, SynAckData, SynData};

    fn test_config(drone_port: u16) -> GcuConfig {
        GcuConfig {
            local_port: 0,
            drone_address: "127.0.0.1".into(),
            drone_port,
            heartbeat_interval_ms: 50,
            discovery_interval_ms: 50,
            ..GcuConfig::default()
        }
    }

    /// Plays the aircraft side of the handshake by hand and returns the
    /// assigned address.
    fn handshake(drone: &std::net::UdpSocket, gcu: SocketAddr, id: &str) -> Ipv4Addr {
        let peer = PeerId::from_str(id);
        let beacon = BeaconData {
            id: peer,
            capabilities: 0x0003,
            version: 0x0100,
        };

        let mut buf = [0u8; MAX_DATAGRAM];
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if Instant::now() >= deadline {
                panic!("no address offer received");
            }
            drone.send_to(&Packet::beacon(&beacon).encode(), gcu).unwrap();
            drone.send_to(&Packet::syn(&SynData { id: peer }).encode(), gcu).unwrap();
            let len = match drone.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(_) => continue,
            };
            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(_) => continue,
            };
            if packet.packet_type() == Some(PacketType::Ack) {
                let ack = packet.ack_data().unwrap();
                let confirm = SynAckData {
                    id: peer,
                    token: ack.token,
                };
                drone.send_to(&Packet::syn_ack(&confirm).encode(), gcu).unwrap();
                return ack.address;
            }
        }
    }

    fn expect_packet(drone: &std::net::UdpSocket, wanted: PacketType) -> Packet {
        let mut buf = [0u8; MAX_DATAGRAM];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if Instant::now() >= deadline {
                panic!("no {:?} packet received", wanted);
            }
            let len = match drone.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(_) => continue,
            };
            if let Ok(packet) = Packet::decode(&buf[..len]) {
                if packet.packet_type() == Some(wanted) {
                    return packet;
                }
            }
        }
    }

    #[test]
    fn discovery_handshake_over_loopback() {
        let drone = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        drone.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        let config = test_config(drone.local_addr().unwrap().port());
        let stop = Arc::new(AtomicBool::new(false));
        let mut link = DroneLink::new(&config).unwrap();
        let gcu_addr = SocketAddr::from(([127, 0, 0, 1], link.local_addr().port()));
        link.start(stop.clone());

        let assigned = handshake(&drone, gcu_addr, "drosix-1");
        assert_eq!(assigned, Ipv4Addr::new(172, 16, 0, 100));

        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        while !link.is_connected() {
            if Instant::now() >= deadline {
                panic!("session never activated");
            }
            events.extend(link.poll_events());
            thread::sleep(Duration::from_millis(10));
        }
        events.extend(link.poll_events());
        let id = PeerId::from_str("drosix-1");
        assert!(events.iter().any(|event| matches!(
            event,
            LinkEvent::Discovered { id: seen, .. } if *seen == id
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            LinkEvent::Connected { id: seen, address } if *seen == id && *address == assigned
        )));
        assert_eq!(link.active_peers(), vec![id]);

        // Heartbeats now route to the session endpoint.
        expect_packet(&drone, PacketType::Heartbeat);

        // So do commands.
        let control = ControlData {
            armed: true,
            thrust: 700,
            timestamp: unix_millis(),
            ..Default::default()
        };
        link.send_control(&control);
        let seen = expect_packet(&drone, PacketType::Control);
        assert_eq!(seen.control_data().unwrap().thrust, 700);

        // Telemetry lands in the per-aircraft store.
        let telemetry = TelemetryData {
            battery_voltage: 15.5,
            altitude: 2.5,
            timestamp: unix_millis(),
            ..Default::default()
        };
        drone.send_to(&Packet::telemetry(&telemetry).encode(), gcu_addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        while link.telemetry(&id).is_none() {
            if Instant::now() >= deadline {
                panic!("telemetry never stored");
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(link.telemetry(&id).unwrap().battery_voltage, 15.5);
        assert_eq!(link.latest_telemetry().unwrap().altitude, 2.5);

        stop.store(true, Ordering::Relaxed);
        link.stop();
    }

    #[test]
    fn silent_aircraft_is_evicted_and_its_address_reused() {
        let drone = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        drone.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        let config = GcuConfig {
            link_timeout_ms: 100,
            connection_timeout_ms: 150,
            ..test_config(drone.local_addr().unwrap().port())
        };
        let stop = Arc::new(AtomicBool::new(false));
        let mut link = DroneLink::new(&config).unwrap();
        let gcu_addr = SocketAddr::from(([127, 0, 0, 1], link.local_addr().port()));
        link.start(stop.clone());

        handshake(&drone, gcu_addr, "drosix-1");
        let deadline = Instant::now() + Duration::from_secs(1);
        while !link.is_connected() {
            if Instant::now() >= deadline {
                panic!("session never activated");
            }
            thread::sleep(Duration::from_millis(10));
        }

        // Silence past the session timeout evicts the aircraft.
        let id = PeerId::from_str("drosix-1");
        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            events.extend(link.poll_events());
            let evicted = events.iter().any(|event| matches!(
                event,
                LinkEvent::Disconnected { id: seen } if *seen == id
            ));
            if evicted {
                break;
            }
            if Instant::now() >= deadline {
                panic!("aircraft never evicted");
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!link.is_connected());
        assert!(link.telemetry(&id).is_none());
        // The monitor flags the silence well before the eviction.
        assert!(events.iter().any(|event| matches!(event, LinkEvent::LinkDown)));

        // The freed lease goes to the next aircraft.
        let assigned = handshake(&drone, gcu_addr, "drosix-2");
        assert_eq!(assigned, Ipv4Addr::new(172, 16, 0, 100));

        stop.store(true, Ordering::Relaxed);
        link.stop();
    }

    #[test]
    fn commands_fall_back_to_the_configured_address() {
        let drone = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        drone.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        let config = test_config(drone.local_addr().unwrap().port());
        let stop = Arc::new(AtomicBool::new(false));
        let mut link = DroneLink::new(&config).unwrap();
        link.start(stop.clone());

        // No session yet, so traffic goes to the configured endpoint.
        let control = ControlData {
            thrust: 300,
            timestamp: unix_millis(),
            ..Default::default()
        };
        link.send_control(&control);
        let seen = expect_packet(&drone, PacketType::Control);
        assert_eq!(seen.control_data().unwrap().thrust, 300);
        expect_packet(&drone, PacketType::Heartbeat);

        stop.store(true, Ordering::Relaxed);
        link.stop();
    }
}
