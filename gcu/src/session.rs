//! Per-aircraft session bookkeeping.
//!
//! An aircraft moves Discovered -> Connecting -> Active as the
//! announce, request and confirm exchange completes. Connecting leases
//! an address from a fixed pool; the lease returns to the pool when the
//! session expires.

use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use airlink::{AckData, BeaconData, PeerId, SynAckData, SynData};
use anyhow::{Context, Result};
use rand::Rng;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    /// Announced itself, no address requested yet.
    Discovered,
    /// Offered an address, waiting for the aircraft to confirm.
    Connecting,
    /// Confirmed. Control and telemetry flow from here on.
    Active,
}

#[derive(Debug)]
pub struct PeerSession {
    pub id: PeerId,
    pub capabilities: u32,
    pub version: u16,
    /// Endpoint the aircraft last announced from.
    pub remote: SocketAddr,
    pub state: SessionState,
    pub assigned: Option<Ipv4Addr>,
    token: Option<u64>,
    pub last_seen: Instant,
}

/// Session removed by [`SessionTable::sweep`]. `was_active` tells the
/// caller whether this counts as losing a connected aircraft.
#[derive(Debug)]
pub struct Eviction {
    pub id: PeerId,
    pub was_active: bool,
}

/// Lease pool over the host octet of one /24 network, lowest host
/// first.
pub struct AddressPool {
    network: Ipv4Addr,
    free: BTreeSet<u8>,
}

impl AddressPool {
    pub fn new(network: Ipv4Addr, first: u8, last: u8) -> Self {
        Self {
            network,
            free: (first..=last).collect(),
        }
    }

    /// Builds a pool under `prefix`, the first three octets written
    /// `"172.16.0"` style.
    pub fn from_prefix(prefix: &str, first: u8, last: u8) -> Result<Self> {
        let network = format!("{}.0", prefix).parse().context("Invalid address pool prefix")?;
        Ok(Self::new(network, first, last))
    }

    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        let host = self.free.pop_first()?;
        let [a, b, c, _] = self.network.octets();
        Some(Ipv4Addr::new(a, b, c, host))
    }

    /// Returns a lease. Addresses outside the pool network are ignored.
    pub fn release(&mut self, address: Ipv4Addr) {
        let given = address.octets();
        if given[..3] == self.network.octets()[..3] {
            self.free.insert(given[3]);
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// All sessions the ground station currently tracks, keyed by peer id.
pub struct SessionTable {
    sessions: HashMap<PeerId, PeerSession>,
    pool: AddressPool,
}

impl SessionTable {
    pub fn new(pool: AddressPool) -> Self {
        Self {
            sessions: HashMap::new(),
            pool,
        }
    }

    /// Records an announcement. Returns true when the aircraft was not
    /// known before; a repeated beacon only refreshes the session.
    pub fn handle_beacon(&mut self, beacon: &BeaconData, remote: SocketAddr, now: Instant) -> bool {
        match self.sessions.get_mut(&beacon.id) {
            Some(session) => {
                session.last_seen = now;
                session.remote = remote;
                session.capabilities = beacon.capabilities;
                session.version = beacon.version;
                false
            },
            None => {
                self.sessions.insert(beacon.id, PeerSession {
                    id: beacon.id,
                    capabilities: beacon.capabilities,
                    version: beacon.version,
                    remote,
                    state: SessionState::Discovered,
                    assigned: None,
                    token: None,
                    last_seen: now,
                });
                true
            },
        }
    }

    /// Answers a connection request with an address offer, or None when
    /// the aircraft never announced itself or the pool is dry.
    pub fn handle_syn(&mut self, syn: &SynData, now: Instant) -> Option<AckData> {
        let session = match self.sessions.get_mut(&syn.id) {
            Some(session) => session,
            None => {
                log::debug!("Connection request from unannounced aircraft {}", syn.id);
                return None;
            },
        };
        session.last_seen = now;
        match session.state {
            SessionState::Discovered => {
                let address = match self.pool.allocate() {
                    Some(address) => address,
                    None => {
                        log::warn!("Address pool exhausted, cannot admit {}", syn.id);
                        return None;
                    },
                };
                let token = rand::thread_rng().gen();
                session.assigned = Some(address);
                session.token = Some(token);
                session.state = SessionState::Connecting;
                Some(AckData {
                    id: session.id,
                    token,
                    address,
                })
            },
            // The earlier offer was lost in flight, repeat it.
            SessionState::Connecting | SessionState::Active => match (session.token, session.assigned) {
                (Some(token), Some(address)) => Some(AckData {
                    id: session.id,
                    token,
                    address,
                }),
                _ => None,
            },
        }
    }

    /// Activates a connecting session when the confirmation echoes the
    /// offered token. Returns the assigned address on success.
    pub fn handle_syn_ack(&mut self, syn_ack: &SynAckData, now: Instant) -> Option<Ipv4Addr> {
        let session = self.sessions.get_mut(&syn_ack.id)?;
        if session.state != SessionState::Connecting || session.token != Some(syn_ack.token) {
            log::debug!("Stray confirmation from {}", syn_ack.id);
            return None;
        }
        session.state = SessionState::Active;
        session.last_seen = now;
        session.assigned
    }

    /// Refreshes the session sending from `remote`, if any.
    pub fn touch_addr(&mut self, remote: SocketAddr, now: Instant) -> Option<PeerId> {
        let session = self.sessions.values_mut().find(|session| session.remote == remote)?;
        session.last_seen = now;
        Some(session.id)
    }

    /// Drops every session unseen for longer than `timeout` and returns
    /// the leases to the pool.
    pub fn sweep(&mut self, timeout: Duration, now: Instant) -> Vec<Eviction> {
        let mut evicted = Vec::new();
        let pool = &mut self.pool;
        self.sessions.retain(|_, session| {
            if now.duration_since(session.last_seen) <= timeout {
                return true;
            }
            if let Some(address) = session.assigned {
                pool.release(address);
            }
            evicted.push(Eviction {
                id: session.id,
                was_active: session.state == SessionState::Active,
            });
            false
        });
        evicted
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(id)
    }

    pub fn active(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values().filter(|session| session.state == SessionState::Active)
    }

    pub fn any_active(&self) -> bool {
        self.sessions.values().any(|session| session.state == SessionState::Active)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
