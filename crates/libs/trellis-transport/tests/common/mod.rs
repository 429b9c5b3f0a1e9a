//! In-memory network harness: engines wired interface-to-interface, frames
//! shuttled between them with optional induced loss, all under a scripted
//! clock. No sockets, fully deterministic.

// Each integration binary uses its own slice of the harness.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Once;

use rand_core::OsRng;

use trellis_core::destination::new_in;
use trellis_core::hash::AddressHash;
use trellis_core::identity::PrivateIdentity;
use trellis_transport::iface::{InterfaceDesc, InterfaceId, InterfaceMode};
use trellis_transport::transport::{TransportAction, TransportConfig, TransportEngine};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

pub fn node(name: &str, retransmit: bool) -> TransportEngine {
    let mut config = TransportConfig::new(name, &PrivateIdentity::new_from_rand(OsRng));
    config.set_retransmit(retransmit);
    TransportEngine::new(config)
}

pub fn chat_destination(engine: &mut TransportEngine, aspect: &str) -> AddressHash {
    engine.register_destination(new_in(PrivateIdentity::new_from_rand(OsRng), "chat", aspect))
}

type DropFn = Box<dyn FnMut(&[u8]) -> bool>;

struct Wire {
    a: (usize, InterfaceId),
    b: (usize, InterfaceId),
}

/// Engines plus the wires between their interfaces. Frames queue in FIFO
/// order per submission; `run` delivers until the network is quiet.
pub struct Net {
    pub engines: Vec<TransportEngine>,
    wires: Vec<Wire>,
    queue: VecDeque<(usize, InterfaceId, Vec<u8>)>,
    pub events: Vec<Vec<TransportAction>>,
    drop_fn: Option<DropFn>,
}

impl Net {
    pub fn new() -> Self {
        Self {
            engines: Vec::new(),
            wires: Vec::new(),
            queue: VecDeque::new(),
            events: Vec::new(),
            drop_fn: None,
        }
    }

    pub fn add_node(&mut self, engine: TransportEngine) -> usize {
        self.engines.push(engine);
        self.events.push(Vec::new());
        self.engines.len() - 1
    }

    /// Connects two nodes with a fresh interface on each side.
    pub fn connect(&mut self, a: usize, b: usize, bps: u64) -> (InterfaceId, InterfaceId) {
        let iface_a = AddressHash::random(OsRng);
        let iface_b = AddressHash::random(OsRng);

        self.engines[a].register_interface(
            InterfaceDesc::new(iface_a, bps, 500, InterfaceMode::Full),
            0.0,
        );
        self.engines[b].register_interface(
            InterfaceDesc::new(iface_b, bps, 500, InterfaceMode::Full),
            0.0,
        );

        self.wires.push(Wire { a: (a, iface_a), b: (b, iface_b) });

        (iface_a, iface_b)
    }

    pub fn set_loss<F: FnMut(&[u8]) -> bool + 'static>(&mut self, drop_fn: F) {
        self.drop_fn = Some(Box::new(drop_fn));
    }

    pub fn clear_loss(&mut self) {
        self.drop_fn = None;
    }

    pub fn absorb(&mut self, from: usize, actions: Vec<TransportAction>) {
        for action in actions {
            match action {
                TransportAction::SendFrame { iface, bytes } => {
                    if let Some(destination) = self.peer_of(from, iface) {
                        self.queue.push_back((destination.0, destination.1, bytes));
                    }
                }
                other => self.events[from].push(other),
            }
        }
    }

    fn peer_of(&self, node: usize, iface: InterfaceId) -> Option<(usize, InterfaceId)> {
        for wire in &self.wires {
            if wire.a == (node, iface) {
                return Some(wire.b);
            }
            if wire.b == (node, iface) {
                return Some(wire.a);
            }
        }
        None
    }

    /// Delivers exactly one queued frame. Returns false once quiet.
    pub fn step(&mut self, now: f64) -> bool {
        let Some((node, iface, bytes)) = self.queue.pop_front() else {
            return false;
        };

        let dropped =
            self.drop_fn.as_mut().map(|drop_fn| drop_fn(&bytes)).unwrap_or(false);
        if !dropped {
            let actions = self.engines[node].inbound(&bytes, iface, now);
            self.absorb(node, actions);
        }

        true
    }

    /// Delivers queued frames until the network goes quiet.
    pub fn run(&mut self, now: f64) {
        while let Some((node, iface, bytes)) = self.queue.pop_front() {
            if let Some(drop_fn) = self.drop_fn.as_mut() {
                if drop_fn(&bytes) {
                    continue;
                }
            }

            let actions = self.engines[node].inbound(&bytes, iface, now);
            self.absorb(node, actions);
        }
    }

    pub fn tick_all(&mut self, now: f64) {
        for node in 0..self.engines.len() {
            let actions = self.engines[node].tick(now);
            self.absorb(node, actions);
        }
    }

    pub fn announce(&mut self, node: usize, destination: &AddressHash, now: f64) {
        let actions =
            self.engines[node].announce(destination, None, now).expect("announce actions");
        self.absorb(node, actions);
    }

    pub fn take_events(&mut self, node: usize) -> Vec<TransportAction> {
        std::mem::take(&mut self.events[node])
    }
}

/// Deterministic pseudo-random payload, incompressible enough to defeat
/// the resource compressor.
pub fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}
