//! Connection establishment over an unreliable datagram transport.
//!
//! The nub is a tick-driven state machine per peer address. It owns no sockets and no timers:
//!  every operation returns the [NubEvent]s the caller must act on (send a packet, arm a timer,
//!  publish a link). That keeps the handshake logic synchronous and exhaustively testable.
//!
//! Symmetry breaking: the node with the numerically lower id says `Hello` directly; the higher
//!  one only announces itself with `CallMeMaybe` and waits to be called. Handshake packets that
//!  carry a node id are zero-padded to a fixed size so they cannot be confused with data
//!  packets.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::config::OvernetConfig;
use crate::labels::NodeId;

pub const OP_CONNECTED: u8 = 0;
pub const OP_CALL_ME_MAYBE: u8 = 1;
pub const OP_HELLO: u8 = 2;
pub const OP_HELLO_ACK: u8 = 3;

/// `CallMeMaybe` and `Hello` are padded to this length.
pub const HANDSHAKE_PACKET_LEN: usize = 256;

/// What the caller must do in response to a nub operation.
#[derive(Debug, PartialEq, Eq)]
pub enum NubEvent<A> {
    SendPacket { to: A, packet: Bytes },
    /// arm (or re-arm) the retransmission timer for this address
    ScheduleTick { to: A, after: Duration },
    /// the handshake completed, a link to this peer can be published
    Established { to: A, peer: NodeId },
    /// the handshake was retried too often, per-peer state was dropped
    Abandoned { to: A },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Announcing,
    SayingHello,
    AckingHello,
    SemiConnected,
    Connected,
}

struct PeerState {
    state: HandshakeState,
    peer: NodeId,
    ticks: u8,
}

pub struct PacketNub<A> {
    local: NodeId,
    config: Arc<OvernetConfig>,
    peers: FxHashMap<A, PeerState>,
}

impl<A: Clone + Eq + Hash + Debug> PacketNub<A> {
    pub fn new(local: NodeId, config: Arc<OvernetConfig>) -> PacketNub<A> {
        PacketNub { local, config, peers: FxHashMap::default() }
    }

    pub fn is_connected(&self, address: &A) -> bool {
        matches!(
            self.peers.get(address),
            Some(PeerState { state: HandshakeState::Connected | HandshakeState::SemiConnected, .. })
        )
    }

    /// Starts (or restarts) connection establishment towards a known peer.
    pub fn initiate(&mut self, address: A, peer: NodeId) -> Vec<NubEvent<A>> {
        if self.is_connected(&address) {
            return Vec::new();
        }
        let (state, packet) = if self.local < peer {
            (HandshakeState::SayingHello, padded_packet(OP_HELLO, self.local))
        }
        else {
            (HandshakeState::Announcing, padded_packet(OP_CALL_ME_MAYBE, self.local))
        };
        self.peers.insert(address.clone(), PeerState { state, peer, ticks: 0 });

        vec![
            NubEvent::SendPacket { to: address.clone(), packet },
            NubEvent::ScheduleTick { to: address, after: self.backoff(0) },
        ]
    }

    /// Handles one handshake packet. Data packets for established links are not routed through
    ///  here, with the exception of the bare `Connected` op that finishes the handshake.
    pub fn process(&mut self, address: A, mut packet: Bytes) -> Vec<NubEvent<A>> {
        if packet.is_empty() {
            return Vec::new();
        }
        let op = packet.get_u8();
        match op {
            OP_CALL_ME_MAYBE => {
                let Some(peer) = parse_padded(packet) else {
                    warn!("malformed CallMeMaybe from {:?}", address);
                    return Vec::new();
                };
                if self.local > peer {
                    warn!("{} announced itself to us but should be calling, ignoring", peer);
                    return Vec::new();
                }
                // restart the hello exchange even if one is in flight, the peer evidently
                //  does not know about us yet
                self.peers.insert(
                    address.clone(),
                    PeerState { state: HandshakeState::SayingHello, peer, ticks: 0 },
                );
                vec![
                    NubEvent::SendPacket { to: address.clone(), packet: padded_packet(OP_HELLO, self.local) },
                    NubEvent::ScheduleTick { to: address, after: self.backoff(0) },
                ]
            }
            OP_HELLO => {
                let Some(peer) = parse_padded(packet) else {
                    warn!("malformed Hello from {:?}", address);
                    return Vec::new();
                };
                let entry = self.peers.entry(address.clone()).or_insert(PeerState {
                    state: HandshakeState::AckingHello,
                    peer,
                    ticks: 0,
                });
                entry.peer = peer;
                if matches!(entry.state, HandshakeState::Announcing) {
                    entry.state = HandshakeState::AckingHello;
                    entry.ticks = 0;
                }
                // re-acking an already established peer is harmless, our ack may have been lost
                vec![NubEvent::SendPacket {
                    to: address,
                    packet: Bytes::from_static(&[OP_HELLO_ACK]),
                }]
            }
            OP_HELLO_ACK => {
                let Some(entry) = self.peers.get_mut(&address) else {
                    return Vec::new();
                };
                if entry.state != HandshakeState::SayingHello {
                    return Vec::new();
                }
                entry.state = HandshakeState::SemiConnected;
                debug!("handshake with {} complete", entry.peer);
                vec![
                    NubEvent::SendPacket {
                        to: address.clone(),
                        packet: Bytes::from_static(&[OP_CONNECTED]),
                    },
                    NubEvent::Established { to: address, peer: entry.peer },
                ]
            }
            OP_CONNECTED => {
                let Some(entry) = self.peers.get_mut(&address) else {
                    return Vec::new();
                };
                match entry.state {
                    HandshakeState::AckingHello => {
                        entry.state = HandshakeState::Connected;
                        debug!("handshake with {} complete", entry.peer);
                        vec![NubEvent::Established { to: address, peer: entry.peer }]
                    }
                    HandshakeState::SemiConnected => {
                        entry.state = HandshakeState::Connected;
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            other => {
                warn!("unknown handshake op {} from {:?}", other, address);
                Vec::new()
            }
        }
    }

    /// Advances the retransmission timer for one address. Called by whoever armed the
    ///  [NubEvent::ScheduleTick].
    pub fn tick(&mut self, address: A) -> Vec<NubEvent<A>> {
        let Some(entry) = self.peers.get_mut(&address) else {
            return Vec::new();
        };
        let op = match entry.state {
            HandshakeState::Announcing => OP_CALL_ME_MAYBE,
            HandshakeState::SayingHello => OP_HELLO,
            HandshakeState::AckingHello => OP_HELLO_ACK,
            HandshakeState::SemiConnected | HandshakeState::Connected => return Vec::new(),
        };
        entry.ticks += 1;
        if entry.ticks >= self.config.handshake_retry_limit {
            let peer = entry.peer;
            self.peers.remove(&address);
            debug!("giving up on handshake with {}", peer);
            return vec![NubEvent::Abandoned { to: address }];
        }

        let packet = match op {
            OP_HELLO_ACK => Bytes::from_static(&[OP_HELLO_ACK]),
            op => padded_packet(op, self.local),
        };
        let ticks = entry.ticks;
        vec![
            NubEvent::SendPacket { to: address.clone(), packet },
            NubEvent::ScheduleTick { to: address, after: self.backoff(ticks) },
        ]
    }

    /// 11/10 growth per tick on the configured base, with multiplicative jitter so that two
    ///  nodes restarting together do not stay in lockstep.
    fn backoff(&self, ticks: u8) -> Duration {
        let mut delay = self.config.handshake_backoff_base;
        for _ in 0..ticks {
            delay = delay * 11 / 10;
        }
        delay.mul_f64(rand::thread_rng().gen_range(0.75..1.25))
    }
}

fn padded_packet(op: u8, node: NodeId) -> Bytes {
    let mut packet = BytesMut::with_capacity(HANDSHAKE_PACKET_LEN);
    packet.extend_from_slice(&[op]);
    node.ser(&mut packet);
    packet.resize(HANDSHAKE_PACKET_LEN, 0);
    packet.freeze()
}

/// the op byte is already consumed; the node id leads the zero padding
fn parse_padded(packet: Bytes) -> Option<NodeId> {
    if packet.len() != HANDSHAKE_PACKET_LEN - 1 {
        return None;
    }
    let mut buf = packet;
    NodeId::deser(&mut buf).ok()
}
