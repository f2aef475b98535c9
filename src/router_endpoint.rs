//! Per-node composition over a UDP socket.
//!
//! A [RouterEndpoint] owns the local [Router], a [RoutingTable], and a [PacketNub] keyed by
//!  socket address. Inbound datagrams are dispatched by op byte: data packets go to the
//!  established [PacketLink] for their source address, everything else feeds the handshake
//!  state machine. When a handshake completes, the endpoint builds the
//!  protocol/link/congestion stack for that peer and publishes it to the router.
//!
//! A background maintenance task periodically feeds per-link round-trip estimates into the
//!  routing table and pushes freshly computed next hops back into the router.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OvernetConfig;
use crate::congestion::WindowedController;
use crate::datagram_stream::DatagramStream;
use crate::labels::{NodeId, SeqNum, StreamId};
use crate::packet_link::{MessageSink, PacketLink, OP_DATA};
use crate::packet_nub::{NubEvent, PacketNub};
use crate::packet_protocol::{PacketProtocol, PacketSender};
use crate::receive_mode::ReliabilityAndOrdering;
use crate::router::{LinkSender, Router};
use crate::routing_table::{LinkLabel, LinkStatus, NodeStatus, RoutingTable};
use crate::status::{recv_status, Status, StatusResult};
use crate::wire::routable_message::RoutableMessage;

const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// writes `op + seq + body` datagrams for one peer address
struct UdpPacketSender {
    socket: Arc<UdpSocket>,
    to: SocketAddr,
}

#[async_trait]
impl PacketSender for UdpPacketSender {
    async fn send_packet(&self, seq: SeqNum, packet: Bytes) -> StatusResult<()> {
        let mut buf = BytesMut::with_capacity(packet.len() + 10);
        buf.put_u8(OP_DATA);
        seq.ser(&mut buf);
        buf.extend_from_slice(&packet);
        self.socket
            .send_to(&buf, self.to)
            .await
            .map_err(|error| Status::unavailable(format!("udp send to {}: {}", self.to, error)))?;
        Ok(())
    }
}

struct RouterSink {
    router: Arc<Router>,
}

#[async_trait]
impl MessageSink for RouterSink {
    async fn deliver(&self, message: RoutableMessage) -> StatusResult<()> {
        self.router.forward(message).await
    }
}

struct LinkForwarder {
    link: Arc<PacketLink>,
}

#[async_trait]
impl LinkSender for LinkForwarder {
    async fn forward(&self, message: RoutableMessage) -> StatusResult<()> {
        recv_status(self.link.forward(message).await)
    }
}

struct LinkEntry {
    peer: NodeId,
    label: LinkLabel,
    link: Arc<PacketLink>,
}

struct EndpointShared {
    node_id: NodeId,
    config: Arc<OvernetConfig>,
    socket: Arc<UdpSocket>,
    router: Arc<Router>,
    routing_table: RoutingTable,
    nub: Mutex<PacketNub<SocketAddr>>,
    links: Mutex<FxHashMap<SocketAddr, LinkEntry>>,
    tick_timers: Mutex<FxHashMap<SocketAddr, JoinHandle<()>>>,
    next_link_label: AtomicU64,
    metric_version: AtomicU64,
}

impl EndpointShared {
    async fn handle_datagram(shared: &Arc<EndpointShared>, from: SocketAddr, packet: Bytes) {
        if packet.is_empty() {
            return;
        }
        // a bare op 0 is the handshake-finishing Connected packet, anything longer is data
        if packet[0] == OP_DATA && packet.len() > 1 {
            let link = shared.links.lock().unwrap().get(&from).map(|entry| entry.link.clone());
            match link {
                Some(link) => {
                    if let Err(status) = link.process(packet).await {
                        warn!("failed to process packet from {}: {}", from, status);
                    }
                }
                None => debug!("data packet from unknown address {} - dropping", from),
            }
            return;
        }

        let events = shared.nub.lock().unwrap().process(from, packet);
        Self::run_events(shared, events).await;
    }

    async fn run_events(shared: &Arc<EndpointShared>, events: Vec<NubEvent<SocketAddr>>) {
        for event in events {
            match event {
                NubEvent::SendPacket { to, packet } => {
                    if let Err(error) = shared.socket.send_to(&packet, to).await {
                        warn!("handshake send to {} failed: {}", to, error);
                    }
                }
                NubEvent::ScheduleTick { to, after } => Self::schedule_tick(shared, to, after),
                NubEvent::Established { to, peer } => shared.publish_link(to, peer).await,
                NubEvent::Abandoned { to } => {
                    debug!("handshake with {} abandoned", to);
                    if let Some(timer) = shared.tick_timers.lock().unwrap().remove(&to) {
                        timer.abort();
                    }
                }
            }
        }
    }

    fn schedule_tick(shared: &Arc<EndpointShared>, to: SocketAddr, after: Duration) {
        let task_shared = shared.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let events = task_shared.nub.lock().unwrap().tick(to);
            Self::run_events(&task_shared, events).await;
        });
        if let Some(old) = shared.tick_timers.lock().unwrap().insert(to, timer) {
            old.abort();
        }
    }

    async fn publish_link(&self, to: SocketAddr, peer: NodeId) {
        if let Some(timer) = self.tick_timers.lock().unwrap().remove(&to) {
            timer.abort();
        }
        if self.links.lock().unwrap().contains_key(&to) {
            return;
        }

        let sender = Arc::new(UdpPacketSender { socket: self.socket.clone(), to });
        let congestion = Arc::new(WindowedController::new());
        let protocol = Arc::new(PacketProtocol::new(self.config.clone(), congestion, sender));
        let sink = Arc::new(RouterSink { router: self.router.clone() });
        let link = Arc::new(PacketLink::new(
            self.config.clone(),
            self.node_id,
            peer,
            protocol,
            sink,
        ));

        let label = self.next_link_label.fetch_add(1, Ordering::Relaxed);
        self.links.lock().unwrap().insert(to, LinkEntry { peer, label, link: link.clone() });
        info!("link {} to {} via {} established", label, peer, to);

        if let Err(status) = self.router.register_link(peer, Arc::new(LinkForwarder { link })).await {
            debug!("link to {} not published: {}", peer, status);
        }
        self.publish_metrics().await;
    }

    /// Feeds the current per-link round-trip estimates into the routing table, versioned so
    ///  stale updates from earlier passes lose.
    async fn publish_metrics(&self) {
        let entries: Vec<(NodeId, LinkLabel, Arc<PacketLink>)> = self.links.lock().unwrap()
            .values()
            .map(|entry| (entry.peer, entry.label, entry.link.clone()))
            .collect();

        let version = self.metric_version.fetch_add(1, Ordering::Relaxed) + 1;
        let mut nodes = vec![NodeStatus {
            id: self.node_id,
            version,
            forwarding_time: Duration::ZERO,
        }];
        let mut links = Vec::new();
        for (peer, label, link) in entries {
            nodes.push(NodeStatus { id: peer, version, forwarding_time: Duration::ZERO });
            links.push(LinkStatus {
                from: self.node_id,
                to: peer,
                label,
                version,
                rtt: link.round_trip_time().await,
            });
        }
        self.routing_table.update(nodes, links, false);
    }
}

async fn receive_loop(shared: Arc<EndpointShared>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match shared.socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let packet = Bytes::copy_from_slice(&buf[..len]);
                EndpointShared::handle_datagram(&shared, from, packet).await;
            }
            Err(error) => warn!("udp receive failed: {}", error),
        }
    }
}

async fn maintenance_loop(shared: Arc<EndpointShared>) {
    let mut seen_version = 0;
    loop {
        tokio::time::sleep(METRICS_INTERVAL).await;
        shared.publish_metrics().await;
        if let Some((version, routes)) = shared.routing_table.poll(seen_version) {
            seen_version = version;
            let next_hops = routes.iter().map(|(dst, route)| (*dst, route.next_hop)).collect();
            shared.router.update_routes(next_hops).await;
        }
    }
}

pub struct RouterEndpoint {
    shared: Arc<EndpointShared>,
    receiver: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl RouterEndpoint {
    pub async fn new(
        node_id: NodeId,
        bind: SocketAddr,
        config: Arc<OvernetConfig>,
    ) -> StatusResult<RouterEndpoint> {
        config.validate()?;
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|error| Status::internal(format!("binding {}: {}", bind, error)))?;

        let shared = Arc::new(EndpointShared {
            node_id,
            config: config.clone(),
            socket: Arc::new(socket),
            router: Arc::new(Router::new(node_id, config.clone())),
            routing_table: RoutingTable::new(node_id, config.clone(), true),
            nub: Mutex::new(PacketNub::new(node_id, config)),
            links: Mutex::new(FxHashMap::default()),
            tick_timers: Mutex::new(FxHashMap::default()),
            next_link_label: AtomicU64::new(1),
            metric_version: AtomicU64::new(0),
        });

        let receiver = tokio::spawn(receive_loop(shared.clone()));
        let maintenance = tokio::spawn(maintenance_loop(shared.clone()));

        Ok(RouterEndpoint { shared, receiver, maintenance })
    }

    pub fn node_id(&self) -> NodeId {
        self.shared.node_id
    }

    pub fn local_addr(&self) -> StatusResult<SocketAddr> {
        self.shared.socket
            .local_addr()
            .map_err(|error| Status::internal(format!("local address: {}", error)))
    }

    pub fn router(&self) -> Arc<Router> {
        self.shared.router.clone()
    }

    /// Starts connection establishment towards a peer at a known address.
    pub async fn connect(&self, address: SocketAddr, peer: NodeId) {
        let events = self.shared.nub.lock().unwrap().initiate(address, peer);
        EndpointShared::run_events(&self.shared, events).await;
    }

    /// True once the handshake with `peer` finished and a link is published.
    pub fn is_connected(&self, peer: NodeId) -> bool {
        self.shared.links.lock().unwrap().values().any(|entry| entry.peer == peer)
    }

    /// Opens a datagram stream bound to `(peer, stream_id)`. Both sides must open the pair
    ///  with the same reliability mode.
    pub async fn stream(
        &self,
        peer: NodeId,
        stream_id: StreamId,
        reliability: ReliabilityAndOrdering,
    ) -> StatusResult<DatagramStream> {
        DatagramStream::create(
            self.shared.router.clone(),
            peer,
            stream_id,
            reliability,
            self.shared.config.clone(),
        )
        .await
    }

    /// Tears the endpoint down: stops the socket loops and closes every link.
    pub async fn close(&self) {
        self.receiver.abort();
        self.maintenance.abort();
        for (_, timer) in self.shared.tick_timers.lock().unwrap().drain() {
            timer.abort();
        }
        let links: Vec<Arc<PacketLink>> = self.shared.links.lock().unwrap()
            .drain()
            .map(|(_, entry)| entry.link)
            .collect();
        for link in links {
            link.close().await;
        }
    }
}

impl Drop for RouterEndpoint {
    fn drop(&mut self) {
        self.receiver.abort();
        self.maintenance.abort();
        for (_, timer) in self.shared.tick_timers.lock().unwrap().drain() {
            timer.abort();
        }
    }
}
