//! Per-node message dispatch.
//!
//! The router decides, per destination, whether a [RoutableMessage] is delivered to a locally
//!  registered stream or forwarded over a link towards its next hop. Messages for streams and
//!  peers that are not registered yet are buffered and replayed on registration rather than
//!  dropped; the buffers are bounded.
//!
//! Multicast messages fan out by next hop: destinations that share a hop travel as one message
//!  over that link. The caller's completion reflects all branches, the first failure wins.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::OvernetConfig;
use crate::labels::{NodeId, SeqNum, StreamId};
use crate::packet_protocol::AckCallback;
use crate::status::{recv_status, Status, StatusResult};
use crate::wire::routable_message::{Destination, RoutableMessage};

/// A locally registered consumer of one stream, keyed by (remote peer, stream id).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// `seq` is absent for control messages.
    async fn handle_message(&self, src: NodeId, seq: Option<SeqNum>, payload: Bytes) -> StatusResult<()>;
}

/// The outbound side of an established link, keyed by its direct peer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkSender: Send + Sync {
    async fn forward(&self, message: RoutableMessage) -> StatusResult<()>;
}

struct PendingDelivery {
    src: NodeId,
    seq: Option<SeqNum>,
    payload: Bytes,
    done: AckCallback,
}

struct PendingForward {
    message: RoutableMessage,
    done: AckCallback,
}

struct RouterInner {
    streams: FxHashMap<(NodeId, StreamId), Arc<dyn StreamHandler>>,
    links: FxHashMap<NodeId, Arc<dyn LinkSender>>,
    /// destination node to direct link peer, as computed by the routing table
    routes: FxHashMap<NodeId, NodeId>,
    pending_streams: FxHashMap<(NodeId, StreamId), Vec<PendingDelivery>>,
    pending_links: FxHashMap<NodeId, Vec<PendingForward>>,
}

impl RouterInner {
    fn resolve_link(&self, dst: NodeId) -> Option<Arc<dyn LinkSender>> {
        if let Some(link) = self.links.get(&dst) {
            return Some(link.clone());
        }
        self.routes.get(&dst).and_then(|hop| self.links.get(hop)).cloned()
    }
}

pub struct Router {
    node_id: NodeId,
    config: Arc<OvernetConfig>,
    inner: Mutex<RouterInner>,
}

impl Router {
    pub fn new(node_id: NodeId, config: Arc<OvernetConfig>) -> Router {
        Router {
            node_id,
            config,
            inner: Mutex::new(RouterInner {
                streams: FxHashMap::default(),
                links: FxHashMap::default(),
                routes: FxHashMap::default(),
                pending_streams: FxHashMap::default(),
                pending_links: FxHashMap::default(),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Dispatches one message to all of its destinations. Completes once every destination has
    ///  been delivered locally, handed to a link, or replayed from a registration buffer; the
    ///  first error seen is returned.
    pub async fn forward(&self, message: RoutableMessage) -> StatusResult<()> {
        if message.destinations().is_empty() {
            return Err(Status::invalid_argument("message without destinations"));
        }

        // group destinations by where they are headed so a shared next hop gets one message
        let mut local: Vec<Destination> = Vec::new();
        let mut unresolved: FxHashMap<NodeId, Vec<Destination>> = FxHashMap::default();
        let mut by_hop: Vec<(Arc<dyn LinkSender>, NodeId, Vec<Destination>)> = Vec::new();
        {
            let inner = self.inner.lock().unwrap();
            for destination in message.destinations() {
                if destination.dst == self.node_id {
                    local.push(destination.clone());
                    continue;
                }
                match inner.resolve_link(destination.dst) {
                    Some(link) => {
                        let hop = *inner.routes.get(&destination.dst).unwrap_or(&destination.dst);
                        match by_hop.iter_mut().find(|(_, h, _)| *h == hop) {
                            Some((_, _, group)) => group.push(destination.clone()),
                            None => by_hop.push((link, hop, vec![destination.clone()])),
                        }
                    }
                    None => unresolved.entry(destination.dst).or_default().push(destination.clone()),
                }
            }
        }

        let mut first_error: Option<Status> = None;
        let mut note = |result: StatusResult<()>| {
            if let Err(status) = result {
                first_error.get_or_insert(status);
            }
        };

        for destination in local {
            note(self.deliver_local(message.src(), &destination, message.payload.clone()).await);
        }
        for (link, hop, group) in by_hop {
            trace!("forwarding {} destinations via {}", group.len(), hop);
            note(link.forward(message.with_destinations(group)).await);
        }
        for (dst, group) in unresolved {
            note(self.buffer_for_link(dst, message.with_destinations(group)).await);
        }

        match first_error {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    /// Registers the consumer for one (peer, stream) pair and replays anything buffered for it.
    ///  Double registration is refused.
    pub async fn register_stream(
        &self,
        peer: NodeId,
        stream_id: StreamId,
        handler: Arc<dyn StreamHandler>,
    ) -> StatusResult<()> {
        let buffered = {
            let mut inner = self.inner.lock().unwrap();
            if inner.streams.contains_key(&(peer, stream_id)) {
                return Err(Status::failed_precondition(format!(
                    "stream {} of {} is already registered", stream_id, peer)));
            }
            inner.streams.insert((peer, stream_id), handler.clone());
            inner.pending_streams.remove(&(peer, stream_id)).unwrap_or_default()
        };

        for pending in buffered {
            let result = handler.handle_message(pending.src, pending.seq, pending.payload).await;
            let _ = pending.done.send(result);
        }
        Ok(())
    }

    /// Publishes an established link and replays messages that were waiting for its peer to
    ///  become reachable.
    pub async fn register_link(&self, peer: NodeId, link: Arc<dyn LinkSender>) -> StatusResult<()> {
        let replay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.links.contains_key(&peer) {
                return Err(Status::failed_precondition(format!(
                    "a link to {} is already registered", peer)));
            }
            inner.links.insert(peer, link.clone());
            debug!("link to {} registered", peer);
            self.drain_resolvable(&mut inner)
        };
        self.replay_forwards(replay).await;
        Ok(())
    }

    /// Removes a link, typically after its transport failed. Messages buffered behind it stay
    ///  buffered.
    pub fn unregister_link(&self, peer: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.links.remove(&peer);
        debug!("link to {} unregistered", peer);
    }

    /// Installs the latest forwarding table (destination to next-hop peer) and replays buffered
    ///  messages that became routable.
    pub async fn update_routes(&self, routes: FxHashMap<NodeId, NodeId>) {
        let replay = {
            let mut inner = self.inner.lock().unwrap();
            inner.routes = routes;
            self.drain_resolvable(&mut inner)
        };
        self.replay_forwards(replay).await;
    }

    fn drain_resolvable(&self, inner: &mut RouterInner) -> Vec<(Arc<dyn LinkSender>, PendingForward)> {
        let resolvable: Vec<NodeId> = inner.pending_links.keys()
            .filter(|dst| inner.resolve_link(**dst).is_some())
            .copied()
            .collect();

        let mut replay = Vec::new();
        for dst in resolvable {
            let link = inner.resolve_link(dst)
                .expect("resolvability was just checked");
            for pending in inner.pending_links.remove(&dst).unwrap_or_default() {
                replay.push((link.clone(), pending));
            }
        }
        replay
    }

    async fn replay_forwards(&self, replay: Vec<(Arc<dyn LinkSender>, PendingForward)>) {
        for (link, pending) in replay {
            let result = link.forward(pending.message).await;
            let _ = pending.done.send(result);
        }
    }

    async fn deliver_local(
        &self,
        src: NodeId,
        destination: &Destination,
        payload: Bytes,
    ) -> StatusResult<()> {
        let key = (src, destination.stream_id);
        let handler = { self.inner.lock().unwrap().streams.get(&key).cloned() };
        if let Some(handler) = handler {
            return handler.handle_message(src, destination.seq, payload).await;
        }

        // the lock scope must close before awaiting, so the outcome is carried out of it
        let delivery = {
            let mut inner = self.inner.lock().unwrap();
            // registration may have raced the lookup above
            match inner.streams.get(&key).cloned() {
                Some(handler) => Ok((handler, payload)),
                None => {
                    let buffered = inner.pending_streams.entry(key).or_default();
                    if buffered.len() >= self.config.pending_message_limit {
                        return Err(Status::resource_exhausted(format!(
                            "too many messages buffered for unregistered stream {} of {}",
                            destination.stream_id, src)));
                    }
                    let (tx, rx) = oneshot::channel();
                    trace!("buffering message for unregistered stream {} of {}", destination.stream_id, src);
                    buffered.push(PendingDelivery { src, seq: destination.seq, payload, done: tx });
                    Err(rx)
                }
            }
        };
        match delivery {
            Ok((handler, payload)) => handler.handle_message(src, destination.seq, payload).await,
            Err(rx) => recv_status(rx.await),
        }
    }

    async fn buffer_for_link(&self, dst: NodeId, message: RoutableMessage) -> StatusResult<()> {
        let routed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.resolve_link(dst) {
                Some(link) => Ok((link, message)),
                None => {
                    let buffered = inner.pending_links.entry(dst).or_default();
                    if buffered.len() >= self.config.pending_message_limit {
                        return Err(Status::resource_exhausted(format!(
                            "too many messages buffered for unreachable node {}", dst)));
                    }
                    let (tx, rx) = oneshot::channel();
                    trace!("buffering message for unreachable node {}", dst);
                    buffered.push(PendingForward { message, done: tx });
                    Err(rx)
                }
            }
        };
        match routed {
            Ok((link, message)) => link.forward(message).await,
            Err(rx) => recv_status(rx.await),
        }
    }
}
