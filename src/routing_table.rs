//! Link-state route computation.
//!
//! Nodes feed versioned node and link metric updates into the table; a shortest-latency pass
//!  over the resulting graph publishes, per reachable destination, the first-hop link of the
//!  best path from the root. Consumers pick up published tables through [RoutingTable::poll]
//!  without blocking, using a version counter to detect staleness.
//!
//! The path-finding pass can run on a background task. Updates arriving while a pass is running
//!  are queued and drained by that same pass cycle rather than spawning a second one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::OvernetConfig;
use crate::labels::NodeId;

/// Process-wide identifier of one directed link, assigned by whoever owns the link.
pub type LinkLabel = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub version: u64,
    /// time the node takes to turn a received packet around
    pub forwarding_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub from: NodeId,
    pub to: NodeId,
    pub label: LinkLabel,
    pub version: u64,
    pub rtt: Duration,
}

/// First hop of the best known path to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub next_hop: NodeId,
    pub label: LinkLabel,
}

struct NodeEntry {
    version: u64,
    forwarding_time: Duration,
    last_updated: Instant,
    // scratch state for the path-finding pass, valid only while `run` matches the pass counter
    run: u64,
    best_cost: Duration,
    best_from: Option<NodeId>,
    best_link: LinkLabel,
}

struct LinkEntry {
    version: u64,
    to: NodeId,
    rtt: Duration,
}

struct PendingUpdate {
    nodes: Vec<NodeStatus>,
    links: Vec<LinkStatus>,
    flush_expired: bool,
}

struct TableState {
    nodes: FxHashMap<NodeId, NodeEntry>,
    links: FxHashMap<NodeId, FxHashMap<LinkLabel, LinkEntry>>,
    pending: Vec<PendingUpdate>,
    run: u64,
    published: FxHashMap<NodeId, Route>,
    published_version: u64,
}

pub struct RoutingTable {
    root: NodeId,
    config: Arc<OvernetConfig>,
    state: Arc<Mutex<TableState>>,
    work: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
}

impl RoutingTable {
    /// With `background` the path-finding pass runs on a spawned task and [RoutingTable::update]
    ///  returns immediately; without it the pass runs inline in the caller.
    pub fn new(root: NodeId, config: Arc<OvernetConfig>, background: bool) -> RoutingTable {
        let mut nodes = FxHashMap::default();
        nodes.insert(root, NodeEntry {
            version: 0,
            forwarding_time: Duration::ZERO,
            last_updated: Instant::now(),
            run: 0,
            best_cost: Duration::ZERO,
            best_from: None,
            best_link: 0,
        });

        let state = Arc::new(Mutex::new(TableState {
            nodes,
            links: FxHashMap::default(),
            pending: Vec::new(),
            run: 0,
            published: FxHashMap::default(),
            published_version: 0,
        }));
        let work = Arc::new(Notify::new());

        let worker = if background {
            let state = state.clone();
            let work = work.clone();
            let config = config.clone();
            Some(tokio::spawn(async move {
                loop {
                    let notified = work.notified();
                    let has_work = !state.lock().unwrap().pending.is_empty();
                    if has_work {
                        Self::run_pass(root, &config, &state);
                    }
                    else {
                        notified.await;
                    }
                }
            }))
        }
        else {
            None
        };

        RoutingTable { root, config, state, work, worker }
    }

    /// Queues a batch of metric updates and triggers a recomputation. `flush_expired` also
    ///  drops nodes that have not been updated within the configured entry expiry; the root
    ///  node is never flushed.
    pub fn update(&self, nodes: Vec<NodeStatus>, links: Vec<LinkStatus>, flush_expired: bool) {
        self.state.lock().unwrap().pending.push(PendingUpdate { nodes, links, flush_expired });
        match &self.worker {
            Some(_) => self.work.notify_one(),
            None => Self::run_pass(self.root, &self.config, &self.state),
        }
    }

    /// Returns the latest forwarding table if it is newer than `seen_version`, along with its
    ///  version. Never blocks.
    pub fn poll(&self, seen_version: u64) -> Option<(u64, FxHashMap<NodeId, Route>)> {
        let state = self.state.lock().unwrap();
        if state.published_version > seen_version {
            Some((state.published_version, state.published.clone()))
        }
        else {
            None
        }
    }

    fn run_pass(root: NodeId, config: &OvernetConfig, state: &Mutex<TableState>) {
        let mut state = state.lock().unwrap();
        let batches = std::mem::take(&mut state.pending);
        for batch in batches {
            Self::apply_changes(root, config, &mut state, batch);
        }
        Self::build_forwarding_table(root, &mut state);
    }

    fn apply_changes(
        root: NodeId,
        config: &OvernetConfig,
        state: &mut TableState,
        batch: PendingUpdate,
    ) {
        let now = Instant::now();

        for status in batch.nodes {
            match state.nodes.get_mut(&status.id) {
                Some(entry) if entry.version >= status.version => {
                    debug!("dropping stale update v{} for node {}", status.version, status.id);
                }
                Some(entry) => {
                    entry.version = status.version;
                    entry.forwarding_time = status.forwarding_time;
                    entry.last_updated = now;
                }
                None => {
                    trace!("learned node {}", status.id);
                    state.nodes.insert(status.id, NodeEntry {
                        version: status.version,
                        forwarding_time: status.forwarding_time,
                        last_updated: now,
                        run: 0,
                        best_cost: Duration::ZERO,
                        best_from: None,
                        best_link: 0,
                    });
                }
            }
        }

        for status in batch.links {
            // both endpoints must be known already, node updates come first
            if !state.nodes.contains_key(&status.from) || !state.nodes.contains_key(&status.to) {
                debug!("dropping link {} -> {}: unknown endpoint", status.from, status.to);
                continue;
            }
            let outgoing = state.links.entry(status.from).or_default();
            match outgoing.get_mut(&status.label) {
                Some(entry) if entry.version >= status.version => {
                    debug!("dropping stale update v{} for link {} of {}",
                        status.version, status.label, status.from);
                }
                Some(entry) => {
                    entry.version = status.version;
                    entry.to = status.to;
                    entry.rtt = status.rtt;
                }
                None => {
                    outgoing.insert(status.label, LinkEntry {
                        version: status.version,
                        to: status.to,
                        rtt: status.rtt,
                    });
                }
            }
        }

        if batch.flush_expired {
            let expiry = config.entry_expiry;
            let expired: Vec<NodeId> = state.nodes.iter()
                .filter(|(id, entry)| **id != root && now.duration_since(entry.last_updated) > expiry)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                debug!("flushing expired node {}", id);
                state.nodes.remove(id);
                state.links.remove(id);
            }
            for outgoing in state.links.values_mut() {
                outgoing.retain(|_, link| state.nodes.contains_key(&link.to));
            }
        }
    }

    /// Single-source shortest-path relaxation from the root. A FIFO worklist is enough since
    ///  relaxations are idempotent; the per-node `run` counter stands in for clearing all
    ///  scratch state between passes.
    fn build_forwarding_table(root: NodeId, state: &mut TableState) {
        state.run += 1;
        let run = state.run;

        {
            let root_entry = state.nodes.get_mut(&root)
                .expect("the root node is never removed");
            root_entry.run = run;
            root_entry.best_cost = Duration::ZERO;
            root_entry.best_from = None;
        }

        let mut worklist = VecDeque::new();
        worklist.push_back(root);
        while let Some(from) = worklist.pop_front() {
            let from_cost = state.nodes[&from].best_cost;
            let outgoing: Vec<(LinkLabel, NodeId, Duration)> = state.links.get(&from)
                .map(|links| links.iter().map(|(label, link)| (*label, link.to, link.rtt)).collect())
                .unwrap_or_default();

            for (label, to, rtt) in outgoing {
                let Some(entry) = state.nodes.get_mut(&to) else { continue };
                let candidate = from_cost + rtt + entry.forwarding_time;
                if entry.run != run || candidate < entry.best_cost {
                    entry.run = run;
                    entry.best_cost = candidate;
                    entry.best_from = Some(from);
                    entry.best_link = label;
                    worklist.push_back(to);
                }
            }
        }

        let mut published = FxHashMap::default();
        for (id, entry) in &state.nodes {
            if *id == root || entry.run != run {
                continue;
            }
            // walk back to the node adjacent to the root, its incoming link is the first hop
            let mut hop = *id;
            while let Some(prev) = state.nodes[&hop].best_from {
                if prev == root {
                    break;
                }
                hop = prev;
            }
            published.insert(*id, Route { next_hop: hop, label: state.nodes[&hop].best_link });
        }

        state.published = published;
        state.published_version += 1;
        trace!("published forwarding table v{}", state.published_version);
    }
}

impl Drop for RoutingTable {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }
}
