//! Admission gates that implement the per-stream delivery disciplines.
//!
//! A receive mode decides when a message sequence number may be processed. Callers register
//!  intent with [ReceiveMode::begin]; the mode answers through a one-shot channel, immediately or
//!  once ordering constraints allow it, and must then be told the outcome via
//!  [ReceiveMode::completed]. Every registered completion channel fires exactly once, including
//!  on [ReceiveMode::close].

use std::collections::BTreeMap;

use bit_set::BitSet;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::oneshot;
use tracing::debug;

use crate::status::{Status, StatusResult};

/// Completion channel for a single `begin` call. `Ok(())` means the caller may process the
///  message; an error means it must not (duplicate, out of window, or mode closed).
pub type ReadySender = oneshot::Sender<StatusResult<()>>;

/// The delivery discipline of a stream, fixed at stream creation. The numeric values travel in
///  stream-introduction control payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReliabilityAndOrdering {
    ReliableOrdered = 0,
    ReliableUnordered = 1,
    UnreliableOrdered = 2,
    UnreliableUnordered = 3,
    TailReliable = 4,
}

pub trait ReceiveMode {
    /// Registers intent to process message `seq`. The `ready` channel fires exactly once.
    fn begin(&mut self, seq: u64, ready: ReadySender);

    /// Reports the outcome of a message whose `begin` was answered with `Ok`. Must be called
    ///  exactly once per admitted sequence number.
    fn completed(&mut self, seq: u64, status: Status);

    /// Idempotent. Pending `begin` channels fire with `status.or_cancelled()`.
    fn close(&mut self, status: Status);
}

fn send_ready(ready: ReadySender, result: StatusResult<()>) {
    // the caller may have lost interest; that is not an error here
    let _ = ready.send(result);
}

/// Strict in-order gate: sequence numbers are admitted one at a time, in increasing order
///  without gaps. Higher sequences queue until everything before them has completed
///  successfully.
pub struct ReliableOrdered {
    cur: u64,
    in_progress: bool,
    queued: BTreeMap<u64, ReadySender>,
    closed: Option<Status>,
}

impl ReliableOrdered {
    pub fn new() -> ReliableOrdered {
        ReliableOrdered { cur: 1, in_progress: false, queued: BTreeMap::new(), closed: None }
    }

    fn start_next_queued(&mut self) {
        if let Some(ready) = self.queued.remove(&self.cur) {
            self.in_progress = true;
            send_ready(ready, Ok(()));
        }
    }
}

impl ReceiveMode for ReliableOrdered {
    fn begin(&mut self, seq: u64, ready: ReadySender) {
        if let Some(status) = &self.closed {
            send_ready(ready, Err(status.or_cancelled()));
            return;
        }
        if seq < self.cur || (seq == self.cur && self.in_progress) {
            send_ready(ready, Err(Status::cancelled()));
            return;
        }
        if seq == self.cur {
            self.in_progress = true;
            send_ready(ready, Ok(()));
            return;
        }
        if self.queued.contains_key(&seq) {
            send_ready(ready, Err(Status::cancelled()));
            return;
        }
        self.queued.insert(seq, ready);
    }

    fn completed(&mut self, seq: u64, status: Status) {
        if self.closed.is_some() {
            return;
        }
        assert!(self.in_progress && seq == self.cur, "completed() without a matching begin()");
        self.in_progress = false;
        if status.is_ok() {
            self.cur += 1;
            self.start_next_queued();
        }
        // a failed in-order message keeps the gate at `cur`; the retransmission re-begins it
    }

    fn close(&mut self, status: Status) {
        if self.closed.is_some() {
            return;
        }
        debug!("closing receive mode: {}", status);
        let flush = status.or_cancelled();
        self.closed = Some(status);
        for (_, ready) in std::mem::take(&mut self.queued) {
            send_ready(ready, Err(flush.clone()));
        }
    }
}

/// shifts window-relative bit indices down after the tip advanced by `by`
fn shift_bits(bits: &mut BitSet, by: usize) {
    let shifted = bits.iter()
        .filter(|&i| i >= by)
        .map(|i| i - by)
        .collect();
    *bits = shifted;
}

/// Windowed out-of-order gate: any sequence inside `[tip, tip+window)` is admitted at once,
///  completions may arrive in any order, and the tip slides past the contiguous run of
///  successfully completed slots. Sequences beyond the window queue until it slides.
pub struct ReliableUnordered {
    tip: u64,
    window: usize,
    in_progress: BitSet,
    done: BitSet,
    queued: BTreeMap<u64, ReadySender>,
    closed: Option<Status>,
}

impl ReliableUnordered {
    pub fn new(window: usize) -> ReliableUnordered {
        assert!(window >= 1);
        ReliableUnordered {
            tip: 1,
            window,
            in_progress: BitSet::with_capacity(window),
            done: BitSet::with_capacity(window),
            queued: BTreeMap::new(),
            closed: None,
        }
    }

    fn admit(&mut self, seq: u64, ready: ReadySender) {
        let slot = (seq - self.tip) as usize;
        if self.in_progress.contains(slot) || self.done.contains(slot) {
            send_ready(ready, Err(Status::cancelled()));
            return;
        }
        self.in_progress.insert(slot);
        send_ready(ready, Ok(()));
    }

    fn slide_window(&mut self) {
        let mut advance = 0usize;
        while advance < self.window && self.done.contains(advance) {
            advance += 1;
        }
        if advance == 0 {
            return;
        }
        self.tip += advance as u64;
        shift_bits(&mut self.in_progress, advance);
        shift_bits(&mut self.done, advance);

        let in_window: Vec<u64> = self.queued
            .range(..self.tip + self.window as u64)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in in_window {
            let ready = self.queued.remove(&seq).unwrap();
            if seq < self.tip {
                send_ready(ready, Err(Status::cancelled()));
            }
            else {
                self.admit(seq, ready);
            }
        }
    }
}

impl ReceiveMode for ReliableUnordered {
    fn begin(&mut self, seq: u64, ready: ReadySender) {
        if let Some(status) = &self.closed {
            send_ready(ready, Err(status.or_cancelled()));
            return;
        }
        if seq < self.tip {
            send_ready(ready, Err(Status::cancelled()));
            return;
        }
        if seq >= self.tip + self.window as u64 {
            if self.queued.contains_key(&seq) {
                send_ready(ready, Err(Status::cancelled()));
            }
            else {
                self.queued.insert(seq, ready);
            }
            return;
        }
        self.admit(seq, ready);
    }

    fn completed(&mut self, seq: u64, status: Status) {
        if self.closed.is_some() || seq < self.tip {
            return;
        }
        let slot = (seq - self.tip) as usize;
        assert!(self.in_progress.contains(slot), "completed() without a matching begin()");
        self.in_progress.remove(slot);
        if status.is_ok() {
            self.done.insert(slot);
            self.slide_window();
        }
    }

    fn close(&mut self, status: Status) {
        if self.closed.is_some() {
            return;
        }
        debug!("closing receive mode: {}", status);
        let flush = status.or_cancelled();
        self.closed = Some(status);
        for (_, ready) in std::mem::take(&mut self.queued) {
            send_ready(ready, Err(flush.clone()));
        }
    }
}

/// Latest-wins ordered gate: one message is processed at a time, newer sequence numbers may
///  jump the gate forward over lost or failed older ones. Also serves tail-reliable streams,
///  whose sender-side retry policy differs but whose receive discipline is identical.
pub struct UnreliableOrdered {
    cur: u64,
    in_progress: bool,
    queued: BTreeMap<u64, ReadySender>,
    closed: Option<Status>,
}

impl UnreliableOrdered {
    pub fn new() -> UnreliableOrdered {
        UnreliableOrdered { cur: 1, in_progress: false, queued: BTreeMap::new(), closed: None }
    }
}

impl ReceiveMode for UnreliableOrdered {
    fn begin(&mut self, seq: u64, ready: ReadySender) {
        if let Some(status) = &self.closed {
            send_ready(ready, Err(status.or_cancelled()));
            return;
        }
        if seq < self.cur || (seq == self.cur && self.in_progress) {
            send_ready(ready, Err(Status::cancelled()));
            return;
        }
        if !self.in_progress {
            // jump-ahead: an idle gate admits any future sequence directly
            self.cur = seq;
            self.in_progress = true;
            send_ready(ready, Ok(()));
            return;
        }
        if self.queued.contains_key(&seq) {
            send_ready(ready, Err(Status::cancelled()));
            return;
        }
        self.queued.insert(seq, ready);
    }

    fn completed(&mut self, seq: u64, status: Status) {
        if self.closed.is_some() {
            return;
        }
        assert!(self.in_progress && seq == self.cur, "completed() without a matching begin()");
        self.in_progress = false;
        if let Some((&next, _)) = self.queued.iter().next() {
            let ready = self.queued.remove(&next).unwrap();
            self.cur = next;
            self.in_progress = true;
            send_ready(ready, Ok(()));
        }
        else if status.is_ok() {
            self.cur += 1;
        }
        // on failure with nothing queued the gate stays at `cur` until a newer sequence
        //  jumps it ahead
    }

    fn close(&mut self, status: Status) {
        if self.closed.is_some() {
            return;
        }
        debug!("closing receive mode: {}", status);
        let flush = status.or_cancelled();
        self.closed = Some(status);
        for (_, ready) in std::mem::take(&mut self.queued) {
            send_ready(ready, Err(flush.clone()));
        }
    }
}

/// Windowed fire-and-forget gate: like [ReliableUnordered] inside the window, but sequences
///  beyond the window are dropped rather than queued, and a failed slot is simply forgotten.
pub struct UnreliableUnordered {
    tip: u64,
    window: usize,
    in_progress: BitSet,
    done: BitSet,
    closed: Option<Status>,
}

impl UnreliableUnordered {
    pub fn new(window: usize) -> UnreliableUnordered {
        assert!(window >= 1);
        UnreliableUnordered {
            tip: 1,
            window,
            in_progress: BitSet::with_capacity(window),
            done: BitSet::with_capacity(window),
            closed: None,
        }
    }
}

impl ReceiveMode for UnreliableUnordered {
    fn begin(&mut self, seq: u64, ready: ReadySender) {
        if let Some(status) = &self.closed {
            send_ready(ready, Err(status.or_cancelled()));
            return;
        }
        if seq < self.tip || seq >= self.tip + self.window as u64 {
            send_ready(ready, Err(Status::cancelled()));
            return;
        }
        let slot = (seq - self.tip) as usize;
        if self.in_progress.contains(slot) || self.done.contains(slot) {
            send_ready(ready, Err(Status::cancelled()));
            return;
        }
        self.in_progress.insert(slot);
        send_ready(ready, Ok(()));
    }

    fn completed(&mut self, seq: u64, status: Status) {
        if self.closed.is_some() || seq < self.tip {
            return;
        }
        let slot = (seq - self.tip) as usize;
        assert!(self.in_progress.contains(slot), "completed() without a matching begin()");
        self.in_progress.remove(slot);
        if !status.is_ok() {
            return;
        }
        self.done.insert(slot);
        let mut advance = 0usize;
        while advance < self.window && self.done.contains(advance) {
            advance += 1;
        }
        if advance > 0 {
            self.tip += advance as u64;
            shift_bits(&mut self.in_progress, advance);
            shift_bits(&mut self.done, advance);
        }
    }

    fn close(&mut self, status: Status) {
        if self.closed.is_some() {
            return;
        }
        debug!("closing receive mode: {}", status);
        self.closed = Some(status);
    }
}

/// Fallback for a peer that announced a reliability value this node does not know: every
///  message is refused, nothing is ever admitted.
pub struct ErrorMode;

impl ReceiveMode for ErrorMode {
    fn begin(&mut self, _seq: u64, ready: ReadySender) {
        send_ready(ready, Err(Status::cancelled()));
    }

    fn completed(&mut self, _seq: u64, _status: Status) {
        panic!("no message is ever admitted by the error mode");
    }

    fn close(&mut self, _status: Status) {}
}

/// Runtime-selected receive mode, dispatched by the stream's announced discipline.
pub enum ParameterizedReceiveMode {
    ReliableOrdered(ReliableOrdered),
    ReliableUnordered(ReliableUnordered),
    UnreliableOrdered(UnreliableOrdered),
    UnreliableUnordered(UnreliableUnordered),
    TailReliable(UnreliableOrdered),
    Error(ErrorMode),
}

impl ParameterizedReceiveMode {
    pub fn new(discipline: ReliabilityAndOrdering, window: usize) -> ParameterizedReceiveMode {
        match discipline {
            ReliabilityAndOrdering::ReliableOrdered =>
                ParameterizedReceiveMode::ReliableOrdered(ReliableOrdered::new()),
            ReliabilityAndOrdering::ReliableUnordered =>
                ParameterizedReceiveMode::ReliableUnordered(ReliableUnordered::new(window)),
            ReliabilityAndOrdering::UnreliableOrdered =>
                ParameterizedReceiveMode::UnreliableOrdered(UnreliableOrdered::new()),
            ReliabilityAndOrdering::UnreliableUnordered =>
                ParameterizedReceiveMode::UnreliableUnordered(UnreliableUnordered::new(window)),
            ReliabilityAndOrdering::TailReliable =>
                ParameterizedReceiveMode::TailReliable(UnreliableOrdered::new()),
        }
    }

    /// For disciplines received from the wire: an unknown value falls back to the error mode
    ///  rather than failing stream creation.
    pub fn from_wire(raw: u8, window: usize) -> ParameterizedReceiveMode {
        match ReliabilityAndOrdering::try_from(raw) {
            Ok(discipline) => ParameterizedReceiveMode::new(discipline, window),
            Err(_) => {
                debug!("unknown reliability value {}, refusing all messages", raw);
                ParameterizedReceiveMode::Error(ErrorMode)
            }
        }
    }

    fn inner(&mut self) -> &mut dyn ReceiveMode {
        match self {
            ParameterizedReceiveMode::ReliableOrdered(mode) => mode,
            ParameterizedReceiveMode::ReliableUnordered(mode) => mode,
            ParameterizedReceiveMode::UnreliableOrdered(mode) => mode,
            ParameterizedReceiveMode::UnreliableUnordered(mode) => mode,
            ParameterizedReceiveMode::TailReliable(mode) => mode,
            ParameterizedReceiveMode::Error(mode) => mode,
        }
    }
}

impl ReceiveMode for ParameterizedReceiveMode {
    fn begin(&mut self, seq: u64, ready: ReadySender) {
        self.inner().begin(seq, ready)
    }

    fn completed(&mut self, seq: u64, status: Status) {
        self.inner().completed(seq, status)
    }

    fn close(&mut self, status: Status) {
        self.inner().close(status)
    }
}
