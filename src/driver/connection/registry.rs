//! Stream id allocation and reply correlation for one connection.
//!
//! Every in-flight request owns a stream id until its reply is consumed. A
//! request that stops waiting (timeout or cancellation) leaves its id
//! orphaned: the id is not handed out again until the late reply arrives or
//! the orphan has been held for longer than the grace window. A reply that
//! turns up after its id was recycled is dropped once without breaking the
//! connection.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::driver::events::{DriverEvent, SharedEventListener};
use crate::driver::protocol::frame::Frame;
use crate::driver::protocol::types::MAX_STREAM_ID;
use crate::error::{DriverError, DriverResult};

pub type ReplySender = oneshot::Sender<DriverResult<Frame>>;
pub type ReplyReceiver = oneshot::Receiver<DriverResult<Frame>>;

enum Slot {
    Waiting(ReplySender),
    Orphaned(Instant),
}

/// How the reader task's reply was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Delivered,
    /// The reply belonged to an orphaned request; its id is free again,
    /// or was already recycled after the grace window.
    Reclaimed,
    /// No request owns this stream id.
    Unknown,
}

#[derive(Default)]
struct RegistryState {
    free: Vec<i16>,
    next_unused: i32,
    pending: HashMap<i16, Slot>,
    /// Orphans recycled after the grace window whose reply never came.
    recycled: HashSet<i16>,
    closed: Option<DriverError>,
}

impl RegistryState {
    fn release(&mut self, stream: i16) {
        self.free.push(stream);
    }

    fn reclaim_expired(&mut self, grace: Duration) -> Vec<i16> {
        let now = Instant::now();
        let expired: Vec<i16> = self
            .pending
            .iter()
            .filter_map(|(&stream, slot)| match slot {
                Slot::Orphaned(since) if now.duration_since(*since) >= grace => Some(stream),
                _ => None,
            })
            .collect();
        for stream in &expired {
            self.pending.remove(stream);
            self.recycled.insert(*stream);
            self.release(*stream);
        }
        expired
    }
}

pub struct StreamRegistry {
    state: Mutex<RegistryState>,
    orphan_grace: Duration,
    address: String,
    events: SharedEventListener,
}

impl StreamRegistry {
    pub fn new(
        address: impl Into<String>,
        orphan_grace: Duration,
        events: SharedEventListener,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            orphan_grace,
            address: address.into(),
            events,
        }
    }

    /// Reserve a stream id and the receiver its reply will be delivered to.
    ///
    /// Returns `Ok(None)` when every id is in use, so callers can try another
    /// connection.
    pub fn allocate(&self) -> DriverResult<Option<(i16, ReplyReceiver)>> {
        let (allocated, reclaimed) = {
            let mut state = self.state.lock();
            if let Some(err) = &state.closed {
                return Err(err.clone());
            }

            let mut reclaimed = Vec::new();
            let stream = match state.free.pop() {
                Some(stream) => Some(stream),
                None if state.next_unused <= i32::from(MAX_STREAM_ID) => {
                    let stream = state.next_unused as i16;
                    state.next_unused += 1;
                    Some(stream)
                }
                None => {
                    reclaimed = state.reclaim_expired(self.orphan_grace);
                    state.free.pop()
                }
            };

            let allocated = stream.map(|stream| {
                let (tx, rx) = oneshot::channel();
                state.pending.insert(stream, Slot::Waiting(tx));
                (stream, rx)
            });
            (allocated, reclaimed)
        };

        for stream in reclaimed {
            self.events.on_event(&DriverEvent::StreamReclaimed {
                address: &self.address,
                stream,
            });
        }
        Ok(allocated)
    }

    /// Hand a reply to the request waiting on its stream id.
    pub fn complete(&self, stream: i16, frame: Frame) -> Completion {
        let mut state = self.state.lock();
        let Some(slot) = state.pending.remove(&stream) else {
            // Late reply for an orphan that was already handed out again.
            if state.recycled.remove(&stream) {
                return Completion::Reclaimed;
            }
            return Completion::Unknown;
        };
        state.release(stream);
        drop(state);

        match slot {
            Slot::Waiting(tx) => {
                if tx.send(Ok(frame)).is_ok() {
                    Completion::Delivered
                } else {
                    self.reclaimed(stream)
                }
            }
            Slot::Orphaned(_) => self.reclaimed(stream),
        }
    }

    fn reclaimed(&self, stream: i16) -> Completion {
        self.events.on_event(&DriverEvent::StreamReclaimed {
            address: &self.address,
            stream,
        });
        Completion::Reclaimed
    }

    /// Mark a waiting request as abandoned. Returns false if it already
    /// completed.
    pub fn orphan(&self, stream: i16) -> bool {
        let orphaned = {
            let mut state = self.state.lock();
            match state.pending.get_mut(&stream) {
                Some(slot) if matches!(slot, Slot::Waiting(_)) => {
                    *slot = Slot::Orphaned(Instant::now());
                    true
                }
                _ => false,
            }
        };
        if orphaned {
            self.events.on_event(&DriverEvent::StreamOrphaned {
                address: &self.address,
                stream,
            });
        }
        orphaned
    }

    /// Give back an id whose request was never written.
    pub fn cancel(&self, stream: i16) {
        let mut state = self.state.lock();
        if matches!(state.pending.get(&stream), Some(Slot::Waiting(_))) {
            state.pending.remove(&stream);
            state.release(stream);
        }
    }

    /// Fail every waiting request and refuse further allocations.
    pub fn fail_all(&self, error: DriverError) {
        let drained: Vec<Slot> = {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(error.clone());
            }
            state.free.clear();
            state.recycled.clear();
            state.pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            if let Slot::Waiting(tx) = slot {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// Requests currently waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .pending
            .values()
            .filter(|slot| matches!(slot, Slot::Waiting(_)))
            .count()
    }

    pub fn orphaned(&self) -> usize {
        self.state
            .lock()
            .pending
            .values()
            .filter(|slot| matches!(slot, Slot::Orphaned(_)))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }
}

/// Owns a reserved stream id until the reply is received.
///
/// Dropped before the frame was written, the id is returned immediately.
/// Dropped after, the id is orphaned.
pub struct PendingRequest<'a> {
    registry: &'a StreamRegistry,
    stream: i16,
    sent: bool,
    armed: bool,
}

impl<'a> PendingRequest<'a> {
    pub fn new(registry: &'a StreamRegistry, stream: i16) -> Self {
        Self {
            registry,
            stream,
            sent: false,
            armed: true,
        }
    }

    pub fn stream(&self) -> i16 {
        self.stream
    }

    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.sent {
            self.registry.orphan(self.stream);
        } else {
            self.registry.cancel(self.stream);
        }
    }
}
