use crate::{
    error::{Error, Result},
    stream::{StreamEvent, StreamShared, StreamState},
    types::*,
};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

/// How long a closed stream id keeps absorbing late frames before they
/// become a STREAM_CLOSED connection error.
pub const CLOSED_GRACE: Duration = Duration::from_secs(2);

/// Dispatcher's end of one active stream.
pub(crate) struct StreamEntry {
    pub shared: Arc<StreamShared>,
    pub state: StreamState,
    pub events: mpsc::Sender<StreamEvent>,
}

/// Routing table for active streams plus the id-allocation and GOAWAY
/// bookkeeping. Guarded by a plain mutex; every operation is O(1)-ish and
/// never held across an await point.
pub(crate) struct Registry {
    next_client_id: u32,
    active: HashMap<NonZeroStreamId, StreamEntry>,
    /// Client-initiated streams counted against the peer's
    /// MAX_CONCURRENT_STREAMS.
    client_active: usize,
    /// Highest stream id observed on any received frame; reported in the
    /// GOAWAY we send.
    max_received: StreamId,
    recently_closed: HashMap<NonZeroStreamId, Instant>,
    remote_goaway: Option<StreamId>,
    local_goaway: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_client_id: 1,
            active: HashMap::new(),
            client_active: 0,
            max_received: 0,
            recently_closed: HashMap::new(),
            remote_goaway: None,
            local_goaway: false,
        }
    }

    /// Hands out the next odd client stream id.
    pub fn allocate(&mut self, max_concurrent: u32) -> Result<NonZeroStreamId> {
        if self.remote_goaway.is_some() || self.local_goaway {
            return Err(Error::GoAwayInProgress);
        }
        if self.client_active as u64 >= u64::from(max_concurrent) {
            return Err(Error::TooManyStreams);
        }
        if self.next_client_id > U31_MAX {
            return Err(Error::StreamIdExhausted);
        }
        // unwrap: client ids start at 1 and only grow
        let id = NonZeroStreamId::new(self.next_client_id).unwrap();
        self.next_client_id += 2;
        self.client_active += 1;
        Ok(id)
    }

    pub fn insert(&mut self, id: NonZeroStreamId, entry: StreamEntry) {
        self.active.insert(id, entry);
    }

    pub fn get_mut(&mut self, id: NonZeroStreamId) -> Option<&mut StreamEntry> {
        self.active.get_mut(&id)
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = (&NonZeroStreamId, &mut StreamEntry)> {
        self.active.iter_mut()
    }

    /// Removes a terminal stream and remembers the id for the grace window.
    pub fn close(&mut self, id: NonZeroStreamId, now: Instant) -> Option<StreamEntry> {
        let entry = self.active.remove(&id)?;
        if id.get() % 2 == 1 {
            self.client_active -= 1;
        }
        self.recently_closed.insert(id, now);
        Some(entry)
    }

    pub fn was_recently_closed(&self, id: NonZeroStreamId, now: Instant) -> bool {
        self.recently_closed
            .get(&id)
            .map_or(false, |closed| now.duration_since(*closed) < CLOSED_GRACE)
    }

    /// True for ids we have never seen in either direction; late frames on
    /// those are a protocol violation rather than stragglers.
    pub fn is_unknown(&self, id: NonZeroStreamId) -> bool {
        let odd = id.get() % 2 == 1;
        if odd {
            id.get() >= self.next_client_id
        } else {
            id.get() > self.max_received && !self.recently_closed.contains_key(&id)
        }
    }

    pub fn prune_closed(&mut self, now: Instant) {
        self.recently_closed
            .retain(|_, closed| now.duration_since(*closed) < CLOSED_GRACE);
    }

    pub fn note_received(&mut self, id: StreamId) {
        if id > self.max_received {
            self.max_received = id;
        }
    }

    pub fn max_received(&self) -> StreamId {
        self.max_received
    }

    pub fn set_remote_goaway(&mut self, last_stream: StreamId) {
        self.remote_goaway = Some(last_stream);
    }

    pub fn set_local_goaway(&mut self) {
        self.local_goaway = true;
    }

    /// Client streams above the peer's GOAWAY last-stream-id; they will
    /// never be processed and are refused.
    pub fn refused_by(&mut self, last_stream: StreamId, now: Instant) -> Vec<StreamEntry> {
        let refused: Vec<NonZeroStreamId> = self
            .active
            .keys()
            .filter(|id| id.get() % 2 == 1 && id.get() > last_stream)
            .copied()
            .collect();
        refused
            .into_iter()
            .filter_map(|id| self.close(id, now))
            .collect()
    }

    /// Empties the table at connection teardown.
    pub fn drain(&mut self) -> Vec<StreamEntry> {
        self.client_active = 0;
        self.active.drain().map(|(_, entry)| entry).collect()
    }
}
