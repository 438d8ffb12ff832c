use crate::{
    connection::Shared,
    error::{Error, Result},
    flow::{FlowWindow, WindowCredit},
    types::*,
};
use bytes::Bytes;
use log::trace;
use std::sync::{atomic::AtomicI64, Arc};
use tokio::sync::mpsc;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    #[must_use]
    pub fn on_send_headers(self, end_stream: bool) -> Self {
        let state = match self {
            StreamState::Idle => StreamState::Open,
            other => other,
        };
        if end_stream {
            state.on_send_end()
        } else {
            state
        }
    }

    /// END_STREAM left this endpoint (HEADERS or DATA).
    #[must_use]
    pub fn on_send_end(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    #[must_use]
    pub fn on_recv_headers(self, end_stream: bool) -> Self {
        let state = match self {
            StreamState::Idle => StreamState::Open,
            // promised stream delivering its response headers
            StreamState::ReservedRemote => StreamState::HalfClosedLocal,
            other => other,
        };
        if end_stream {
            state.on_recv_end()
        } else {
            state
        }
    }

    /// END_STREAM arrived from the peer (HEADERS or DATA).
    #[must_use]
    pub fn on_recv_end(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }

    /// RST_STREAM in either direction is immediately terminal.
    #[must_use]
    pub fn on_reset(self) -> Self {
        StreamState::Closed
    }

    #[must_use]
    pub fn is_closed(self) -> bool {
        self == StreamState::Closed
    }
}

/// What a stream consumer observes, in wire order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A decoded header block: the response headers, or trailers when a
    /// block with `end_stream` follows DATA.
    Headers { headers: Headers, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    /// The stream was reset (by the peer, or refused via GOAWAY).
    Reset(ErrorCode),
    /// Terminal: the whole connection failed with the carried cause.
    ConnectionClosed(Arc<Error>),
}

/// Flow-control state shared between the dispatcher and one stream's
/// consumer.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub id: NonZeroStreamId,
    /// Credit for DATA we send; replenished by peer WINDOW_UPDATEs.
    pub send_window: FlowWindow,
    /// Octets the peer may still send us; goes negative on overrun.
    pub recv_window: AtomicI64,
    /// Consumed octets waiting to become a WINDOW_UPDATE.
    pub credit: WindowCredit,
}

impl StreamShared {
    pub fn new(id: NonZeroStreamId, send_initial: u32, recv_initial: u32) -> Self {
        Self {
            id,
            send_window: FlowWindow::new(send_initial),
            recv_window: AtomicI64::new(i64::from(recv_initial)),
            credit: WindowCredit::new(recv_initial / 2),
        }
    }
}

/// Caller's end of one stream: sends body data, consumes events, resets or
/// cancels. Dropping an unfinished handle sends RST_STREAM(CANCEL).
pub struct StreamHandle {
    conn: Arc<Shared>,
    shared: Arc<StreamShared>,
    events: mpsc::Receiver<StreamEvent>,
    sent_end: bool,
    recv_end: bool,
    finished: bool,
}

impl StreamHandle {
    pub(crate) fn new(
        conn: Arc<Shared>,
        shared: Arc<StreamShared>,
        events: mpsc::Receiver<StreamEvent>,
        sent_end: bool,
    ) -> Self {
        Self {
            conn,
            shared,
            events,
            sent_end,
            recv_end: false,
            finished: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> NonZeroStreamId {
        self.shared.id
    }

    /// Sends body data, splitting at the peer's max frame size and blocking
    /// until flow-control credit exists on both the stream and the
    /// connection.
    pub async fn send_data(&mut self, mut data: Bytes, end_stream: bool) -> Result<()> {
        if self.sent_end {
            return Err(Error::Internal("END_STREAM was already sent"));
        }
        loop {
            if data.is_empty() {
                // only an explicit empty END_STREAM frame remains to send
                if end_stream {
                    self.conn
                        .send_data_frame(&self.shared, Bytes::new(), true)
                        .await?;
                    self.sent_end = true;
                    self.note_half_close();
                }
                return Ok(());
            }
            let want = data.len().min(self.conn.remote_max_frame_size() as usize);
            let taken = match self.shared.send_window.reserve_upto(want).await {
                Some(taken) => taken,
                None => return Err(self.conn.fail()),
            };
            let granted = match self.conn.send_window.reserve_upto(taken).await {
                Some(granted) => granted,
                None => return Err(self.conn.fail()),
            };
            if granted < taken {
                // hand the surplus back; cannot overflow, we just took it
                let _ = self.shared.send_window.release((taken - granted) as u32);
            }
            let chunk = data.split_to(granted);
            let last = end_stream && data.is_empty();
            self.conn.send_data_frame(&self.shared, chunk, last).await?;
            if last {
                self.sent_end = true;
                self.note_half_close();
                return Ok(());
            }
        }
    }

    /// Next event in wire order; `None` once the stream is over. Receiving
    /// DATA replenishes the peer's window for the consumed octets.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = match self.events.recv().await {
            Some(event) => event,
            None if self.finished => return None,
            // dispatcher dropped the mailbox without a terminal event:
            // the connection is gone
            None => {
                self.finished = true;
                return Some(StreamEvent::ConnectionClosed(self.conn.poison_cause()));
            }
        };
        match &event {
            StreamEvent::Data { data, end_stream } => {
                self.conn.replenish(&self.shared, data.len() as u32).await;
                if *end_stream {
                    self.recv_end = true;
                    self.note_half_close();
                }
            }
            StreamEvent::Headers { end_stream, .. } => {
                if *end_stream {
                    self.recv_end = true;
                    self.note_half_close();
                }
            }
            StreamEvent::Reset(_) | StreamEvent::ConnectionClosed(_) => {
                self.finished = true;
            }
        }
        Some(event)
    }

    /// Tears the stream down with the given error code.
    pub async fn reset(mut self, code: ErrorCode) -> Result<()> {
        self.finished = true;
        self.conn.reset_stream(self.shared.id, code).await
    }

    fn note_half_close(&mut self) {
        if self.sent_end && self.recv_end {
            trace!("stream {} finished", self.shared.id);
            self.finished = true;
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.cancel_stream(self.shared.id);
        }
    }
}

/// A server push delivered through the push-promise sink: the promised
/// (even) stream id, the request the server answered preemptively, and the
/// handle on which the pushed response arrives.
pub struct PushedStream {
    pub parent: NonZeroStreamId,
    pub promised: NonZeroStreamId,
    pub headers: Headers,
    pub handle: StreamHandle,
}

#[cfg(test)]
mod tests {
    use super::StreamState::*;

    #[test]
    fn request_response_lifecycle() {
        // plain GET: HEADERS+END_STREAM out, HEADERS then DATA+END_STREAM in
        let state = Idle.on_send_headers(true);
        assert_eq!(state, HalfClosedLocal);
        let state = state.on_recv_headers(false);
        assert_eq!(state, HalfClosedLocal);
        assert_eq!(state.on_recv_end(), Closed);
    }

    #[test]
    fn upload_lifecycle() {
        let state = Idle.on_send_headers(false);
        assert_eq!(state, Open);
        let state = state.on_recv_headers(false);
        assert_eq!(state, Open);
        let state = state.on_send_end();
        assert_eq!(state, HalfClosedLocal);
        assert_eq!(state.on_recv_end(), Closed);
    }

    #[test]
    fn pushed_stream_lifecycle() {
        let state = ReservedRemote.on_recv_headers(false);
        assert_eq!(state, HalfClosedLocal);
        assert_eq!(state.on_recv_end(), Closed);
        assert_eq!(ReservedRemote.on_recv_headers(true), Closed);
    }

    #[test]
    fn reset_is_terminal_from_anywhere() {
        for state in [Idle, Open, HalfClosedLocal, HalfClosedRemote, ReservedRemote] {
            assert!(state.on_reset().is_closed());
        }
    }
}
