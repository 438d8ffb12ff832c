use crate::types::{ErrorCode, NonZeroStreamId, StreamId};
use std::{io, sync::Arc};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying byte stream failed or reached end-of-stream.
    #[error("transport: {0}")]
    Transport(#[from] io::Error),

    #[error("tls: {0}")]
    Tls(String),

    /// The peer negotiated something other than `h2` via ALPN.
    #[error("peer did not negotiate h2")]
    AlpnRejected,

    /// Malformed or oversized frame; fatal to the connection.
    #[error("framing ({code:?}): {reason}")]
    Framing { code: ErrorCode, reason: &'static str },

    /// Malformed frame whose effect is scoped to one stream. The dispatcher
    /// answers with RST_STREAM instead of tearing the connection down.
    #[error("malformed frame on stream {stream} ({code:?}): {reason}")]
    MalformedStreamFrame {
        stream: NonZeroStreamId,
        code: ErrorCode,
        reason: &'static str,
    },

    #[error("header compression: {0:?}")]
    Hpack(hpack::decoder::DecoderError),

    #[error("flow control: {0}")]
    FlowControl(&'static str),

    /// The peer reset the stream.
    #[error("stream reset by peer: {0:?}")]
    StreamReset(ErrorCode),

    #[error("peer went away (last stream {last_stream}, {code:?})")]
    RemoteGoAway {
        last_stream: StreamId,
        code: ErrorCode,
        debug: String,
    },

    /// The stream id is above the peer's GOAWAY last-stream-id.
    #[error("stream refused by peer shutdown")]
    RefusedStream,

    #[error("connection is shutting down after GOAWAY")]
    GoAwayInProgress,

    #[error("no PING acknowledgement within the timeout")]
    PingTimeout,

    #[error("PING payload must be exactly 8 bytes")]
    InvalidPingPayload,

    #[error("peer's concurrent stream limit reached")]
    TooManyStreams,

    #[error("client stream ids exhausted")]
    StreamIdExhausted,

    #[error("internal: {0}")]
    Internal(&'static str),

    /// The connection was already poisoned by an earlier failure; the
    /// original cause is carried along.
    #[error("connection closed: {0}")]
    Closed(Arc<Error>),
}

impl Error {
    pub(crate) fn framing(code: ErrorCode, reason: &'static str) -> Self {
        Error::Framing { code, reason }
    }

    /// Error code to put on the GOAWAY frame when this failure poisons the
    /// connection. `None` when emitting GOAWAY is pointless (the transport
    /// itself is gone).
    pub(crate) fn goaway_code(&self) -> Option<ErrorCode> {
        match self {
            Error::Framing { code, .. } => Some(*code),
            Error::Hpack(_) => Some(ErrorCode::CompressionError),
            Error::FlowControl(_) => Some(ErrorCode::FlowControlError),
            Error::PingTimeout => Some(ErrorCode::ProtocolError),
            Error::Transport(_)
            | Error::Tls(_)
            | Error::AlpnRejected
            | Error::RemoteGoAway { .. }
            | Error::GoAwayInProgress
            | Error::Closed(_) => None,
            _ => Some(ErrorCode::InternalError),
        }
    }
}
