#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
)]

mod client;
mod connection;
mod error;
pub mod flags;
mod flow;
pub mod frame;
mod hpack;
mod registry;
mod request;
mod response;
mod stream;
pub mod transport;
mod types;

pub use bytes::Bytes;
pub use client::Client;
pub use connection::{Connection, ConnectionConfig, FallbackSink, GoAway, Ping};
pub use error::{Error, Result};
pub use request::{Method, Request};
pub use response::Response;
pub use stream::{PushedStream, StreamEvent, StreamHandle, StreamState};
pub use types::{
    ErrorCode, FrameType, Headers, NonZeroStreamId, SettingsParameter, StreamId,
    CONNECTION_PREFACE, U31_MAX,
};
pub use url::Url;
