use enum_map::{enum_map, EnumMap};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::num::NonZeroU32;

/// Largest value representable in the 31-bit stream id / window domain.
pub const U31_MAX: u32 = u32::MAX >> 1;

pub type StreamId = u32;
pub type NonZeroStreamId = NonZeroU32;

/// Ordered header list. Pseudo-headers come first; duplicates are allowed
/// and order is significant for HPACK round-trips.
pub type Headers = Vec<(String, String)>;

/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Wire value to enum; unknown codes collapse to `InternalError`, which
    /// the RFC permits a receiver to do.
    #[must_use]
    pub fn from_wire(value: u32) -> Self {
        Self::from_u32(value).unwrap_or(ErrorCode::InternalError)
    }
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
pub enum SettingsParameter {
    /// Maximum size of the peer's HPACK dynamic table, in octets.
    HeaderTableSize = 0x1,
    /// 0 disables PUSH_PROMISE from the peer; values other than 0/1 are a
    /// PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// How many streams the receiver of the setting may have open at once.
    MaxConcurrentStreams = 0x3,
    /// Initial stream-level flow-control window, in octets.
    InitialWindowSize = 0x4,
    /// Largest frame payload the sender of the setting is willing to receive.
    MaxFrameSize = 0x5,
    /// Advisory bound on the uncompressed header list size.
    MaxHeaderListSize = 0x6,
}

/// RFC 7540 §6.5.2 initial values.
#[must_use]
pub fn default_settings() -> EnumMap<SettingsParameter, u32> {
    enum_map! {
        SettingsParameter::HeaderTableSize => DEFAULT_HEADER_TABLE_SIZE,
        SettingsParameter::EnablePush => 1,
        SettingsParameter::MaxConcurrentStreams => u32::MAX,
        SettingsParameter::InitialWindowSize => DEFAULT_WINDOW_SIZE,
        SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
        SettingsParameter::MaxHeaderListSize => u32::MAX,
    }
}
