use crate::{error::Error, flags::*, types::*};
use bytes::{BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

pub const FRAME_HEADER_LEN: usize = 9;

/// The 9-octet frame header: length(24) | type(8) | flags(8) | R(1) | stream(31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub typ: u8,
    pub flags: u8,
    pub stream: StreamId,
}

impl FrameHeader {
    #[must_use]
    pub fn parse(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            length: u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]),
            typ: bytes[3],
            flags: bytes[4],
            // the reserved bit is masked off on read
            stream: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & U31_MAX,
        }
    }

    fn put(buf: &mut BytesMut, length: usize, typ: u8, flags: u8, stream: StreamId) {
        debug_assert!(length <= MAX_ALLOWED_FRAME_SIZE as usize);
        buf.put_slice(&(length as u32).to_be_bytes()[1..]);
        buf.put_u8(typ);
        buf.put_u8(flags);
        buf.put_u32(stream & U31_MAX);
    }
}

/// Exclusive flag, dependency and weight carried by PRIORITY frames and
/// HEADERS frames with the PRIORITY flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: StreamId,
    pub weight: u8,
}

/// One HTTP/2 frame, decoded. `parse(encode(f)) == f` for every frame this
/// type can represent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
        /// Trailing padding octets; they count against flow control.
        pad: u8,
    },
    Headers {
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    },
    Priority {
        stream: NonZeroStreamId,
        priority: Priority,
    },
    ResetStream {
        stream: NonZeroStreamId,
        code: ErrorCode,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        payload: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        code: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        /// 0 addresses the connection window.
        stream: StreamId,
        increment: NonZeroU32,
    },
    Continuation {
        stream: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
    /// Extension frame type; preserved verbatim for the fallback sink.
    Unknown {
        typ: u8,
        stream: StreamId,
        flags: u8,
        payload: Bytes,
    },
}

fn stream_frame(id: StreamId, what: &'static str) -> Result<NonZeroStreamId, Error> {
    NonZeroStreamId::new(id).ok_or(Error::Framing {
        code: ErrorCode::ProtocolError,
        reason: what,
    })
}

fn connection_frame(id: StreamId, what: &'static str) -> Result<(), Error> {
    if id == 0 {
        Ok(())
    } else {
        Err(Error::framing(ErrorCode::ProtocolError, what))
    }
}

/// Strips `Pad Length` + trailing padding, returning the pad octet count
/// and the remaining payload.
fn strip_padding(padded: bool, payload: Bytes) -> Result<(u8, Bytes), Error> {
    if !padded {
        return Ok((0, payload));
    }
    if payload.is_empty() {
        return Err(Error::framing(
            ErrorCode::FrameSizeError,
            "PADDED frame too short for pad length",
        ));
    }
    let pad = payload[0] as usize;
    if 1 + pad > payload.len() {
        return Err(Error::framing(
            ErrorCode::ProtocolError,
            "padding exceeds frame payload",
        ));
    }
    Ok((pad as u8, payload.slice(1..payload.len() - pad)))
}

fn parse_priority(bytes: &[u8]) -> Priority {
    let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Priority {
        exclusive: raw > U31_MAX,
        dependency: raw & U31_MAX,
        weight: bytes[4],
    }
}

impl Frame {
    pub fn parse(header: FrameHeader, payload: Bytes) -> Result<Self, Error> {
        debug_assert_eq!(header.length as usize, payload.len());
        let Some(typ) = FrameType::from_u8(header.typ) else {
            return Ok(Frame::Unknown {
                typ: header.typ,
                stream: header.stream,
                flags: header.flags,
                payload,
            });
        };
        Ok(match typ {
            FrameType::Data => {
                let stream = stream_frame(header.stream, "DATA on stream 0")?;
                let flags = DataFlags::from_bits_truncate(header.flags);
                let (pad, data) = strip_padding(flags.contains(DataFlags::PADDED), payload)?;
                Frame::Data {
                    stream,
                    flags,
                    data,
                    pad,
                }
            }
            FrameType::Headers => {
                let stream = stream_frame(header.stream, "HEADERS on stream 0")?;
                let mut flags = HeadersFlags::from_bits_truncate(header.flags);
                let (_, mut rest) = strip_padding(flags.contains(HeadersFlags::PADDED), payload)?;
                // padding is meaningless once stripped; normalize the flag away
                flags.remove(HeadersFlags::PADDED);
                let priority = if flags.contains(HeadersFlags::PRIORITY) {
                    if rest.len() < 5 {
                        return Err(Error::framing(
                            ErrorCode::FrameSizeError,
                            "HEADERS too short for priority fields",
                        ));
                    }
                    let priority = parse_priority(&rest[..5]);
                    rest = rest.slice(5..);
                    Some(priority)
                } else {
                    None
                };
                Frame::Headers {
                    stream,
                    flags,
                    priority,
                    fragment: rest,
                }
            }
            FrameType::Priority => {
                let stream = stream_frame(header.stream, "PRIORITY on stream 0")?;
                if payload.len() != 5 {
                    return Err(Error::MalformedStreamFrame {
                        stream,
                        code: ErrorCode::FrameSizeError,
                        reason: "PRIORITY length must be 5",
                    });
                }
                Frame::Priority {
                    stream,
                    priority: parse_priority(&payload[..5]),
                }
            }
            FrameType::ResetStream => {
                let stream = stream_frame(header.stream, "RST_STREAM on stream 0")?;
                if payload.len() != 4 {
                    return Err(Error::framing(
                        ErrorCode::FrameSizeError,
                        "RST_STREAM length must be 4",
                    ));
                }
                Frame::ResetStream {
                    stream,
                    code: ErrorCode::from_wire(u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ])),
                }
            }
            FrameType::Settings => {
                connection_frame(header.stream, "SETTINGS on a stream")?;
                let flags = SettingsFlags::from_bits_truncate(header.flags);
                if flags.contains(SettingsFlags::ACK) && !payload.is_empty() {
                    return Err(Error::framing(
                        ErrorCode::FrameSizeError,
                        "SETTINGS ACK with non-empty payload",
                    ));
                }
                if payload.len() % 6 != 0 {
                    return Err(Error::framing(
                        ErrorCode::FrameSizeError,
                        "SETTINGS length not a multiple of 6",
                    ));
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                for chunk in payload.chunks(6) {
                    // unknown identifiers are ignored per RFC 7540 §6.5.2
                    if let Some(param) =
                        SettingsParameter::from_u16(u16::from_be_bytes([chunk[0], chunk[1]]))
                    {
                        params.push((
                            param,
                            u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
                        ));
                    }
                }
                Frame::Settings { flags, params }
            }
            FrameType::PushPromise => {
                let stream = stream_frame(header.stream, "PUSH_PROMISE on stream 0")?;
                let mut flags = PushPromiseFlags::from_bits_truncate(header.flags);
                let (_, rest) = strip_padding(flags.contains(PushPromiseFlags::PADDED), payload)?;
                flags.remove(PushPromiseFlags::PADDED);
                if rest.len() < 4 {
                    return Err(Error::framing(
                        ErrorCode::FrameSizeError,
                        "PUSH_PROMISE too short for promised stream id",
                    ));
                }
                let promised =
                    u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) & U31_MAX;
                Frame::PushPromise {
                    stream,
                    flags,
                    promised: stream_frame(promised, "promised stream id 0")?,
                    fragment: rest.slice(4..),
                }
            }
            FrameType::Ping => {
                connection_frame(header.stream, "PING on a stream")?;
                if payload.len() != 8 {
                    return Err(Error::framing(
                        ErrorCode::FrameSizeError,
                        "PING length must be 8",
                    ));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Frame::Ping {
                    flags: PingFlags::from_bits_truncate(header.flags),
                    payload: data,
                }
            }
            FrameType::GoAway => {
                connection_frame(header.stream, "GOAWAY on a stream")?;
                if payload.len() < 8 {
                    return Err(Error::framing(
                        ErrorCode::FrameSizeError,
                        "GOAWAY too short",
                    ));
                }
                Frame::GoAway {
                    last_stream: u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]) & U31_MAX,
                    code: ErrorCode::from_wire(u32::from_be_bytes([
                        payload[4], payload[5], payload[6], payload[7],
                    ])),
                    debug: payload.slice(8..),
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(Error::framing(
                        ErrorCode::FrameSizeError,
                        "WINDOW_UPDATE length must be 4",
                    ));
                }
                let increment =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & U31_MAX;
                let Some(increment) = NonZeroU32::new(increment) else {
                    return Err(match NonZeroStreamId::new(header.stream) {
                        // zero increment is stream-scoped on a stream ...
                        Some(stream) => Error::MalformedStreamFrame {
                            stream,
                            code: ErrorCode::ProtocolError,
                            reason: "WINDOW_UPDATE increment 0",
                        },
                        // ... and fatal on the connection
                        None => Error::framing(
                            ErrorCode::ProtocolError,
                            "WINDOW_UPDATE increment 0 on connection",
                        ),
                    });
                };
                Frame::WindowUpdate {
                    stream: header.stream,
                    increment,
                }
            }
            FrameType::Continuation => Frame::Continuation {
                stream: stream_frame(header.stream, "CONTINUATION on stream 0")?,
                flags: ContinuationFlags::from_bits_truncate(header.flags),
                fragment: payload,
            },
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Data {
                stream,
                flags,
                data,
                pad,
            } => {
                let padded = flags.contains(DataFlags::PADDED);
                let length = data.len() + if padded { 1 + *pad as usize } else { 0 };
                FrameHeader::put(buf, length, type_of(self), flags.bits(), stream.get());
                if padded {
                    buf.put_u8(*pad);
                }
                buf.put_slice(data);
                if padded {
                    buf.put_bytes(0, *pad as usize);
                }
            }
            Frame::Headers {
                stream,
                flags,
                priority,
                fragment,
            } => {
                debug_assert_eq!(flags.contains(HeadersFlags::PRIORITY), priority.is_some());
                let length = fragment.len() + if priority.is_some() { 5 } else { 0 };
                FrameHeader::put(buf, length, type_of(self), flags.bits(), stream.get());
                if let Some(priority) = priority {
                    put_priority(buf, *priority);
                }
                buf.put_slice(fragment);
            }
            Frame::Priority { stream, priority } => {
                FrameHeader::put(buf, 5, type_of(self), 0, stream.get());
                put_priority(buf, *priority);
            }
            Frame::ResetStream { stream, code } => {
                FrameHeader::put(buf, 4, type_of(self), 0, stream.get());
                buf.put_u32(wire_code(*code));
            }
            Frame::Settings { flags, params } => {
                FrameHeader::put(buf, params.len() * 6, type_of(self), flags.bits(), 0);
                for (param, value) in params {
                    // unwrap: SettingsParameter is repr(u16)
                    buf.put_u16(param.to_u16().unwrap());
                    buf.put_u32(*value);
                }
            }
            Frame::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => {
                FrameHeader::put(buf, 4 + fragment.len(), type_of(self), flags.bits(), stream.get());
                buf.put_u32(promised.get());
                buf.put_slice(fragment);
            }
            Frame::Ping { flags, payload } => {
                FrameHeader::put(buf, 8, type_of(self), flags.bits(), 0);
                buf.put_slice(payload);
            }
            Frame::GoAway {
                last_stream,
                code,
                debug,
            } => {
                FrameHeader::put(buf, 8 + debug.len(), type_of(self), 0, 0);
                buf.put_u32(last_stream & U31_MAX);
                buf.put_u32(wire_code(*code));
                buf.put_slice(debug);
            }
            Frame::WindowUpdate { stream, increment } => {
                FrameHeader::put(buf, 4, type_of(self), 0, *stream);
                buf.put_u32(increment.get() & U31_MAX);
            }
            Frame::Continuation {
                stream,
                flags,
                fragment,
            } => {
                FrameHeader::put(buf, fragment.len(), type_of(self), flags.bits(), stream.get());
                buf.put_slice(fragment);
            }
            Frame::Unknown {
                typ,
                stream,
                flags,
                payload,
            } => {
                FrameHeader::put(buf, payload.len(), *typ, *flags, *stream);
                buf.put_slice(payload);
            }
        }
    }

    /// Stream the frame addresses; 0 for connection-scoped frames.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data { stream, .. }
            | Frame::Headers { stream, .. }
            | Frame::Priority { stream, .. }
            | Frame::ResetStream { stream, .. }
            | Frame::PushPromise { stream, .. }
            | Frame::Continuation { stream, .. } => stream.get(),
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
            Frame::WindowUpdate { stream, .. } | Frame::Unknown { stream, .. } => *stream,
        }
    }

    /// Octets this frame consumes from the receive flow-control window.
    /// Padding counts; only DATA is flow controlled.
    #[must_use]
    pub fn flow_len(&self) -> u32 {
        match self {
            Frame::Data {
                flags, data, pad, ..
            } => {
                let padding = if flags.contains(DataFlags::PADDED) {
                    1 + u32::from(*pad)
                } else {
                    0
                };
                data.len() as u32 + padding
            }
            _ => 0,
        }
    }
}

fn type_of(frame: &Frame) -> u8 {
    // unwrap: FrameType is repr(u8)
    match frame {
        Frame::Data { .. } => FrameType::Data,
        Frame::Headers { .. } => FrameType::Headers,
        Frame::Priority { .. } => FrameType::Priority,
        Frame::ResetStream { .. } => FrameType::ResetStream,
        Frame::Settings { .. } => FrameType::Settings,
        Frame::PushPromise { .. } => FrameType::PushPromise,
        Frame::Ping { .. } => FrameType::Ping,
        Frame::GoAway { .. } => FrameType::GoAway,
        Frame::WindowUpdate { .. } => FrameType::WindowUpdate,
        Frame::Continuation { .. } => FrameType::Continuation,
        Frame::Unknown { typ, .. } => return *typ,
    }
    .to_u8()
    .unwrap()
}

fn wire_code(code: ErrorCode) -> u32 {
    // unwrap: ErrorCode is repr(u32)
    code.to_u32().unwrap()
}

fn put_priority(buf: &mut BytesMut, priority: Priority) {
    let mut raw = priority.dependency & U31_MAX;
    if priority.exclusive {
        raw |= 1 << 31;
    }
    buf.put_u32(raw);
    buf.put_u8(priority.weight);
}
