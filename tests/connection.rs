//! Connection-level scenarios against a scripted peer on an in-process
//! duplex pipe. The peer side speaks raw frames through the crate's codec
//! and its own `hpack` state, the way a server would.

use bytes::Bytes;
use h2client::{
    flags::*,
    frame::Frame,
    transport::{FrameReader, FrameWriter},
    Connection, ConnectionConfig, Error, ErrorCode, NonZeroStreamId, SettingsParameter,
    StreamEvent, CONNECTION_PREFACE,
};
use std::{num::NonZeroU32, time::Duration};
use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};

fn nz(id: u32) -> NonZeroStreamId {
    NonZeroStreamId::new(id).unwrap()
}

fn increment(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap()
}

fn get_headers(path: &str) -> h2client::Headers {
    vec![
        (":method".to_owned(), "GET".to_owned()),
        (":scheme".to_owned(), "https".to_owned()),
        (":path".to_owned(), path.to_owned()),
        (":authority".to_owned(), "test.local".to_owned()),
    ]
}

/// The server side of the wire, scripted frame by frame.
struct Peer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl Peer {
    /// Consumes the client preface and SETTINGS, then answers with our own
    /// SETTINGS and an ACK.
    async fn accept(io: DuplexStream, settings: Vec<(SettingsParameter, u32)>) -> Self {
        let (mut read_half, write_half) = tokio::io::split(io);
        let mut preface = [0u8; 24];
        read_half.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);
        let mut peer = Self {
            reader: FrameReader::new(read_half, 1 << 20),
            writer: FrameWriter::new(write_half),
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        };
        match peer.reader.read_frame().await.unwrap() {
            Frame::Settings { flags, .. } => assert!(!flags.contains(SettingsFlags::ACK)),
            other => panic!("expected client SETTINGS, got {:?}", other),
        }
        peer.send(Frame::Settings {
            flags: SettingsFlags::empty(),
            params: settings,
        })
        .await;
        peer.send(Frame::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        })
        .await;
        peer
    }

    async fn send(&mut self, frame: Frame) {
        self.writer
            .write_frames(std::slice::from_ref(&frame))
            .await
            .unwrap();
    }

    /// Next frame from the client that is not connection housekeeping
    /// (SETTINGS ACKs, window credit).
    async fn recv(&mut self) -> Frame {
        loop {
            match self.reader.read_frame().await.unwrap() {
                Frame::Settings { flags, .. } if flags.contains(SettingsFlags::ACK) => {}
                Frame::WindowUpdate { .. } => {}
                frame => return frame,
            }
        }
    }

    async fn expect_request(&mut self) -> (u32, Vec<(String, String)>, bool) {
        match self.recv().await {
            Frame::Headers {
                stream,
                flags,
                fragment,
                ..
            } => {
                assert!(flags.contains(HeadersFlags::END_HEADERS));
                let mut headers = Vec::new();
                self.decoder
                    .decode_with_cb(&fragment, |name, value| {
                        headers.push((
                            String::from_utf8_lossy(&name).into_owned(),
                            String::from_utf8_lossy(&value).into_owned(),
                        ));
                    })
                    .unwrap();
                (
                    stream.get(),
                    headers,
                    flags.contains(HeadersFlags::END_STREAM),
                )
            }
            other => panic!("expected HEADERS, got {:?}", other),
        }
    }

    async fn expect_data(&mut self) -> (u32, usize, bool) {
        match self.recv().await {
            Frame::Data {
                stream,
                flags,
                data,
                ..
            } => (
                stream.get(),
                data.len(),
                flags.contains(DataFlags::END_STREAM),
            ),
            other => panic!("expected DATA, got {:?}", other),
        }
    }

    fn encode(&mut self, headers: &[(&str, &str)]) -> Bytes {
        Bytes::from(
            self.encoder
                .encode(headers.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes()))),
        )
    }

    async fn send_headers(&mut self, stream: u32, headers: &[(&str, &str)], end_stream: bool) {
        let fragment = self.encode(headers);
        let mut flags = HeadersFlags::END_HEADERS;
        if end_stream {
            flags |= HeadersFlags::END_STREAM;
        }
        self.send(Frame::Headers {
            stream: nz(stream),
            flags,
            priority: None,
            fragment,
        })
        .await;
    }

    async fn send_data(&mut self, stream: u32, data: &'static [u8], end_stream: bool) {
        let flags = if end_stream {
            DataFlags::END_STREAM
        } else {
            DataFlags::empty()
        };
        self.send(Frame::Data {
            stream: nz(stream),
            flags,
            data: Bytes::from_static(data),
            pad: 0,
        })
        .await;
    }
}

async fn connect(
    settings: Vec<(SettingsParameter, u32)>,
    config: ConnectionConfig,
) -> (Connection, Peer) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let handshake = tokio::spawn(Connection::handshake(client_io, config));
    let peer = Peer::accept(server_io, settings).await;
    let connection = handshake.await.unwrap().unwrap();
    (connection, peer)
}

#[tokio::test]
async fn happy_get() {
    let (connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;

    let mut stream = connection
        .start_stream(get_headers("/"), true)
        .await
        .unwrap();
    assert_eq!(stream.id().get(), 1);

    let (id, headers, end_stream) = peer.expect_request().await;
    assert_eq!(id, 1);
    assert!(end_stream);
    assert!(headers.contains(&(":method".to_owned(), "GET".to_owned())));
    assert!(headers.contains(&(":path".to_owned(), "/".to_owned())));

    peer.send_headers(1, &[(":status", "200")], false).await;
    peer.send_data(1, b"hello world", true).await;

    match stream.next_event().await.unwrap() {
        StreamEvent::Headers {
            headers,
            end_stream,
        } => {
            assert!(!end_stream);
            assert!(headers.contains(&(":status".to_owned(), "200".to_owned())));
        }
        other => panic!("expected headers, got {:?}", other),
    }
    match stream.next_event().await.unwrap() {
        StreamEvent::Data { data, end_stream } => {
            assert!(end_stream);
            assert_eq!(&data[..], b"hello world");
        }
        other => panic!("expected data, got {:?}", other),
    }
    assert!(stream.next_event().await.is_none());
}

#[tokio::test]
async fn flow_controlled_post() {
    let (connection, mut peer) = connect(
        vec![(SettingsParameter::InitialWindowSize, 1024)],
        ConnectionConfig::default(),
    )
    .await;

    let mut stream = connection
        .start_stream(get_headers("/upload"), false)
        .await
        .unwrap();
    let sender = tokio::spawn(async move {
        stream
            .send_data(Bytes::from(vec![0xab_u8; 4096]), true)
            .await
            .unwrap();
        stream
    });

    let (id, _, end_stream) = peer.expect_request().await;
    assert!(!end_stream);

    let mut total = 0usize;
    let mut frames = 0usize;
    let mut saw_end = false;
    while total < 4096 {
        let (data_stream, len, end) = peer.expect_data().await;
        assert_eq!(data_stream, id);
        assert!(len <= 1024, "frame of {} octets exceeds the window", len);
        total += len;
        frames += 1;
        saw_end = end;
        peer.send(Frame::WindowUpdate {
            stream: id,
            increment: increment(1024),
        })
        .await;
        peer.send(Frame::WindowUpdate {
            stream: 0,
            increment: increment(1024),
        })
        .await;
    }
    assert_eq!(total, 4096);
    assert!(frames >= 4);
    assert!(saw_end);

    let mut stream = sender.await.unwrap();
    peer.send_headers(id, &[(":status", "200")], true).await;
    match stream.next_event().await.unwrap() {
        StreamEvent::Headers { end_stream, .. } => assert!(end_stream),
        other => panic!("expected headers, got {:?}", other),
    }
    assert!(stream.next_event().await.is_none());
}

#[tokio::test]
async fn ping_round_trip() {
    let (connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;

    let (ping, ()) = tokio::join!(
        async { connection.ping(b"pingpong", Duration::from_secs(5)).await },
        async {
            match peer.recv().await {
                Frame::Ping { flags, payload } => {
                    assert!(!flags.contains(PingFlags::ACK));
                    assert_eq!(&payload, b"pingpong");
                    peer.send(Frame::Ping {
                        flags: PingFlags::ACK,
                        payload,
                    })
                    .await;
                }
                other => panic!("expected PING, got {:?}", other),
            }
        }
    );
    let ping = ping.unwrap();
    assert_eq!(&ping.payload, b"pingpong");
    assert!(ping.received >= ping.sent);
    assert_eq!(ping.rtt(), ping.received.duration_since(ping.sent));
}

#[tokio::test]
async fn ping_payload_must_be_eight_octets() {
    let (connection, _peer) = connect(Vec::new(), ConnectionConfig::default()).await;
    assert!(matches!(
        connection.ping(b"short", Duration::from_secs(1)).await,
        Err(Error::InvalidPingPayload)
    ));
}

#[tokio::test]
async fn pings_are_answered() {
    let (_connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;
    peer.send(Frame::Ping {
        flags: PingFlags::empty(),
        payload: *b"serverpi",
    })
    .await;
    match peer.recv().await {
        Frame::Ping { flags, payload } => {
            assert!(flags.contains(PingFlags::ACK));
            assert_eq!(&payload, b"serverpi");
        }
        other => panic!("expected PING ACK, got {:?}", other),
    }
}

#[tokio::test]
async fn push_promise_reaches_a_second_consumer() {
    let (mut connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;

    let mut stream = connection
        .start_stream(get_headers("/"), true)
        .await
        .unwrap();
    let (id, _, _) = peer.expect_request().await;
    assert_eq!(id, 1);

    let fragment = peer.encode(&[
        (":method", "GET"),
        (":scheme", "https"),
        (":path", "/style.css"),
        (":authority", "test.local"),
    ]);
    peer.send(Frame::PushPromise {
        stream: nz(1),
        flags: PushPromiseFlags::END_HEADERS,
        promised: nz(2),
        fragment,
    })
    .await;
    peer.send_headers(1, &[(":status", "200")], true).await;
    peer.send_headers(2, &[(":status", "200")], false).await;
    peer.send_data(2, b"body {}", true).await;

    let pushed = connection.pushed().await.unwrap();
    assert_eq!(pushed.parent.get(), 1);
    assert_eq!(pushed.promised.get(), 2);
    assert!(pushed
        .headers
        .contains(&(":path".to_owned(), "/style.css".to_owned())));

    // the original stream completes normally
    match stream.next_event().await.unwrap() {
        StreamEvent::Headers { end_stream, .. } => assert!(end_stream),
        other => panic!("expected headers, got {:?}", other),
    }
    assert!(stream.next_event().await.is_none());

    // and the promised stream delivers the pushed response
    let mut handle = pushed.handle;
    match handle.next_event().await.unwrap() {
        StreamEvent::Headers {
            headers,
            end_stream,
        } => {
            assert!(!end_stream);
            assert!(headers.contains(&(":status".to_owned(), "200".to_owned())));
        }
        other => panic!("expected headers, got {:?}", other),
    }
    match handle.next_event().await.unwrap() {
        StreamEvent::Data { data, end_stream } => {
            assert!(end_stream);
            assert_eq!(&data[..], b"body {}");
        }
        other => panic!("expected data, got {:?}", other),
    }
    assert!(handle.next_event().await.is_none());
}

#[tokio::test]
async fn goaway_mid_flight() {
    let (connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;

    let mut s1 = connection
        .start_stream(get_headers("/a"), true)
        .await
        .unwrap();
    let mut s3 = connection
        .start_stream(get_headers("/b"), true)
        .await
        .unwrap();
    let mut s5 = connection
        .start_stream(get_headers("/c"), true)
        .await
        .unwrap();
    assert_eq!(
        (s1.id().get(), s3.id().get(), s5.id().get()),
        (1, 3, 5)
    );
    for _ in 0..3 {
        peer.expect_request().await;
    }

    peer.send(Frame::GoAway {
        last_stream: 3,
        code: ErrorCode::NoError,
        debug: Bytes::from_static(b"maintenance"),
    })
    .await;

    // stream 5 is above last-stream-id and gets refused
    match s5.next_event().await.unwrap() {
        StreamEvent::Reset(code) => assert_eq!(code, ErrorCode::RefusedStream),
        other => panic!("expected reset, got {:?}", other),
    }

    // the shutdown is observable and blocks new streams
    let goaway = connection.goaway_watch().borrow().clone().unwrap();
    assert_eq!(goaway.last_stream, 3);
    assert_eq!(goaway.code, ErrorCode::NoError);
    assert!(matches!(
        connection.start_stream(get_headers("/d"), true).await,
        Err(Error::GoAwayInProgress)
    ));

    // streams at or below last-stream-id run to completion
    peer.send_headers(1, &[(":status", "200")], true).await;
    peer.send_headers(3, &[(":status", "204")], true).await;
    match s1.next_event().await.unwrap() {
        StreamEvent::Headers { end_stream, .. } => assert!(end_stream),
        other => panic!("expected headers, got {:?}", other),
    }
    match s3.next_event().await.unwrap() {
        StreamEvent::Headers { headers, .. } => {
            assert!(headers.contains(&(":status".to_owned(), "204".to_owned())));
        }
        other => panic!("expected headers, got {:?}", other),
    }
}

#[tokio::test]
async fn interleaved_header_block_is_a_protocol_error() {
    let (connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;

    let mut stream = connection
        .start_stream(get_headers("/"), true)
        .await
        .unwrap();
    peer.expect_request().await;

    // a HEADERS frame without END_HEADERS leaves the block open ...
    let fragment = peer.encode(&[(":status", "200"), ("content-type", "text/html")]);
    let half = fragment.len() / 2;
    peer.send(Frame::Headers {
        stream: nz(1),
        flags: HeadersFlags::empty(),
        priority: None,
        fragment: fragment.slice(..half),
    })
    .await;
    // ... and anything but its CONTINUATION tears the connection down
    peer.send(Frame::Ping {
        flags: PingFlags::empty(),
        payload: *b"intruder",
    })
    .await;

    match stream.next_event().await.unwrap() {
        StreamEvent::ConnectionClosed(cause) => assert!(matches!(
            &*cause,
            Error::Framing {
                code: ErrorCode::ProtocolError,
                ..
            }
        )),
        other => panic!("expected connection closed, got {:?}", other),
    }

    // the client announces the failure with a GOAWAY before closing
    loop {
        match peer.reader.read_frame().await.unwrap() {
            Frame::GoAway { code, .. } => {
                assert_eq!(code, ErrorCode::ProtocolError);
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn settings_are_sent_and_acked() {
    let (connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;

    connection
        .settings(&[(SettingsParameter::MaxConcurrentStreams, 7)])
        .await
        .unwrap();
    match peer.reader.read_frame().await.unwrap() {
        Frame::Settings { flags, params } if !flags.contains(SettingsFlags::ACK) => {
            assert_eq!(params, vec![(SettingsParameter::MaxConcurrentStreams, 7)]);
        }
        // the client may still owe us the ACK for the handshake settings
        Frame::Settings { .. } => {
            match peer.reader.read_frame().await.unwrap() {
                Frame::Settings { params, .. } => {
                    assert_eq!(params, vec![(SettingsParameter::MaxConcurrentStreams, 7)]);
                }
                other => panic!("expected SETTINGS, got {:?}", other),
            }
        }
        other => panic!("expected SETTINGS, got {:?}", other),
    }
    peer.send(Frame::Settings {
        flags: SettingsFlags::ACK,
        params: Vec::new(),
    })
    .await;
}

#[tokio::test]
async fn graceful_goaway_closes_the_transport() {
    let (connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;

    connection
        .goaway(ErrorCode::NoError, Bytes::from_static(b"done"))
        .await
        .unwrap();

    loop {
        match peer.reader.read_frame().await {
            Ok(Frame::GoAway {
                last_stream, code, ..
            }) => {
                assert_eq!(last_stream, 0);
                assert_eq!(code, ErrorCode::NoError);
                break;
            }
            Ok(_) => {}
            Err(err) => panic!("transport failed before GOAWAY: {}", err),
        }
    }
    // then end-of-stream
    assert!(peer.reader.read_frame().await.is_err());

    // the connection is poisoned for any further work
    assert!(matches!(
        connection.start_stream(get_headers("/late"), true).await,
        Err(Error::Closed(_))
    ));
}

#[tokio::test]
async fn unknown_frame_types_reach_the_fallback_sink() {
    let (connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;

    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::unbounded_channel();
    connection.set_fallback_sink(move |frame| {
        sink_tx.send(frame).ok();
    });

    peer.send(Frame::Unknown {
        typ: 0xfa,
        stream: 0,
        flags: 0x1,
        payload: Bytes::from_static(b"extension"),
    })
    .await;

    match sink_rx.recv().await.unwrap() {
        Frame::Unknown {
            typ,
            flags,
            payload,
            ..
        } => {
            assert_eq!(typ, 0xfa);
            assert_eq!(flags, 0x1);
            assert_eq!(&payload[..], b"extension");
        }
        other => panic!("expected the unknown frame, got {:?}", other),
    }
}

#[tokio::test]
async fn empty_body_post_sends_end_stream_data() {
    let (connection, mut peer) = connect(Vec::new(), ConnectionConfig::default()).await;

    let mut stream = connection
        .start_stream(get_headers("/empty"), false)
        .await
        .unwrap();
    stream.send_data(Bytes::new(), true).await.unwrap();

    let (_, _, end_stream) = peer.expect_request().await;
    assert!(!end_stream);
    let (id, len, end) = peer.expect_data().await;
    assert_eq!((id, len, end), (1, 0, true));

    peer.send_headers(1, &[(":status", "204")], true).await;
    match stream.next_event().await.unwrap() {
        StreamEvent::Headers { end_stream, .. } => assert!(end_stream),
        other => panic!("expected headers, got {:?}", other),
    }
}
