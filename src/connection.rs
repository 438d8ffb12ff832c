use crate::{
    error::{Error, Result},
    flags::*,
    flow::{FlowWindow, WindowCredit},
    frame::Frame,
    hpack::{HeaderDecoder, HeaderEncoder},
    registry::{Registry, StreamEntry},
    stream::{PushedStream, StreamEvent, StreamHandle, StreamShared, StreamState},
    transport::{FrameReader, FrameWriter},
    types::*,
};
use bytes::{Bytes, BytesMut};
use enum_map::EnumMap;
use log::{debug, trace, warn};
use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroU32,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{split, AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, watch},
};

/// Per-stream mailbox depth. Generous enough to hold a full receive window
/// of normal-sized DATA frames; a consumer that stops draining eventually
/// stalls the reader, which stops emitting WINDOW_UPDATE and throttles the
/// peer.
const MAILBOX_CAPACITY: usize = 32;
const WRITE_QUEUE_CAPACITY: usize = 32;
const PUSH_QUEUE_CAPACITY: usize = 8;

/// Caller-visible connection knobs. Settings values are what we advertise
/// to the peer; only values differing from the RFC defaults are sent.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Keepalive PING cadence; `None` disables the scheduler.
    pub ping_interval: Option<Duration>,
    /// How long a PING may wait for its ACK.
    pub ping_timeout: Duration,
    /// Cadence of the ticker that flushes accumulated window credit.
    pub window_update_interval: Duration,
    pub max_concurrent_streams: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub initial_window_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let defaults = default_settings();
        Self {
            ping_interval: None,
            ping_timeout: Duration::from_secs(10),
            window_update_interval: Duration::from_millis(1000),
            max_concurrent_streams: defaults[SettingsParameter::MaxConcurrentStreams],
            max_frame_size: defaults[SettingsParameter::MaxFrameSize],
            max_header_list_size: defaults[SettingsParameter::MaxHeaderListSize],
            initial_window_size: defaults[SettingsParameter::InitialWindowSize],
        }
    }
}

/// What the peer told us when it started shutting down.
#[derive(Debug, Clone)]
pub struct GoAway {
    pub last_stream: StreamId,
    pub code: ErrorCode,
    pub debug: Bytes,
}

/// A completed PING exchange.
#[derive(Debug, Clone, Copy)]
pub struct Ping {
    pub sent: Instant,
    pub received: Instant,
    pub payload: [u8; 8],
}

impl Ping {
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.received.duration_since(self.sent)
    }
}

struct PendingPing {
    sent: Instant,
    reply: oneshot::Sender<Ping>,
}

/// Receives frames with unrecognized type codes. The default sink drops
/// them after a trace log.
pub type FallbackSink = Box<dyn Fn(Frame) + Send + Sync>;

/// One message on the bounded writer queue. Header blocks are encoded by
/// the writer task itself so HPACK encoder state follows wire order, and a
/// block's HEADERS + CONTINUATION frames are written back to back.
pub(crate) enum WriteMessage {
    Frame(Frame),
    HeaderBlock {
        stream: NonZeroStreamId,
        headers: Headers,
        end_stream: bool,
    },
    /// Written last: the writer flushes, closes the transport and stops.
    GoAway {
        frame: Frame,
        done: oneshot::Sender<()>,
    },
}

/// State shared by the connection tasks and every stream handle.
pub(crate) struct Shared {
    config: ConnectionConfig,
    writer: mpsc::Sender<WriteMessage>,
    registry: Mutex<Registry>,
    /// Serializes id allocation with the HEADERS enqueue so wire order
    /// matches id order.
    open_lock: tokio::sync::Mutex<()>,
    /// Connection-level outbound window.
    pub send_window: FlowWindow,
    /// Connection-level inbound window; always starts at 65 535.
    recv_window: AtomicI64,
    credit: WindowCredit,
    remote: RwLock<EnumMap<SettingsParameter, u32>>,
    local: RwLock<EnumMap<SettingsParameter, u32>>,
    /// SETTINGS batches we sent and the peer has not ACKed yet, oldest
    /// first.
    pending_local: Mutex<VecDeque<Vec<(SettingsParameter, u32)>>>,
    pings: Mutex<HashMap<[u8; 8], PendingPing>>,
    ping_seq: AtomicU64,
    poison: Mutex<Option<Arc<Error>>>,
    ready: Mutex<Option<oneshot::Sender<()>>>,
    goaway: watch::Sender<Option<GoAway>>,
    fallback: Mutex<Option<FallbackSink>>,
}

impl Shared {
    fn remote_value(&self, param: SettingsParameter) -> u32 {
        self.remote.read().expect("settings lock")[param]
    }

    fn local_value(&self, param: SettingsParameter) -> u32 {
        self.local.read().expect("settings lock")[param]
    }

    pub fn remote_max_frame_size(&self) -> u32 {
        self.remote_value(SettingsParameter::MaxFrameSize)
    }

    async fn enqueue(&self, message: WriteMessage) -> Result<()> {
        self.writer.send(message).await.map_err(|_| self.fail())
    }

    fn check_poison(&self) -> Result<()> {
        match &*self.poison.lock().expect("poison lock") {
            Some(cause) => Err(Error::Closed(cause.clone())),
            None => Ok(()),
        }
    }

    fn is_poisoned(&self) -> bool {
        self.poison.lock().expect("poison lock").is_some()
    }

    pub fn poison_cause(&self) -> Arc<Error> {
        self.poison
            .lock()
            .expect("poison lock")
            .clone()
            .unwrap_or_else(|| Arc::new(Error::Internal("connection tasks terminated")))
    }

    pub fn fail(&self) -> Error {
        Error::Closed(self.poison_cause())
    }

    /// Records the first connection-level failure and tears everything
    /// down: emits GOAWAY where that still makes sense, closes all flow
    /// windows, hands every stream consumer a terminal event and wakes
    /// ping waiters. Later callers get the original cause back.
    pub fn poison(&self, cause: Error) -> Arc<Error> {
        let cause = {
            let mut poison = self.poison.lock().expect("poison lock");
            if let Some(existing) = &*poison {
                return existing.clone();
            }
            let cause = Arc::new(cause);
            *poison = Some(cause.clone());
            cause
        };
        warn!("connection poisoned: {}", cause);
        // wake a handshake still waiting for the first SETTINGS
        self.ready.lock().expect("ready lock").take();
        if let Some(code) = cause.goaway_code() {
            let last_stream = self.registry.lock().expect("registry lock").max_received();
            let (done, _) = oneshot::channel();
            let frame = Frame::GoAway {
                last_stream,
                code,
                debug: Bytes::new(),
            };
            self.writer
                .try_send(WriteMessage::GoAway { frame, done })
                .ok();
        }
        self.send_window.close();
        let entries = self.registry.lock().expect("registry lock").drain();
        for entry in entries {
            entry.shared.send_window.close();
            entry
                .events
                .try_send(StreamEvent::ConnectionClosed(cause.clone()))
                .ok();
        }
        // dropping the reply senders wakes every ping waiter
        self.pings.lock().expect("pings lock").clear();
        cause
    }

    pub async fn send_data_frame(
        &self,
        stream: &StreamShared,
        data: Bytes,
        end_stream: bool,
    ) -> Result<()> {
        let flags = if end_stream {
            DataFlags::END_STREAM
        } else {
            DataFlags::empty()
        };
        self.enqueue(WriteMessage::Frame(Frame::Data {
            stream: stream.id,
            flags,
            data,
            pad: 0,
        }))
        .await?;
        if end_stream {
            let mut registry = self.registry.lock().expect("registry lock");
            if let Some(entry) = registry.get_mut(stream.id) {
                entry.state = entry.state.on_send_end();
                if entry.state.is_closed() {
                    registry.close(stream.id, Instant::now());
                }
            }
        }
        Ok(())
    }

    /// Consumer-side credit hand-back for octets taken off a stream
    /// mailbox; also used by the reader for octets that never reach a
    /// consumer (padding, frames inside the grace window).
    pub async fn replenish(&self, stream: &StreamShared, n: u32) {
        if n == 0 {
            return;
        }
        if let Some(credit) = self.credit.add(n) {
            self.flush_window(0, credit).await;
        }
        if let Some(credit) = stream.credit.add(n) {
            stream
                .recv_window
                .fetch_add(i64::from(credit), Ordering::AcqRel);
            self.flush_window(stream.id.get(), credit).await;
        }
    }

    async fn replenish_connection(&self, n: u32) {
        if n == 0 {
            return;
        }
        if let Some(credit) = self.credit.add(n) {
            self.flush_window(0, credit).await;
        }
    }

    async fn flush_window(&self, stream: StreamId, credit: u32) {
        if stream == 0 {
            self.recv_window.fetch_add(i64::from(credit), Ordering::AcqRel);
        }
        // unwrap: credit is never 0 here
        let increment = NonZeroU32::new(credit).unwrap();
        self.enqueue(WriteMessage::Frame(Frame::WindowUpdate { stream, increment }))
            .await
            .ok();
    }

    async fn flush_connection_credit(&self) {
        if let Some(credit) = self.credit.take() {
            self.flush_window(0, credit).await;
        }
    }

    async fn flush_stream_credit(&self, stream: &StreamShared) {
        if let Some(credit) = stream.credit.take() {
            stream
                .recv_window
                .fetch_add(i64::from(credit), Ordering::AcqRel);
            self.flush_window(stream.id.get(), credit).await;
        }
    }

    pub async fn reset_stream(&self, id: NonZeroStreamId, code: ErrorCode) -> Result<()> {
        if let Some(entry) = self.registry.lock().expect("registry lock").close(id, Instant::now())
        {
            entry.shared.send_window.close();
        }
        self.enqueue(WriteMessage::Frame(Frame::ResetStream { stream: id, code }))
            .await
    }

    /// Best-effort RST_STREAM(CANCEL) for a dropped, unfinished handle.
    pub fn cancel_stream(&self, id: NonZeroStreamId) {
        let entry = self.registry.lock().expect("registry lock").close(id, Instant::now());
        if let Some(entry) = entry {
            entry.shared.send_window.close();
            trace!("cancelling abandoned stream {}", id);
            self.writer
                .try_send(WriteMessage::Frame(Frame::ResetStream {
                    stream: id,
                    code: ErrorCode::Cancel,
                }))
                .ok();
        }
    }

    async fn ping_with_timeout(&self, payload: [u8; 8], timeout: Duration) -> Result<Ping> {
        self.check_poison()?;
        let (reply, reply_rx) = oneshot::channel();
        self.pings.lock().expect("pings lock").insert(
            payload,
            PendingPing {
                sent: Instant::now(),
                reply,
            },
        );
        self.enqueue(WriteMessage::Frame(Frame::Ping {
            flags: PingFlags::empty(),
            payload,
        }))
        .await?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(ping)) => Ok(ping),
            Ok(Err(_)) => Err(self.fail()),
            Err(_) => {
                self.pings.lock().expect("pings lock").remove(&payload);
                Err(Error::PingTimeout)
            }
        }
    }

    fn next_ping_payload(&self) -> [u8; 8] {
        self.ping_seq.fetch_add(1, Ordering::Relaxed).to_be_bytes()
    }

    fn new_stream_shared(&self, id: NonZeroStreamId) -> Arc<StreamShared> {
        Arc::new(StreamShared::new(
            id,
            self.remote_value(SettingsParameter::InitialWindowSize),
            self.local_value(SettingsParameter::InitialWindowSize),
        ))
    }
}

/// A multiplexed HTTP/2 client connection. Cheap operations (`start_stream`,
/// `ping`, `settings`) take `&self`; accepting pushes takes `&mut self`.
pub struct Connection {
    shared: Arc<Shared>,
    pushed: mpsc::Receiver<PushedStream>,
    goaway: watch::Receiver<Option<GoAway>>,
}

impl Connection {
    /// Performs the client side of the HTTP/2 connection setup over any
    /// ordered reliable byte stream (normally a TLS session that
    /// negotiated `h2`): writes the preface and our SETTINGS, spawns the
    /// reader/writer/ticker tasks and waits for the server's first
    /// SETTINGS frame.
    pub async fn handshake<T>(io: T, config: ConnectionConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let defaults = default_settings();
        let mut params = Vec::new();
        for (param, value) in [
            (
                SettingsParameter::MaxConcurrentStreams,
                config.max_concurrent_streams,
            ),
            (
                SettingsParameter::InitialWindowSize,
                config.initial_window_size,
            ),
            (SettingsParameter::MaxFrameSize, config.max_frame_size),
            (
                SettingsParameter::MaxHeaderListSize,
                config.max_header_list_size,
            ),
        ] {
            if value != defaults[param] {
                params.push((param, value));
            }
        }

        let (read_half, write_half) = split(io);
        let mut frame_writer = FrameWriter::new(write_half);
        frame_writer
            .write_preface(&Frame::Settings {
                flags: SettingsFlags::empty(),
                params: params.clone(),
            })
            .await?;
        let frame_reader = FrameReader::new(read_half, config.max_frame_size);

        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (pushed_tx, pushed_rx) = mpsc::channel(PUSH_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (goaway_tx, goaway_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            writer: writer_tx,
            registry: Mutex::new(Registry::new()),
            open_lock: tokio::sync::Mutex::new(()),
            send_window: FlowWindow::new(DEFAULT_WINDOW_SIZE),
            recv_window: AtomicI64::new(i64::from(DEFAULT_WINDOW_SIZE)),
            credit: WindowCredit::new(DEFAULT_WINDOW_SIZE / 2),
            remote: RwLock::new(default_settings()),
            local: RwLock::new(default_settings()),
            pending_local: Mutex::new(VecDeque::from([params])),
            pings: Mutex::new(HashMap::new()),
            ping_seq: AtomicU64::new(0),
            poison: Mutex::new(None),
            ready: Mutex::new(Some(ready_tx)),
            goaway: goaway_tx,
            fallback: Mutex::new(None),
            config,
        });

        tokio::spawn(write_loop(shared.clone(), frame_writer, writer_rx));
        tokio::spawn(read_loop(shared.clone(), frame_reader, pushed_tx));
        tokio::spawn(flow_tick_loop(shared.clone()));
        if let Some(interval) = shared.config.ping_interval {
            tokio::spawn(ping_loop(shared.clone(), interval, shared.config.ping_timeout));
        }

        match ready_rx.await {
            Ok(()) => Ok(Self {
                shared,
                pushed: pushed_rx,
                goaway: goaway_rx,
            }),
            Err(_) => Err(shared.fail()),
        }
    }

    /// Opens a new client stream: allocates the next odd id and sends the
    /// request header block (with END_STREAM when there is no body) before
    /// returning the handle.
    pub async fn start_stream(&self, headers: Headers, end_stream: bool) -> Result<StreamHandle> {
        self.shared.check_poison()?;
        let _open = self.shared.open_lock.lock().await;
        let max_concurrent = self
            .shared
            .remote_value(SettingsParameter::MaxConcurrentStreams);
        let (id, stream_shared, events_rx) = {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            let id = registry.allocate(max_concurrent)?;
            let stream_shared = self.shared.new_stream_shared(id);
            let (events_tx, events_rx) = mpsc::channel(MAILBOX_CAPACITY);
            registry.insert(
                id,
                StreamEntry {
                    shared: stream_shared.clone(),
                    state: StreamState::Idle.on_send_headers(end_stream),
                    events: events_tx,
                },
            );
            (id, stream_shared, events_rx)
        };
        if let Err(err) = self
            .shared
            .enqueue(WriteMessage::HeaderBlock {
                stream: id,
                headers,
                end_stream,
            })
            .await
        {
            self.shared
                .registry
                .lock()
                .expect("registry lock")
                .close(id, Instant::now());
            return Err(err);
        }
        trace!("started stream {}", id);
        Ok(StreamHandle::new(
            self.shared.clone(),
            stream_shared,
            events_rx,
            end_stream,
        ))
    }

    /// Sends a PING and waits for the matching ACK. The payload must be
    /// exactly 8 octets. A timeout fails only this ping, not the
    /// connection.
    pub async fn ping(&self, payload: &[u8], timeout: Duration) -> Result<Ping> {
        let payload: [u8; 8] = payload.try_into().map_err(|_| Error::InvalidPingPayload)?;
        self.shared.ping_with_timeout(payload, timeout).await
    }

    /// Sends a SETTINGS frame; returns once it is enqueued, not when the
    /// peer ACKs. The values take local effect when the ACK arrives.
    pub async fn settings(&self, changes: &[(SettingsParameter, u32)]) -> Result<()> {
        self.shared.check_poison()?;
        self.shared
            .pending_local
            .lock()
            .expect("pending settings lock")
            .push_back(changes.to_vec());
        self.shared
            .enqueue(WriteMessage::Frame(Frame::Settings {
                flags: SettingsFlags::empty(),
                params: changes.to_vec(),
            }))
            .await
    }

    /// Initiates a graceful shutdown: GOAWAY carrying the highest peer
    /// stream id we processed, then drains the writer queue and closes the
    /// transport.
    pub async fn goaway(&self, code: ErrorCode, debug: impl Into<Bytes>) -> Result<()> {
        self.shared.check_poison()?;
        let last_stream = {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            registry.set_local_goaway();
            registry.max_received()
        };
        let (done, done_rx) = oneshot::channel();
        self.shared
            .enqueue(WriteMessage::GoAway {
                frame: Frame::GoAway {
                    last_stream,
                    code,
                    debug: debug.into(),
                },
                done,
            })
            .await?;
        done_rx.await.ok();
        self.shared.poison(Error::GoAwayInProgress);
        Ok(())
    }

    /// Next server push, in arrival order. `None` once the connection is
    /// done pushing (closed, or the peer never pushes).
    pub async fn pushed(&mut self) -> Option<PushedStream> {
        self.pushed.recv().await
    }

    /// Watch for the peer's GOAWAY. The default behavior without a watcher
    /// is just the log line; a supervisor can await changes here instead.
    #[must_use]
    pub fn goaway_watch(&self) -> watch::Receiver<Option<GoAway>> {
        self.goaway.clone()
    }

    /// Routes frames with unrecognized type codes to `sink` instead of
    /// dropping them.
    pub fn set_fallback_sink(&self, sink: impl Fn(Frame) + Send + Sync + 'static) {
        *self.shared.fallback.lock().expect("fallback lock") = Some(Box::new(sink));
    }

    /// The poisoning cause, if the connection has failed.
    #[must_use]
    pub fn error(&self) -> Option<Arc<Error>> {
        self.shared
            .poison
            .lock()
            .expect("poison lock")
            .clone()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    shared: Arc<Shared>,
    mut io: FrameWriter<W>,
    mut queue: mpsc::Receiver<WriteMessage>,
) {
    let mut encoder = HeaderEncoder::new();
    let mut group = Vec::new();
    while let Some(message) = queue.recv().await {
        let result = match message {
            WriteMessage::Frame(frame) => io.write_frames(std::slice::from_ref(&frame)).await,
            WriteMessage::HeaderBlock {
                stream,
                headers,
                end_stream,
            } => {
                split_header_block(
                    &mut encoder,
                    &mut group,
                    stream,
                    &headers,
                    end_stream,
                    shared.remote_max_frame_size() as usize,
                );
                io.write_frames(&group).await
            }
            WriteMessage::GoAway { frame, done } => {
                let result = io.write_frames(std::slice::from_ref(&frame)).await;
                io.shutdown().await;
                done.send(()).ok();
                if let Err(err) = result {
                    shared.poison(err);
                }
                return;
            }
        };
        if let Err(err) = result {
            shared.poison(err);
            return;
        }
    }
    // every sender is gone: the connection was poisoned elsewhere
    io.shutdown().await;
}

/// Encodes one header block and cuts the fragment into a HEADERS frame plus
/// as many CONTINUATION frames as the peer's max frame size requires.
fn split_header_block(
    encoder: &mut HeaderEncoder,
    out: &mut Vec<Frame>,
    stream: NonZeroStreamId,
    headers: &Headers,
    end_stream: bool,
    max_frame: usize,
) {
    out.clear();
    let mut fragment = encoder.encode(headers);
    let mut flags = HeadersFlags::empty();
    if end_stream {
        flags |= HeadersFlags::END_STREAM;
    }
    let first = fragment.split_to(fragment.len().min(max_frame));
    if fragment.is_empty() {
        flags |= HeadersFlags::END_HEADERS;
    }
    out.push(Frame::Headers {
        stream,
        flags,
        priority: None,
        fragment: first,
    });
    while !fragment.is_empty() {
        let chunk = fragment.split_to(fragment.len().min(max_frame));
        let flags = if fragment.is_empty() {
            ContinuationFlags::END_HEADERS
        } else {
            ContinuationFlags::empty()
        };
        out.push(Frame::Continuation {
            stream,
            flags,
            fragment: chunk,
        });
    }
}

/// An in-flight header block. Lives on the dispatcher, not the stream:
/// nothing may interleave with it on any stream.
struct HeaderBlock {
    stream: NonZeroStreamId,
    kind: BlockKind,
    fragments: BytesMut,
}

enum BlockKind {
    Headers { end_stream: bool },
    Push { promised: NonZeroStreamId },
}

struct Dispatcher {
    shared: Arc<Shared>,
    decoder: HeaderDecoder,
    pushed: mpsc::Sender<PushedStream>,
    block: Option<HeaderBlock>,
}

async fn read_loop<R: AsyncRead + Unpin>(
    shared: Arc<Shared>,
    mut io: FrameReader<R>,
    pushed: mpsc::Sender<PushedStream>,
) {
    let mut dispatcher = Dispatcher {
        shared: shared.clone(),
        decoder: HeaderDecoder::new(),
        pushed,
        block: None,
    };
    loop {
        let result = match io.read_frame().await {
            Ok(frame) => dispatcher.dispatch(frame).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {}
            Err(Error::MalformedStreamFrame {
                stream,
                code,
                reason,
            }) => {
                if dispatcher.block.is_some() {
                    // nothing may interleave with an open header block
                    shared.poison(Error::framing(
                        ErrorCode::ProtocolError,
                        "frame interleaved with a header block",
                    ));
                    return;
                }
                warn!("resetting stream {}: {}", stream, reason);
                if let Some(entry) = shared
                    .registry
                    .lock()
                    .expect("registry lock")
                    .close(stream, Instant::now())
                {
                    entry.shared.send_window.close();
                    entry.events.try_send(StreamEvent::Reset(code)).ok();
                }
                shared
                    .enqueue(WriteMessage::Frame(Frame::ResetStream { stream, code }))
                    .await
                    .ok();
            }
            Err(cause) => {
                // a transport failure after the peer's GOAWAY is the
                // shutdown it announced, not a separate error
                let cause = match (&cause, shared.goaway.borrow().clone()) {
                    (Error::Transport(_), Some(goaway)) => Error::RemoteGoAway {
                        last_stream: goaway.last_stream,
                        code: goaway.code,
                        debug: String::from_utf8_lossy(&goaway.debug).into_owned(),
                    },
                    _ => cause,
                };
                shared.poison(cause);
                return;
            }
        }
    }
}

impl Dispatcher {
    async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        if let Some(block) = &self.block {
            // HEADERS/PUSH_PROMISE + CONTINUATION are one atomic unit
            let fits = matches!(&frame, Frame::Continuation { stream, .. } if *stream == block.stream);
            if !fits {
                return Err(Error::framing(
                    ErrorCode::ProtocolError,
                    "expected CONTINUATION for the open header block",
                ));
            }
        }
        {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            registry.note_received(frame.stream_id());
            if let Frame::PushPromise { promised, .. } = &frame {
                registry.note_received(promised.get());
            }
        }
        match frame {
            Frame::Settings { flags, params } => self.on_settings(flags, params).await,
            Frame::Ping { flags, payload } => self.on_ping(flags, payload).await,
            Frame::GoAway {
                last_stream,
                code,
                debug,
            } => self.on_goaway(last_stream, code, debug),
            Frame::WindowUpdate { stream: 0, increment } => self
                .shared
                .send_window
                .release(increment.get())
                .map_err(|()| Error::FlowControl("connection window above 2^31-1")),
            Frame::WindowUpdate { stream, increment } => {
                // unwrap: the zero arm is matched above
                self.on_stream_window(NonZeroStreamId::new(stream).unwrap(), increment)
            }
            Frame::Data {
                stream,
                flags,
                ref data,
                pad,
            } => {
                let flow = data.len() as u32
                    + if flags.contains(DataFlags::PADDED) {
                        1 + u32::from(pad)
                    } else {
                        0
                    };
                self.on_data(stream, flags, data.clone(), flow).await
            }
            Frame::Headers {
                stream,
                flags,
                fragment,
                ..
            } => self.on_headers(stream, flags, fragment).await,
            Frame::Continuation {
                stream: _,
                flags,
                fragment,
            } => self.on_continuation(flags, fragment).await,
            Frame::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => self.on_push_promise(stream, flags, promised, fragment).await,
            Frame::ResetStream { stream, code } => self.on_reset(stream, code).await,
            Frame::Priority { stream, .. } => {
                trace!("ignoring PRIORITY for stream {}", stream);
                Ok(())
            }
            unknown @ Frame::Unknown { .. } => {
                self.on_unknown(unknown);
                Ok(())
            }
        }
    }

    fn on_unknown(&self, frame: Frame) {
        match &*self.shared.fallback.lock().expect("fallback lock") {
            Some(sink) => sink(frame),
            None => {
                if let Frame::Unknown { typ, stream, .. } = &frame {
                    trace!("discarding unknown frame type {:#04x} on stream {}", typ, stream);
                }
            }
        }
    }

    async fn on_settings(
        &mut self,
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    ) -> Result<()> {
        if flags.contains(SettingsFlags::ACK) {
            self.commit_local_settings();
            return Ok(());
        }
        let mut window_delta = 0i64;
        {
            let mut remote = self.shared.remote.write().expect("settings lock");
            for (param, value) in &params {
                match param {
                    SettingsParameter::EnablePush if *value > 1 => {
                        return Err(Error::framing(
                            ErrorCode::ProtocolError,
                            "ENABLE_PUSH must be 0 or 1",
                        ));
                    }
                    SettingsParameter::InitialWindowSize if *value > U31_MAX => {
                        return Err(Error::FlowControl("INITIAL_WINDOW_SIZE above 2^31-1"));
                    }
                    SettingsParameter::MaxFrameSize
                        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(value) =>
                    {
                        return Err(Error::framing(
                            ErrorCode::ProtocolError,
                            "MAX_FRAME_SIZE out of range",
                        ));
                    }
                    _ => {}
                }
                if *param == SettingsParameter::InitialWindowSize {
                    window_delta = i64::from(*value) - i64::from(remote[*param]);
                }
                remote[*param] = *value;
            }
        }
        if window_delta != 0 {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            for (_, entry) in registry.entries_mut() {
                entry
                    .shared
                    .send_window
                    .adjust(window_delta)
                    .map_err(|()| Error::FlowControl("stream window above 2^31-1 after SETTINGS"))?;
            }
        }
        debug!("peer settings applied: {:?}", params);
        self.shared
            .enqueue(WriteMessage::Frame(Frame::Settings {
                flags: SettingsFlags::ACK,
                params: Vec::new(),
            }))
            .await?;
        // the first SETTINGS exchange completes the handshake
        if let Some(ready) = self.shared.ready.lock().expect("ready lock").take() {
            ready.send(()).ok();
        }
        Ok(())
    }

    /// The peer ACKed our oldest outstanding SETTINGS batch; commit it.
    fn commit_local_settings(&mut self) {
        let batch = self
            .shared
            .pending_local
            .lock()
            .expect("pending settings lock")
            .pop_front();
        let Some(batch) = batch else {
            debug!("SETTINGS ACK with nothing pending");
            return;
        };
        for (param, value) in batch {
            match param {
                SettingsParameter::HeaderTableSize => {
                    self.decoder.set_max_table_size(value as usize);
                }
                SettingsParameter::InitialWindowSize => {
                    let delta = i64::from(value)
                        - i64::from(self.shared.local_value(SettingsParameter::InitialWindowSize));
                    if delta != 0 {
                        let mut registry = self.shared.registry.lock().expect("registry lock");
                        for (_, entry) in registry.entries_mut() {
                            entry.shared.recv_window.fetch_add(delta, Ordering::AcqRel);
                        }
                    }
                }
                _ => {}
            }
            self.shared.local.write().expect("settings lock")[param] = value;
        }
    }

    async fn on_ping(&mut self, flags: PingFlags, payload: [u8; 8]) -> Result<()> {
        if flags.contains(PingFlags::ACK) {
            let pending = self.shared.pings.lock().expect("pings lock").remove(&payload);
            match pending {
                Some(pending) => {
                    pending
                        .reply
                        .send(Ping {
                            sent: pending.sent,
                            received: Instant::now(),
                            payload,
                        })
                        .ok();
                }
                None => debug!("unsolicited PING ACK"),
            }
            return Ok(());
        }
        self.shared
            .enqueue(WriteMessage::Frame(Frame::Ping {
                flags: PingFlags::ACK,
                payload,
            }))
            .await
    }

    fn on_goaway(&mut self, last_stream: StreamId, code: ErrorCode, debug: Bytes) -> Result<()> {
        warn!("peer GOAWAY: last stream {}, {:?}", last_stream, code);
        if !debug.is_empty() {
            debug!("GOAWAY debug data: {}", String::from_utf8_lossy(&debug));
        }
        let refused = {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            registry.set_remote_goaway(last_stream);
            registry.refused_by(last_stream, Instant::now())
        };
        for entry in refused {
            entry.shared.send_window.close();
            entry
                .events
                .try_send(StreamEvent::Reset(ErrorCode::RefusedStream))
                .ok();
        }
        self.shared
            .goaway
            .send(Some(GoAway {
                last_stream,
                code,
                debug,
            }))
            .ok();
        Ok(())
    }

    fn on_stream_window(&mut self, stream: NonZeroStreamId, increment: NonZeroU32) -> Result<()> {
        let target = {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            if let Some(entry) = registry.get_mut(stream) {
                Some(entry.shared.clone())
            } else if registry.was_recently_closed(stream, Instant::now()) {
                None
            } else if registry.is_unknown(stream) {
                return Err(Error::framing(
                    ErrorCode::ProtocolError,
                    "WINDOW_UPDATE on an idle stream",
                ));
            } else {
                return Err(Error::framing(
                    ErrorCode::StreamClosed,
                    "WINDOW_UPDATE on a closed stream",
                ));
            }
        };
        if let Some(target) = target {
            target
                .send_window
                .release(increment.get())
                .map_err(|()| Error::FlowControl("stream window above 2^31-1"))?;
        }
        Ok(())
    }

    async fn on_data(
        &mut self,
        stream: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
        flow: u32,
    ) -> Result<()> {
        // connection-level accounting covers every DATA octet, delivered
        // or not
        let remaining = self
            .shared
            .recv_window
            .fetch_sub(i64::from(flow), Ordering::AcqRel)
            - i64::from(flow);
        if remaining < 0 {
            return Err(Error::FlowControl("peer overran the connection window"));
        }
        let end_stream = flags.contains(DataFlags::END_STREAM);
        let now = Instant::now();
        let target = {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            if let Some(entry) = registry.get_mut(stream) {
                let remaining = entry
                    .shared
                    .recv_window
                    .fetch_sub(i64::from(flow), Ordering::AcqRel)
                    - i64::from(flow);
                if remaining < 0 {
                    return Err(Error::FlowControl("peer overran a stream window"));
                }
                if end_stream {
                    entry.state = entry.state.on_recv_end();
                }
                let closed = entry.state.is_closed();
                let target = (entry.events.clone(), entry.shared.clone());
                if closed {
                    registry.close(stream, now);
                }
                Some(target)
            } else if registry.was_recently_closed(stream, now) {
                None
            } else {
                return Err(Error::framing(
                    ErrorCode::StreamClosed,
                    "DATA on an unknown or closed stream",
                ));
            }
        };
        match target {
            Some((events, stream_shared)) => {
                let padding = flow - data.len() as u32;
                if padding > 0 {
                    // padding never reaches the consumer; credit it back now
                    self.shared.replenish(&stream_shared, padding).await;
                }
                events
                    .send(StreamEvent::Data { data, end_stream })
                    .await
                    .ok();
            }
            None => {
                // straggler inside the grace window; only the connection
                // window still needs the credit back
                self.shared.replenish_connection(flow).await;
            }
        }
        Ok(())
    }

    async fn on_headers(
        &mut self,
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        fragment: Bytes,
    ) -> Result<()> {
        let end_stream = flags.contains(HeadersFlags::END_STREAM);
        if flags.contains(HeadersFlags::END_HEADERS) {
            let headers = self.decoder.decode(&fragment)?;
            self.route_headers(stream, headers, end_stream).await
        } else {
            self.block = Some(HeaderBlock {
                stream,
                kind: BlockKind::Headers { end_stream },
                fragments: BytesMut::from(&fragment[..]),
            });
            Ok(())
        }
    }

    async fn on_continuation(&mut self, flags: ContinuationFlags, fragment: Bytes) -> Result<()> {
        let Some(block) = &mut self.block else {
            return Err(Error::framing(
                ErrorCode::ProtocolError,
                "CONTINUATION without an open header block",
            ));
        };
        block.fragments.extend_from_slice(&fragment);
        if !flags.contains(ContinuationFlags::END_HEADERS) {
            return Ok(());
        }
        // unwrap: just matched Some above
        let block = self.block.take().unwrap();
        let headers = self.decoder.decode(&block.fragments)?;
        match block.kind {
            BlockKind::Headers { end_stream } => {
                self.route_headers(block.stream, headers, end_stream).await
            }
            BlockKind::Push { promised } => {
                self.deliver_push(block.stream, promised, headers).await
            }
        }
    }

    async fn route_headers(
        &mut self,
        stream: NonZeroStreamId,
        headers: Headers,
        end_stream: bool,
    ) -> Result<()> {
        let now = Instant::now();
        let target = {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            if let Some(entry) = registry.get_mut(stream) {
                entry.state = entry.state.on_recv_headers(end_stream);
                let closed = entry.state.is_closed();
                let events = entry.events.clone();
                if closed {
                    registry.close(stream, now);
                }
                Some(events)
            } else if registry.was_recently_closed(stream, now) {
                None
            } else {
                return Err(Error::framing(
                    ErrorCode::StreamClosed,
                    "HEADERS on an unknown or closed stream",
                ));
            }
        };
        if let Some(events) = target {
            events
                .send(StreamEvent::Headers { headers, end_stream })
                .await
                .ok();
        }
        Ok(())
    }

    async fn on_push_promise(
        &mut self,
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    ) -> Result<()> {
        if promised.get() % 2 != 0 {
            return Err(Error::framing(
                ErrorCode::ProtocolError,
                "promised stream id must be even",
            ));
        }
        if flags.contains(PushPromiseFlags::END_HEADERS) {
            let headers = self.decoder.decode(&fragment)?;
            self.deliver_push(stream, promised, headers).await
        } else {
            self.block = Some(HeaderBlock {
                stream,
                kind: BlockKind::Push { promised },
                fragments: BytesMut::from(&fragment[..]),
            });
            Ok(())
        }
    }

    async fn deliver_push(
        &mut self,
        parent: NonZeroStreamId,
        promised: NonZeroStreamId,
        headers: Headers,
    ) -> Result<()> {
        let now = Instant::now();
        // reserve a slot in the push sink first; if nobody is accepting
        // pushes, refuse the stream instead of queueing it forever
        let Ok(permit) = self.pushed.try_reserve() else {
            debug!("refusing pushed stream {}: no consumer", promised);
            return self
                .shared
                .enqueue(WriteMessage::Frame(Frame::ResetStream {
                    stream: promised,
                    code: ErrorCode::RefusedStream,
                }))
                .await;
        };
        let (stream_shared, events_rx) = {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            if registry.get_mut(parent).is_none() && !registry.was_recently_closed(parent, now) {
                return Err(Error::framing(
                    ErrorCode::ProtocolError,
                    "PUSH_PROMISE on an unknown stream",
                ));
            }
            let stream_shared = self.shared.new_stream_shared(promised);
            let (events_tx, events_rx) = mpsc::channel(MAILBOX_CAPACITY);
            registry.insert(
                promised,
                StreamEntry {
                    shared: stream_shared.clone(),
                    state: StreamState::ReservedRemote,
                    events: events_tx,
                },
            );
            (stream_shared, events_rx)
        };
        // the local half of a pushed stream is closed from the start
        let handle = StreamHandle::new(self.shared.clone(), stream_shared, events_rx, true);
        permit.send(PushedStream {
            parent,
            promised,
            headers,
            handle,
        });
        Ok(())
    }

    async fn on_reset(&mut self, stream: NonZeroStreamId, code: ErrorCode) -> Result<()> {
        let now = Instant::now();
        let target = {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            match registry.close(stream, now) {
                Some(entry) => Some(entry),
                None if registry.was_recently_closed(stream, now) => None,
                None if registry.is_unknown(stream) => {
                    return Err(Error::framing(
                        ErrorCode::ProtocolError,
                        "RST_STREAM on an idle stream",
                    ));
                }
                None => {
                    return Err(Error::framing(
                        ErrorCode::StreamClosed,
                        "RST_STREAM on a closed stream",
                    ));
                }
            }
        };
        if let Some(entry) = target {
            debug!("peer reset stream {}: {:?}", stream, code);
            entry.shared.send_window.close();
            entry.events.send(StreamEvent::Reset(code)).await.ok();
        }
        Ok(())
    }
}

async fn flow_tick_loop(shared: Arc<Shared>) {
    let period = shared
        .config
        .window_update_interval
        .max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if shared.is_poisoned() {
            return;
        }
        shared.flush_connection_credit().await;
        let streams: Vec<Arc<StreamShared>> = {
            let mut registry = shared.registry.lock().expect("registry lock");
            registry.prune_closed(Instant::now());
            registry
                .entries_mut()
                .map(|(_, entry)| entry.shared.clone())
                .collect()
        };
        for stream in streams {
            shared.flush_stream_credit(&stream).await;
        }
    }
}

/// Keepalive scheduler: a PING with a fresh payload every interval; a
/// missed ACK is fatal to the connection.
async fn ping_loop(shared: Arc<Shared>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    // the first tick of an interval fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if shared.is_poisoned() {
            return;
        }
        let payload = shared.next_ping_payload();
        match shared.ping_with_timeout(payload, timeout).await {
            Ok(ping) => trace!("keepalive rtt {:?}", ping.rtt()),
            Err(Error::PingTimeout) => {
                shared.poison(Error::PingTimeout);
                return;
            }
            Err(_) => return,
        }
    }
}
