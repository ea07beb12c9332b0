//! Methods to connect to a WebSocket as a client.
//!
//! [`WebSocket`] owns the whole connection lifecycle: it resolves and
//! connects the TCP transport, negotiates TLS for `wss`/`https` URLs,
//! performs the opening handshake, and then runs two threads. The reader
//! thread is the only owner of the frame decoder and the connection state
//! machine; the writer thread serializes outbound frames through a FIFO
//! queue. User callbacks are handed to a configurable [`Executor`].

use bytes::Bytes;
use log::*;
use std::{
    net::{Shutdown, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};
use url::Url;

use crate::{
    error::{CapacityError, Error, ProtocolError, Result, UrlError},
    executor::{Executor, InlineExecutor},
    handshake::{
        client::{Request, Response, VerifyData},
        TryParse,
    },
    protocol::{
        frame::{
            coding::{CloseCode, Data as OpData, OpCode},
            CloseFrame, Frame, Utf8Bytes,
        },
        Message, WebSocketConfig, WebSocketContext,
    },
    stream::{MaybeTlsStream, Mode},
    tls::{self, TlsSettings, TrustEvaluator},
};

/// How long a single blocking read on the shared transport may last before
/// the reader releases the lock so queued writes can interleave.
const READ_POLL: Duration = Duration::from_millis(100);

/// Reader chunk size.
const READ_CHUNK: usize = 16 * 1024;

/// Upper bound on the size of the handshake response.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Get the mode of the given URL.
pub fn uri_mode(url: &Url) -> Result<Mode> {
    match url.scheme() {
        "ws" | "http" => Ok(Mode::Plain),
        "wss" | "https" => Ok(Mode::Tls),
        _ => Err(Error::Url(UrlError::UnsupportedUrlScheme)),
    }
}

/// Observable lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Fresh instance, `connect` has not been called yet.
    Created,
    /// Transport and handshake in progress.
    Connecting,
    /// Handshake accepted, messages flow.
    Open,
    /// A close was initiated (either side), awaiting teardown.
    Closing,
    /// Terminal. A new `connect` starts over.
    Closed,
}

/// Delegate-style observer carrying the connection events.
///
/// All methods have empty default implementations, implement the ones you
/// care about. The per-event closures (`on_text` and friends on
/// [`WebSocket`]) fire as well where set; both mechanisms receive every
/// event.
pub trait Listener: Send + Sync {
    /// The opening handshake completed.
    fn on_connect(&self) {}
    /// The connection is gone; fired exactly once, after every other event.
    fn on_disconnect(&self, _error: Option<&Error>) {}
    /// A complete text message arrived.
    fn on_text(&self, _text: &str) {}
    /// A complete binary message arrived.
    fn on_data(&self, _data: &[u8]) {}
    /// A pong frame arrived.
    fn on_pong(&self, _data: &[u8]) {}
}

/// A client WebSocket connection.
///
/// ```no_run
/// use websock::WebSocket;
///
/// let ws = WebSocket::new("wss://echo.example.org/chat").unwrap();
/// ws.on_connect(|| println!("open"));
/// ws.on_text(|text| println!("< {text}"));
/// ws.on_disconnect(|err| println!("gone: {err:?}"));
/// ws.connect().unwrap();
/// ws.write_text("hello");
/// ```
pub struct WebSocket {
    shared: Arc<Shared>,
}

struct Shared {
    url: Url,
    protocols: Vec<String>,
    settings: Mutex<Settings>,
    callbacks: Mutex<Callbacks>,
    state: Mutex<ConnectionState>,
    /// Ensures `on_disconnect` fires at most once per connection.
    disconnect_fired: AtomicBool,
    /// Set when the local side initiated the close.
    local_close: AtomicBool,
    /// Bumped on every `connect`; stale threads check it and stand down.
    generation: AtomicU64,
    link: Mutex<Option<Link>>,
}

/// Per-connection runtime handles.
struct Link {
    writer: Sender<Command>,
    /// A clone of the raw socket, used for shutdown and timeouts without
    /// touching the stream lock.
    control: TcpStream,
    /// Subprotocol echoed by the server, if any.
    protocol: Option<String>,
}

#[derive(Clone)]
struct Settings {
    origin: Option<String>,
    extra_headers: Vec<(String, String)>,
    tcp_nodelay: bool,
    config: WebSocketConfig,
    tls: TlsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            origin: None,
            extra_headers: Vec::new(),
            tcp_nodelay: false,
            config: WebSocketConfig::default(),
            tls: TlsSettings::default(),
        }
    }
}

#[derive(Clone)]
struct Callbacks {
    executor: Arc<dyn Executor>,
    listener: Option<Arc<dyn Listener>>,
    on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    on_disconnect: Option<Arc<dyn Fn(Option<&Error>) + Send + Sync>>,
    on_text: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    on_data: Option<Arc<dyn Fn(&[u8]) + Send + Sync>>,
    on_pong: Option<Arc<dyn Fn(&[u8]) + Send + Sync>>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Callbacks {
            executor: Arc::new(InlineExecutor),
            listener: None,
            on_connect: None,
            on_disconnect: None,
            on_text: None,
            on_data: None,
            on_pong: None,
        }
    }
}

/// Work items for the writer thread.
enum Command {
    /// Mask and transmit this frame.
    Frame(Frame),
    /// Close the socket and exit after everything queued before was written.
    Shutdown,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WebSocket {
    /// Create a client for the given URL. The scheme must be one of `ws`,
    /// `wss`, `http` or `https`.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_protocols(url, &[])
    }

    /// Create a client that offers the given subprotocols during the
    /// handshake.
    pub fn with_protocols(url: &str, protocols: &[&str]) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Url(UrlError::Malformed(e)))?;
        uri_mode(&url)?;
        if url.host_str().is_none() {
            return Err(Error::Url(UrlError::NoHostName));
        }
        Ok(WebSocket {
            shared: Arc::new(Shared {
                url,
                protocols: protocols.iter().map(|p| p.to_string()).collect(),
                settings: Mutex::new(Settings::default()),
                callbacks: Mutex::new(Callbacks::default()),
                state: Mutex::new(ConnectionState::Created),
                disconnect_fired: AtomicBool::new(false),
                local_close: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                link: Mutex::new(None),
            }),
        })
    }

    /// The URL this client connects to.
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Whether the connection is open for traffic.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The subprotocol the server selected, once connected.
    pub fn protocol(&self) -> Option<String> {
        lock(&self.shared.link).as_ref().and_then(|l| l.protocol.clone())
    }

    /// Set the executor user callbacks are submitted to. The default runs
    /// them inline on the reader thread.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        lock(&self.shared.callbacks).executor = executor;
    }

    /// Set the delegate-style listener.
    pub fn set_listener(&self, listener: Arc<dyn Listener>) {
        lock(&self.shared.callbacks).listener = Some(listener);
    }

    /// Called when the opening handshake completes.
    pub fn on_connect(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.callbacks).on_connect = Some(Arc::new(callback));
    }

    /// Called exactly once when the connection goes away; carries the error
    /// that ended it, or `None` after a locally initiated clean close.
    pub fn on_disconnect(&self, callback: impl Fn(Option<&Error>) + Send + Sync + 'static) {
        lock(&self.shared.callbacks).on_disconnect = Some(Arc::new(callback));
    }

    /// Called for every complete text message.
    pub fn on_text(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.shared.callbacks).on_text = Some(Arc::new(callback));
    }

    /// Called for every complete binary message.
    pub fn on_data(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        lock(&self.shared.callbacks).on_data = Some(Arc::new(callback));
    }

    /// Called for every pong frame.
    pub fn on_pong(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        lock(&self.shared.callbacks).on_pong = Some(Arc::new(callback));
    }

    /// Override the `Origin` header of the handshake request.
    pub fn set_origin(&self, origin: impl Into<String>) {
        lock(&self.shared.settings).origin = Some(origin.into());
    }

    /// Add a pass-through header to the handshake request.
    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        lock(&self.shared.settings).extra_headers.push((name.into(), value.into()));
    }

    /// Enable `TCP_NODELAY` on the transport socket.
    pub fn set_tcp_nodelay(&self, nodelay: bool) {
        lock(&self.shared.settings).tcp_nodelay = nodelay;
    }

    /// Change the protocol limits (message and frame sizes).
    pub fn set_config(&self, config: WebSocketConfig) {
        lock(&self.shared.settings).config = config;
    }

    /// Accept self-signed certificates: disables chain validation and host
    /// name matching for TLS connections.
    pub fn set_allow_self_signed(&self, allow: bool) {
        lock(&self.shared.settings).tls.allow_self_signed = allow;
    }

    /// Install a trust evaluator consulted for the peer certificate chain,
    /// e.g. for certificate pinning.
    pub fn set_trust_evaluator(
        &self,
        evaluator: impl Fn(&[rustls_pki_types::CertificateDer<'static>], &str) -> bool
            + Send
            + Sync
            + 'static,
    ) {
        let evaluator: TrustEvaluator = Arc::new(evaluator);
        lock(&self.shared.settings).tls.trust_evaluator = Some(evaluator);
    }

    /// Restrict the TLS cipher suites offered for negotiation.
    pub fn set_cipher_suites(&self, suites: Vec<rustls::SupportedCipherSuite>) {
        lock(&self.shared.settings).tls.cipher_suites = Some(suites);
    }

    /// Open the connection.
    ///
    /// Returns immediately; the transport, TLS and the opening handshake
    /// run on a background thread. Success is reported through
    /// `on_connect`, failure through `on_disconnect`.
    pub fn connect(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            match *state {
                ConnectionState::Created | ConnectionState::Closed => {
                    *state = ConnectionState::Connecting;
                }
                _ => return Err(Error::AlreadyConnected),
            }
        }
        self.shared.disconnect_fired.store(false, Ordering::SeqCst);
        self.shared.local_close.store(false, Ordering::SeqCst);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("websock-reader".into())
            .spawn(move || run_connection(shared, generation));
        if let Err(err) = spawned {
            *lock(&self.shared.state) = ConnectionState::Closed;
            return Err(Error::Io(err));
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// * `None` — send a close frame and let the server drive the EOF.
    /// * `Some(d)`, `d > 0` — send a close frame and force the transport
    ///   closed after `d` if the server has not closed it by then.
    /// * `Some(Duration::ZERO)` — tear the transport down immediately,
    ///   without a close frame; pending writes are preempted.
    pub fn disconnect(&self, timeout: Option<Duration>) {
        let connecting = {
            let state = lock(&self.shared.state);
            match *state {
                ConnectionState::Open => false,
                ConnectionState::Connecting => true,
                _ => return,
            }
        };
        self.shared.local_close.store(true, Ordering::SeqCst);
        *lock(&self.shared.state) = ConnectionState::Closing;

        if connecting {
            // No open transport to speak the close handshake on yet; the
            // connection thread notices the state change and stands down.
            self.force_shutdown();
            return;
        }

        match timeout {
            Some(d) if d.is_zero() => {
                self.force_shutdown();
            }
            other => {
                let frame = Frame::close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: <_>::default(),
                }));
                if let Some(link) = lock(&self.shared.link).as_ref() {
                    let _ = link.writer.send(Command::Frame(frame));
                }
                if let Some(d) = other {
                    let shared = Arc::clone(&self.shared);
                    let generation = shared.generation.load(Ordering::SeqCst);
                    let spawned = thread::Builder::new().name("websock-close-timer".into()).spawn(
                        move || {
                            thread::sleep(d);
                            if shared.generation.load(Ordering::SeqCst) == generation
                                && *lock(&shared.state) != ConnectionState::Closed
                            {
                                debug!("close timeout expired, forcing transport shutdown");
                                shutdown_transport(&shared);
                            }
                        },
                    );
                    if let Err(err) = spawned {
                        warn!("failed to spawn close timer: {err}");
                        shutdown_transport(&self.shared);
                    }
                }
            }
        }
    }

    /// Send a text message. Silently dropped unless the connection is open.
    pub fn write_text(&self, text: &str) {
        self.send_frame(Frame::message(
            Bytes::copy_from_slice(text.as_bytes()),
            OpCode::Data(OpData::Text),
            true,
        ));
    }

    /// Send a binary message. Silently dropped unless the connection is open.
    pub fn write_binary(&self, data: impl Into<Bytes>) {
        self.send_frame(Frame::message(data, OpCode::Data(OpData::Binary), true));
    }

    /// Send a ping with the given payload (at most 125 bytes). Silently
    /// dropped unless the connection is open.
    pub fn write_ping(&self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.len() > 125 {
            warn!("dropping ping with oversized payload ({} bytes)", data.len());
            return;
        }
        self.send_frame(Frame::ping(data));
    }

    fn send_frame(&self, frame: Frame) {
        if !self.is_connected() {
            trace!("dropping write while not connected");
            return;
        }
        if let Some(link) = lock(&self.shared.link).as_ref() {
            if link.writer.send(Command::Frame(frame)).is_err() {
                trace!("dropping write, writer is gone");
            }
        }
    }

    fn force_shutdown(&self) {
        shutdown_transport(&self.shared);
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        // The handle is gone: no callback may fire after this, and the
        // connection threads must wind down.
        self.shared.disconnect_fired.store(true, Ordering::SeqCst);
        self.shared.local_close.store(true, Ordering::SeqCst);
        *lock(&self.shared.state) = ConnectionState::Closed;
        if let Some(link) = lock(&self.shared.link).take() {
            let _ = link.writer.send(Command::Shutdown);
            let _ = link.control.shutdown(Shutdown::Both);
        }
    }
}

/// Close the raw socket out-of-band. Pending reads and writes fail over to
/// the teardown path.
fn shutdown_transport(shared: &Shared) {
    if let Some(link) = lock(&shared.link).as_ref() {
        let _ = link.control.shutdown(Shutdown::Both);
    }
}

/// Everything a live connection runs on.
struct Session {
    stream: Arc<Mutex<MaybeTlsStream<TcpStream>>>,
    ctx: WebSocketContext,
    writer_rx: Receiver<Command>,
    control: TcpStream,
}

/// Entry point of the connection thread.
fn run_connection(shared: Arc<Shared>, generation: u64) {
    match establish(&shared, generation) {
        Ok(session) => {
            let Session { stream, ctx, writer_rx, control } = session;
            let writer_stream = Arc::clone(&stream);
            let writer_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new().name("websock-writer".into()).spawn(move || {
                writer_loop(writer_shared, generation, writer_stream, control, writer_rx)
            });
            match spawned {
                Ok(_) => reader_loop(&shared, generation, stream, ctx),
                Err(err) => finish(&shared, generation, Some(Error::Io(err))),
            }
        }
        Err(err) => {
            // A locally requested teardown mid-handshake is not an error.
            let error = if shared.local_close.load(Ordering::SeqCst) { None } else { Some(err) };
            finish(&shared, generation, error);
        }
    }
}

/// Open the transport, negotiate TLS, run the opening handshake. Returns
/// with the connection in the `Open` state and `on_connect` dispatched.
fn establish(shared: &Shared, generation: u64) -> Result<Session> {
    let settings = lock(&shared.settings).clone();
    let url = &shared.url;
    let mode = uri_mode(url)?;
    let host = url.host_str().ok_or(Error::Url(UrlError::NoHostName))?.to_string();

    let addrs = url
        .socket_addrs(|| None)
        .map_err(|_| Error::Url(UrlError::UnableToConnect(url.to_string())))?;
    let tcp = connect_to_some(addrs.iter().copied(), url)?;
    if settings.tcp_nodelay {
        tcp.set_nodelay(true)?;
    }
    let control = tcp.try_clone()?;

    let mut stream = tls::wrap_stream(tcp, &host, mode, &settings.tls)?;

    // Opening handshake: write the upgrade request, then accumulate bytes
    // until the end-of-headers terminator shows up.
    let request = Request::new(
        url.clone(),
        shared.protocols.clone(),
        settings.origin.clone(),
        settings.extra_headers.clone(),
    );
    let verify = VerifyData::for_request(&request);
    {
        use std::io::Write;
        stream.write_all(&request.to_bytes()?)?;
        stream.flush()?;
    }
    debug!("performing client handshake with {url}");

    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    let (header_size, response) = loop {
        if let Some(found) = Response::try_parse(&buf)? {
            break found;
        }
        if buf.len() > MAX_RESPONSE_BYTES {
            return Err(Error::Capacity(CapacityError::HeaderTooLong));
        }
        use std::io::Read;
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::Protocol(ProtocolError::HandshakeIncomplete));
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    verify.verify_response(&response)?;
    debug!("client handshake done");

    // Whatever followed the terminator already belongs to the framing layer.
    let ctx = WebSocketContext::from_partially_read(&buf[header_size..], settings.config);

    // From here on the reader only holds the stream lock for one poll
    // interval at a time, letting the writer interleave.
    control.set_read_timeout(Some(READ_POLL))?;

    let (writer_tx, writer_rx) = mpsc::channel();
    let writer_control = control.try_clone()?;
    {
        let mut state = lock(&shared.state);
        if shared.generation.load(Ordering::SeqCst) != generation
            || *state != ConnectionState::Connecting
        {
            return Err(Error::AlreadyClosed);
        }
        *state = ConnectionState::Open;
        *lock(&shared.link) = Some(Link {
            writer: writer_tx,
            control,
            protocol: response.protocol().map(Into::into),
        });
    }

    dispatch_connect(shared);

    Ok(Session {
        stream: Arc::new(Mutex::new(stream)),
        ctx,
        writer_rx,
        control: writer_control,
    })
}

fn connect_to_some(
    addrs: impl Iterator<Item = std::net::SocketAddr>,
    url: &Url,
) -> Result<TcpStream> {
    for addr in addrs {
        debug!("trying to contact {url} at {addr}...");
        if let Ok(stream) = TcpStream::connect(addr) {
            return Ok(stream);
        }
    }
    Err(Error::Url(UrlError::UnableToConnect(url.to_string())))
}

/// The reader: sole owner of the decoder and the reassembly state. Polls
/// the transport, feeds the context and dispatches events.
fn reader_loop(
    shared: &Arc<Shared>,
    generation: u64,
    stream: Arc<Mutex<MaybeTlsStream<TcpStream>>>,
    mut ctx: WebSocketContext,
) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        // Drain everything parseable before blocking on the transport;
        // handshake tail bytes are handled by the first pass.
        match drain_messages(shared, generation, &mut ctx) {
            Flow::Continue => {}
            Flow::Stop => return,
        }

        if *lock(&shared.state) == ConnectionState::Closed {
            return;
        }

        let read = {
            use std::io::Read;
            let mut guard = lock(&stream);
            guard.read(&mut chunk)
        };
        match read {
            Ok(0) => {
                let error = if shared.local_close.load(Ordering::SeqCst) {
                    // We initiated the close; the server finishing the
                    // handshake by EOF is the expected clean end.
                    None
                } else {
                    Some(Error::Protocol(ProtocolError::ResetWithoutClosingHandshake))
                };
                finish(shared, generation, error);
                return;
            }
            Ok(n) => ctx.feed(&chunk[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                let error = if shared.local_close.load(Ordering::SeqCst) {
                    // Forced local shutdown races the read; not an error.
                    None
                } else {
                    Some(Error::Io(err))
                };
                finish(shared, generation, error);
                return;
            }
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Pull completed messages out of the context and act on them.
fn drain_messages(shared: &Arc<Shared>, generation: u64, ctx: &mut WebSocketContext) -> Flow {
    loop {
        match ctx.read_message() {
            Ok(None) => return Flow::Continue,
            Ok(Some(Message::Text(text))) => dispatch_text(shared, text),
            Ok(Some(Message::Binary(data))) => dispatch_data(shared, data),
            Ok(Some(Message::Pong(data))) => dispatch_pong(shared, data),
            Ok(Some(Message::Ping(payload))) => {
                // Upon receipt of a Ping frame, an endpoint MUST send a Pong
                // frame in response with the same payload. (RFC 6455)
                // Queued ahead of any dispatch that follows, so the FIFO
                // writer gets it out before later traffic.
                send_command(shared, Command::Frame(Frame::pong(payload)));
            }
            Ok(Some(Message::Close(frame))) => {
                if shared.local_close.load(Ordering::SeqCst) {
                    // Reply to our own close frame; keep reading until the
                    // server closes the transport.
                    debug!("close acknowledged by peer: {frame:?}");
                    continue;
                }
                // Peer-initiated close: echo it back and report the code.
                send_command(shared, Command::Frame(Frame::close(frame.clone())));
                send_command(shared, Command::Shutdown);
                finish(shared, generation, Some(Error::ConnectionClosed(frame)));
                return Flow::Stop;
            }
            Err(err) => {
                // Framing violations are unrecoverable: fail the connection
                // with the code the error maps to.
                if let Some(code) = err.close_code() {
                    let close = Frame::close(Some(CloseFrame { code, reason: Utf8Bytes::default() }));
                    send_command(shared, Command::Frame(close));
                }
                send_command(shared, Command::Shutdown);
                finish(shared, generation, Some(err));
                return Flow::Stop;
            }
        }
    }
}

fn send_command(shared: &Shared, command: Command) {
    if let Some(link) = lock(&shared.link).as_ref() {
        let _ = link.writer.send(command);
    }
}

/// The write pump: one worker draining the FIFO queue. Frames are masked
/// with a fresh random key and written in full before the next one starts.
fn writer_loop(
    shared: Arc<Shared>,
    generation: u64,
    stream: Arc<Mutex<MaybeTlsStream<TcpStream>>>,
    control: TcpStream,
    rx: Receiver<Command>,
) {
    while let Ok(command) = rx.recv() {
        match command {
            Command::Frame(mut frame) => {
                if shared.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                // 5. If the data is being sent by the client, the frame(s)
                // MUST be masked. (RFC 6455)
                frame.set_random_mask();
                let mut buf = Vec::with_capacity(frame.len());
                frame.format(&mut buf).expect("Bug: can't write to vector");

                let result = {
                    use std::io::Write;
                    let mut guard = lock(&stream);
                    guard.write_all(&buf).and_then(|()| guard.flush())
                };
                if let Err(err) = result {
                    debug!("transport write failed: {err}");
                    let _ = control.shutdown(Shutdown::Both);
                    finish(&shared, generation, Some(Error::Write(err)));
                    return;
                }
            }
            Command::Shutdown => {
                let _ = control.shutdown(Shutdown::Both);
                return;
            }
        }
    }
}

/// Terminal transition. Flips the state to `Closed`, retires the link and
/// fires `on_disconnect` at most once.
fn finish(shared: &Shared, generation: u64, error: Option<Error>) {
    {
        let mut state = lock(&shared.state);
        if shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *state = ConnectionState::Closed;
    }
    if let Some(link) = lock(&shared.link).take() {
        // Let the writer flush what was queued (close echoes included),
        // then close the socket and exit.
        if link.writer.send(Command::Shutdown).is_err() {
            // Writer is already gone; close the socket ourselves.
            let _ = link.control.shutdown(Shutdown::Both);
        }
    }
    if !shared.disconnect_fired.swap(true, Ordering::SeqCst) {
        let callbacks = lock(&shared.callbacks).clone();
        let executor = Arc::clone(&callbacks.executor);
        debug!("connection closed: {error:?}");
        executor.execute(Box::new(move || {
            if let Some(cb) = &callbacks.on_disconnect {
                cb(error.as_ref());
            }
            if let Some(listener) = &callbacks.listener {
                listener.on_disconnect(error.as_ref());
            }
        }));
    }
}

fn dispatch_connect(shared: &Shared) {
    if shared.disconnect_fired.load(Ordering::SeqCst) {
        return;
    }
    let callbacks = lock(&shared.callbacks).clone();
    let executor = Arc::clone(&callbacks.executor);
    executor.execute(Box::new(move || {
        if let Some(cb) = &callbacks.on_connect {
            cb();
        }
        if let Some(listener) = &callbacks.listener {
            listener.on_connect();
        }
    }));
}

fn dispatch_text(shared: &Shared, text: Utf8Bytes) {
    if shared.disconnect_fired.load(Ordering::SeqCst) {
        return;
    }
    let callbacks = lock(&shared.callbacks).clone();
    let executor = Arc::clone(&callbacks.executor);
    executor.execute(Box::new(move || {
        if let Some(cb) = &callbacks.on_text {
            cb(&text);
        }
        if let Some(listener) = &callbacks.listener {
            listener.on_text(&text);
        }
    }));
}

fn dispatch_data(shared: &Shared, data: Bytes) {
    if shared.disconnect_fired.load(Ordering::SeqCst) {
        return;
    }
    let callbacks = lock(&shared.callbacks).clone();
    let executor = Arc::clone(&callbacks.executor);
    executor.execute(Box::new(move || {
        if let Some(cb) = &callbacks.on_data {
            cb(&data);
        }
        if let Some(listener) = &callbacks.listener {
            listener.on_data(&data);
        }
    }));
}

fn dispatch_pong(shared: &Shared, data: Bytes) {
    if shared.disconnect_fired.load(Ordering::SeqCst) {
        return;
    }
    let callbacks = lock(&shared.callbacks).clone();
    let executor = Arc::clone(&callbacks.executor);
    executor.execute(Box::new(move || {
        if let Some(cb) = &callbacks.on_pong {
            cb(&data);
        }
        if let Some(listener) = &callbacks.listener {
            listener.on_pong(&data);
        }
    }));
}
