//! The connection layer: socket lifecycle, the EXTERNAL auth handshake, the
//! framed receive loop, reply correlation and signal fan-out.
//!
//! There is no background task. Whichever caller is currently awaiting a
//! reply or a signal races its own queue against the reactor lock; the lock
//! holder reads the socket and dispatches for everybody, then the race is run
//! again. Exactly one task reads at a time and cancellation simply drops the
//! racing future.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, IoSlice, IoSliceMut},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    os::linux::net::SocketAddrExt,
    os::unix::net::{SocketAddr, UnixStream},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, OnceLock,
    },
};

use async_channel as channel;
use async_io::Async;
use async_lock::Mutex as AsyncMutex;
use futures_lite::{AsyncReadExt, AsyncWriteExt, FutureExt};
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, ProtocolError},
    marshal::{is_valid_object_path, Arg, Endian, Kind, ValidArg},
    message::{Message, MessageFlags, MessageKind},
};

/// Signals queued per subscription before the oldest one is dropped.
const SIGNAL_QUEUE_LEN: usize = 64;

// #### addresses ####

#[derive(Debug, PartialEq, Eq)]
enum SocketTarget {
    Path(String),
    Abstract(Vec<u8>),
}

impl SocketTarget {
    fn connect(&self) -> io::Result<UnixStream> {
        match self {
            Self::Path(path) => UnixStream::connect(path),
            Self::Abstract(name) => {
                let addr = SocketAddr::from_abstract_name(name)?;
                UnixStream::connect_addr(&addr)
            }
        }
    }
}

/// The D-Bus address grammar: semicolon-separated alternatives, tried in
/// order. Only unix transports are usable here.
fn parse_address(address: &str) -> Vec<SocketTarget> {
    let mut out = Vec::new();
    for part in address.split(';') {
        let Some((transport, opts)) = part.split_once(':') else { continue };
        if transport != "unix" {
            continue;
        }
        for opt in opts.split(',') {
            if let Some(path) = opt.strip_prefix("path=") {
                out.push(SocketTarget::Path(unescape(path)));
            } else if let Some(name) = opt.strip_prefix("abstract=") {
                out.push(SocketTarget::Abstract(unescape(name).into_bytes()));
            }
        }
    }
    out
}

/// Address values escape bytes as `%XX`.
fn unescape(text: &str) -> String {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next().and_then(hex_val);
            let lo = bytes.next().and_then(hex_val);
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                _ => out.push(b'%'),
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|v| v as u8)
}

// #### auth ####

struct LineReader<'a> {
    stream: &'a Async<UnixStream>,
    buf: Vec<u8>,
}

impl LineReader<'_> {
    async fn next_line(&mut self) -> Result<String, Error> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..pos + 2).take(pos).collect();
                return String::from_utf8(line)
                    .map_err(|_| Error::Auth("server sent a non-utf8 line".into()));
            }
            let mut chunk = [0u8; 256];
            let n = (&*self.stream).read(&mut chunk).await.map_err(disconnect_err)?;
            if n == 0 {
                return Err(Error::Disconnect(None));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// SASL EXTERNAL with the effective uid. Returns whether the server agreed
/// to fd passing, plus any bytes read past the line protocol.
async fn authenticate(stream: &Async<UnixStream>) -> Result<(bool, Vec<u8>), Error> {
    let uid = nix::unistd::Uid::effective().as_raw();
    let hex: String = uid.to_string().bytes().map(|b| format!("{:02x}", b)).collect();

    (&*stream)
        .write_all(format!("\0AUTH EXTERNAL {}\r\n", hex).as_bytes())
        .await
        .map_err(disconnect_err)?;

    let mut lines = LineReader { stream, buf: Vec::new() };
    let line = lines.next_line().await?;
    if !line.starts_with("OK ") {
        return Err(Error::Auth(line));
    }

    // fd passing is negotiated opportunistically, refusal is fine
    (&*stream).write_all(b"NEGOTIATE_UNIX_FD\r\n").await.map_err(disconnect_err)?;
    let unix_fd = lines.next_line().await?.starts_with("AGREE_UNIX_FD");

    (&*stream).write_all(b"BEGIN\r\n").await.map_err(disconnect_err)?;
    Ok((unix_fd, lines.buf))
}

fn disconnect_err(err: io::Error) -> Error {
    Error::Disconnect(Some(err.to_string()))
}

// #### signals ####

/// A signal delivered to a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalMsg {
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Vec<Arg>,
}

/// What a subscription wants to see; empty fields match everything.
#[derive(Clone, Debug, Default)]
pub struct SignalFilter {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl SignalFilter {
    pub fn matches(&self, signal: &SignalMsg) -> bool {
        // the bus rewrites senders to unique names, so only unique names and
        // the bus driver itself can be compared locally; well-known senders
        // are filtered by the bus-side match rule
        let sender_ok = match &self.sender {
            Some(want) if want.starts_with(':') || want == "org.freedesktop.DBus" => {
                signal.sender.as_deref() == Some(want.as_str())
            }
            _ => true,
        };
        sender_ok
            && self.path.as_deref().map_or(true, |want| want == signal.path)
            && self.interface.as_deref().map_or(true, |want| want == signal.interface)
            && self.member.as_deref().map_or(true, |want| want == signal.member)
    }
}

struct Subscription {
    filter: SignalFilter,
    queue: channel::Sender<SignalMsg>,
    /// kept to pop the oldest entry when the queue is full
    backlog: channel::Receiver<SignalMsg>,
    overflow: Arc<AtomicBool>,
}

// #### the connection ####

struct Reactor {
    buf: Vec<u8>,
    /// descriptors received out of band, not yet claimed by a frame
    fds: VecDeque<OwnedFd>,
}

struct State {
    pending: HashMap<u32, channel::Sender<Result<Message, Error>>>,
    subs: HashMap<u64, Subscription>,
    next_sub: u64,
    failed: Option<Error>,
}

pub struct Connection {
    stream: Async<UnixStream>,
    unix_fd: bool,
    serial: AtomicU32,
    unique_name: OnceLock<String>,
    /// serialises whole frames onto the socket
    writer: AsyncMutex<()>,
    /// whoever holds this is the reader; everyone else parks on a queue
    reactor: AsyncMutex<Reactor>,
    state: AsyncMutex<State>,
    /// frames queued from synchronous paths, flushed by the next driver
    control: (channel::Sender<Message>, channel::Receiver<Message>),
}

/// Detaches a cancelled or completed call from the pending table.
struct PendingGuard<'a> {
    con: &'a Connection,
    serial: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.con.state.lock_blocking().pending.remove(&self.serial);
    }
}

impl Connection {
    /// Connects, authenticates and says `Hello`.
    pub async fn open(address: &str) -> Result<Arc<Self>, Error> {
        let targets = parse_address(address);
        if targets.is_empty() {
            return Err(Error::Disconnect(Some(format!("no usable transport in {:?}", address))));
        }

        let mut stream = None;
        let mut last_err = None;
        for target in &targets {
            match target.connect() {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let Some(stream) = stream else {
            return Err(Error::Disconnect(last_err.map(|e| e.to_string())));
        };
        let stream = Async::new(stream).map_err(disconnect_err)?;

        let (unix_fd, leftover) = authenticate(&stream).await?;
        debug!(unix_fd, "authenticated to the bus");

        let con = Arc::new(Self {
            stream,
            unix_fd,
            serial: AtomicU32::new(1),
            unique_name: OnceLock::new(),
            writer: AsyncMutex::new(()),
            reactor: AsyncMutex::new(Reactor { buf: leftover, fds: VecDeque::new() }),
            state: AsyncMutex::new(State {
                pending: HashMap::new(),
                subs: HashMap::new(),
                next_sub: 0,
                failed: None,
            }),
            control: channel::unbounded(),
        });

        let body = con
            .call(
                "org.freedesktop.DBus",
                "/org/freedesktop/DBus",
                "org.freedesktop.DBus",
                "Hello",
                Vec::new(),
                None,
                MessageFlags::empty(),
            )
            .await?;
        let name = body
            .into_iter()
            .next()
            .and_then(String::unpack)
            .ok_or(Error::Protocol(ProtocolError::Malformed("Hello reply carried no name")))?;
        debug!(name = %name, "joined the bus");
        let _ = con.unique_name.set(name);

        Ok(con)
    }

    /// The `:x.y` name the bus assigned to this connection.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.get().map(String::as_str)
    }

    pub fn supports_unix_fd(&self) -> bool {
        self.unix_fd
    }

    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Issues a method call and waits for its reply body. With
    /// `NO_REPLY_EXPECTED` set, returns as soon as the frame is written.
    /// `signature` overrides the body signature header when given, so a
    /// mismatched caller-supplied signature reaches the peer as-is.
    pub async fn call(
        &self,
        dest: &str,
        path: &str,
        iface: &str,
        member: &str,
        body: Vec<Arg>,
        signature: Option<Vec<Kind>>,
        flags: MessageFlags,
    ) -> Result<Vec<Arg>, Error> {
        if !is_valid_object_path(path) {
            return Err(Error::Protocol(ProtocolError::BadObjectPath(path.into())));
        }

        let mut msg = Message::method_call(
            dest.to_owned(),
            path.to_owned(),
            iface.to_owned(),
            member.to_owned(),
        );
        msg.flags = flags;
        msg.headers.signature = signature;
        msg.body = body;
        msg.serial = self.next_serial();

        if flags.contains(MessageFlags::NO_REPLY_EXPECTED) {
            self.check_open()?;
            self.send_frame(msg).await?;
            return Ok(Vec::new());
        }

        let (tx, rx) = channel::bounded(1);
        {
            let mut state = self.state.lock().await;
            if let Some(err) = &state.failed {
                return Err(err.clone());
            }
            state.pending.insert(msg.serial, tx);
        }
        let _guard = PendingGuard { con: self, serial: msg.serial };

        self.send_frame(msg).await?;
        let reply = self.drive_until(&rx).await??;

        match reply.kind {
            MessageKind::Error => {
                let name = reply.headers.error_name.unwrap_or_default().into_owned();
                let message = reply.body.into_iter().next().and_then(String::unpack);
                Err(Error::Remote { name, message })
            }
            _ => Ok(reply.body),
        }
    }

    /// Broadcasts a signal from this connection.
    pub async fn emit_signal(
        &self,
        path: &str,
        iface: &str,
        member: &str,
        body: Vec<Arg>,
    ) -> Result<(), Error> {
        if !is_valid_object_path(path) {
            return Err(Error::Protocol(ProtocolError::BadObjectPath(path.into())));
        }
        self.check_open()?;

        let mut msg = Message::signal(path.to_owned(), iface.to_owned(), member.to_owned());
        msg.body = body;
        msg.serial = self.next_serial();
        self.send_frame(msg).await
    }

    pub(crate) fn add_subscription(
        &self,
        filter: SignalFilter,
    ) -> Result<(u64, channel::Receiver<SignalMsg>, Arc<AtomicBool>), Error> {
        let mut state = self.state.lock_blocking();
        if let Some(err) = &state.failed {
            return Err(err.clone());
        }
        let (tx, rx) = channel::bounded(SIGNAL_QUEUE_LEN);
        let overflow = Arc::new(AtomicBool::new(false));
        let id = state.next_sub;
        state.next_sub += 1;
        state.subs.insert(id, Subscription {
            filter,
            queue: tx,
            backlog: rx.clone(),
            overflow: overflow.clone(),
        });
        Ok((id, rx, overflow))
    }

    pub(crate) fn remove_subscription(&self, id: u64) {
        self.state.lock_blocking().subs.remove(&id);
    }

    /// Queues a frame for the next driver to write; used where sending
    /// cannot wait, like a subscription being dropped.
    pub(crate) fn queue_frame(&self, mut msg: Message) {
        if self.state.lock_blocking().failed.is_some() {
            return;
        }
        msg.serial = self.next_serial();
        let _ = self.control.0.try_send(msg);
    }

    /// Runs the receive loop until `rx` yields something. Cancellation-safe:
    /// dropping the returned future merely stops this task from driving.
    pub(crate) async fn drive_until<T>(&self, rx: &channel::Receiver<T>) -> Result<T, Error> {
        loop {
            enum Step<'g, T> {
                Delivered(Result<T, channel::RecvError>),
                Drive(async_lock::MutexGuard<'g, Reactor>),
            }

            let delivered = async { Step::Delivered(rx.recv().await) };
            let drive = async { Step::Drive(self.reactor.lock().await) };

            match delivered.or(drive).await {
                Step::Delivered(Ok(item)) => return Ok(item),
                Step::Delivered(Err(..)) => return Err(self.failure()),
                Step::Drive(mut reactor) => {
                    // the item may have arrived while the lock was acquired
                    match rx.try_recv() {
                        Ok(item) => return Ok(item),
                        Err(channel::TryRecvError::Closed) => return Err(self.failure()),
                        Err(channel::TryRecvError::Empty) => {}
                    }
                    self.pump(&mut reactor).await?;
                }
            }
        }
    }

    /// One reactor round: flush queued control frames, read a chunk and
    /// dispatch every complete frame in the buffer.
    async fn pump(&self, reactor: &mut Reactor) -> Result<(), Error> {
        while let Ok(msg) = self.control.1.try_recv() {
            self.send_frame(msg).await?;
        }

        let mut chunk = [0u8; 4096];
        let n = match self.recv_chunk(&mut chunk, &mut reactor.fds).await {
            Ok(0) => {
                let err = Error::Disconnect(None);
                self.fail_all(err.clone());
                return Err(err);
            }
            Ok(n) => n,
            Err(io_err) => {
                let err = Error::Disconnect(Some(io_err.to_string()));
                self.fail_all(err.clone());
                return Err(err);
            }
        };
        reactor.buf.extend_from_slice(&chunk[..n]);

        loop {
            match Message::deserialize(&reactor.buf, &mut reactor.fds) {
                Ok(Some((consumed, msg))) => {
                    reactor.buf.drain(..consumed);
                    match msg {
                        Some(msg) => self.dispatch(msg).await?,
                        None => trace!("skipping a message of unknown type"),
                    }
                }
                Ok(None) => break,
                Err(violation) => {
                    let err = Error::Protocol(violation);
                    self.fail_all(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, msg: Message) -> Result<(), Error> {
        match msg.kind {
            MessageKind::MethodReturn | MessageKind::Error => {
                // presence is enforced by the decoder
                let Some(serial) = msg.headers.reply_serial else { return Ok(()) };
                let waiter = self.state.lock().await.pending.remove(&serial);
                match waiter {
                    Some(tx) => {
                        let _ = tx.try_send(Ok(msg));
                    }
                    None => trace!(serial, "dropping a reply nobody is waiting for"),
                }
            }

            MessageKind::Signal => {
                let headers = msg.headers;
                let signal = SignalMsg {
                    sender: headers.sender,
                    path: headers.path.unwrap_or_default().into_owned(),
                    interface: headers.interface.unwrap_or_default().into_owned(),
                    member: headers.member.unwrap_or_default().into_owned(),
                    body: msg.body,
                };
                let state = self.state.lock().await;
                for sub in state.subs.values() {
                    if sub.filter.matches(&signal) {
                        // a slow consumer loses its oldest queued signal
                        if let Err(channel::TrySendError::Full(item)) = sub.queue.try_send(signal.clone()) {
                            let _ = sub.backlog.try_recv();
                            sub.overflow.store(true, Ordering::Relaxed);
                            let _ = sub.queue.try_send(item);
                            warn!(member = %signal.member, "signal subscription overflowed");
                        }
                    }
                }
            }

            MessageKind::MethodCall => {
                // we export no objects
                if !msg.flags.contains(MessageFlags::NO_REPLY_EXPECTED) {
                    let mut reply = Message::error_reply(
                        &msg,
                        "org.freedesktop.DBus.Error.NotSupported",
                        "this connection does not serve method calls",
                    );
                    reply.serial = self.next_serial();
                    self.send_frame(reply).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_frame(&self, msg: Message) -> Result<(), Error> {
        let (data, fds) = msg.serialize(Endian::native()).map_err(Error::Protocol)?;
        if !fds.is_empty() && !self.unix_fd {
            return Err(Error::Protocol(ProtocolError::Malformed("peer does not support fd passing")));
        }

        let _guard = self.writer.lock().await;
        let result = if fds.is_empty() {
            (&self.stream).write_all(&data).await
        } else {
            self.send_with_fds(&data, &fds).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(io_err) => {
                let err = Error::Disconnect(Some(io_err.to_string()));
                self.fail_all(err.clone());
                Err(err)
            }
        }
    }

    /// The descriptors ride as ancillary data on the first bytes of the
    /// frame; partial writes continue without them.
    async fn send_with_fds(&self, data: &[u8], fds: &[OwnedFd]) -> io::Result<()> {
        let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let mut sent = 0;
        let mut with_fds = true;
        while sent < data.len() {
            let n = self
                .stream
                .write_with(|s| {
                    let iov = [IoSlice::new(&data[sent..])];
                    let scm = [ControlMessage::ScmRights(&raw)];
                    let cmsgs: &[ControlMessage] = if with_fds { &scm } else { &[] };
                    socket::sendmsg::<UnixAddr>(s.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
                        .map_err(io::Error::from)
                })
                .await?;
            if n > 0 {
                with_fds = false;
            }
            sent += n;
        }
        Ok(())
    }

    async fn recv_chunk(&self, buf: &mut [u8], fds: &mut VecDeque<OwnedFd>) -> io::Result<usize> {
        self.stream
            .read_with(|s| {
                let mut iov = [IoSliceMut::new(buf)];
                let mut cmsg = nix::cmsg_space!([RawFd; 16]);
                let msg = socket::recvmsg::<UnixAddr>(
                    s.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;
                for c in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(list) = c {
                        for fd in list {
                            fds.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
                Ok(msg.bytes)
            })
            .await
    }

    /// Records the failure, fails every pending call and closes every
    /// subscription queue. The connection is terminal afterwards.
    fn fail_all(&self, err: Error) {
        let mut state = self.state.lock_blocking();
        if state.failed.is_none() {
            state.failed = Some(err.clone());
        }
        for (.., tx) in state.pending.drain() {
            let _ = tx.try_send(Err(err.clone()));
        }
        for (.., sub) in state.subs.drain() {
            sub.queue.close();
        }
        debug!(%err, "connection torn down");
    }

    /// What to report to a waiter whose queue closed under it: the recorded
    /// connection failure, or a plain cancellation when the waiter was
    /// merely detached.
    fn failure(&self) -> Error {
        self.state.lock_blocking().failed.clone().unwrap_or(Error::Cancelled)
    }

    fn check_open(&self) -> Result<(), Error> {
        match &self.state.lock_blocking().failed {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Shuts the socket down and tears everything down immediately.
    pub fn close(&self) {
        let _ = self.stream.get_ref().shutdown(std::net::Shutdown::Both);
        self.fail_all(Error::Disconnect(None));
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.state.lock_blocking().pending.len()
    }
}

// #### test bus ####

#[cfg(test)]
pub(crate) mod testbus {
    //! A scripted bus peer speaking the real wire format over a socket in the
    //! temp directory, so connection-level behavior is testable without a
    //! session bus.

    use std::{
        collections::VecDeque,
        io::{Read, Write},
        os::unix::net::{UnixListener, UnixStream},
        sync::atomic::{AtomicU32, Ordering},
    };

    use crate::{
        marshal::{Arg, Endian},
        message::{Headers, Message, MessageFlags, MessageKind},
    };

    pub struct Peer {
        stream: UnixStream,
        buf: Vec<u8>,
        serial: u32,
    }

    impl Peer {
        /// Serves the client side of the SASL EXTERNAL handshake.
        pub fn handshake(&mut self) {
            let line = self.read_auth_line();
            assert!(line.starts_with("AUTH EXTERNAL"), "unexpected auth line {:?}", line);
            self.stream.write_all(b"OK 1234deadbeef5678feedface9abcde\r\n").unwrap();
            let line = self.read_auth_line();
            assert_eq!(line, "NEGOTIATE_UNIX_FD");
            self.stream.write_all(b"AGREE_UNIX_FD\r\n").unwrap();
            let line = self.read_auth_line();
            assert_eq!(line, "BEGIN");
        }

        fn read_auth_line(&mut self) -> String {
            loop {
                if self.buf.first() == Some(&0) {
                    self.buf.remove(0);
                }
                if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                    let line: Vec<u8> = self.buf.drain(..pos + 2).take(pos).collect();
                    return String::from_utf8(line).unwrap();
                }
                let mut chunk = [0u8; 256];
                let n = self.stream.read(&mut chunk).unwrap();
                assert!(n > 0, "client hung up during auth");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        pub fn read_frame(&mut self) -> Option<Message> {
            let mut fds = VecDeque::new();
            loop {
                match Message::deserialize(&self.buf, &mut fds).unwrap() {
                    Some((consumed, msg)) => {
                        self.buf.drain(..consumed);
                        return Some(msg.unwrap());
                    }
                    None => {
                        let mut chunk = [0u8; 4096];
                        let n = self.stream.read(&mut chunk).ok()?;
                        if n == 0 {
                            return None;
                        }
                        self.buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }

        pub fn write_frame(&mut self, mut msg: Message) {
            if msg.serial == 0 {
                self.serial += 1;
                msg.serial = self.serial;
            }
            let (data, fds) = msg.serialize(Endian::native()).unwrap();
            assert!(fds.is_empty(), "the test peer cannot send fds");
            self.stream.write_all(&data).unwrap();
        }

        pub fn reply(&mut self, to: &Message, body: Vec<Arg>) {
            self.write_frame(Message {
                kind: MessageKind::MethodReturn,
                flags: MessageFlags::empty(),
                serial: 0,
                headers: Headers { reply_serial: Some(to.serial), ..Headers::default() },
                body,
            });
        }

        pub fn serve_hello(&mut self) {
            let hello = self.read_frame().unwrap();
            assert_eq!(hello.headers.member.as_deref(), Some("Hello"));
            self.reply(&hello, vec![Arg::Simple(crate::marshal::SimpleArg::String(":1.99".into()))]);
        }

        /// Keeps answering method calls until the client hangs up.
        pub fn serve(&mut self, mut handler: impl FnMut(&Message) -> Vec<Arg>) {
            while let Some(msg) = self.read_frame() {
                if msg.kind == MessageKind::MethodCall
                    && !msg.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
                {
                    let body = handler(&msg);
                    self.reply(&msg, body);
                }
            }
        }
    }

    static BUS_ID: AtomicU32 = AtomicU32::new(0);

    /// Binds a one-shot bus peer; `script` runs on its own thread once the
    /// client connects. Returns the bus address to connect to.
    pub fn spawn_bus(script: impl FnOnce(Peer) + Send + 'static) -> String {
        let path = std::env::temp_dir().join(format!(
            "minibus-test-{}-{}",
            std::process::id(),
            BUS_ID.fetch_add(1, Ordering::Relaxed),
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        let address = format!("unix:path={}", path.display());
        std::thread::spawn(move || {
            let (stream, ..) = listener.accept().unwrap();
            script(Peer { stream, buf: Vec::new(), serial: 1000 });
            let _ = std::fs::remove_file(&path);
        });
        address
    }
}
