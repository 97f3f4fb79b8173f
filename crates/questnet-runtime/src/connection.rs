//! Engine-side connection object.
//!
//! A `Connection` is shared through `Arc` between the registry, the client
//! that created it, in-flight tasks and the reclaimer. Threads that touch it
//! outside the registry lock hold a [`Pinned`] guard; the reclaimer only
//! drops it once the pin count is back to zero and its close task ran.
//! Dropping the last reference closes the socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use questnet_core::{
    ConnectionInfo, ConnectionToken, DatagramRecv, NetResult, QuestProcessor, RawSocket, ReliableDatagram,
};
use questnet_module::sys;

use crate::buffer::{RecvBuffer, SendBuffer};
use crate::correlator::Correlator;
use crate::keepalive::KeepAlive;
use crate::lifecycle::EventGate;

/// The client object a connection reports to.
///
/// Held weakly: a client that was dropped leaves its connections floating
/// until the engine tears them down.
///
/// # Implementors
///
/// - `TcpClient`, `UdpClient` (client module)
pub trait ConnectionOwner: Send + Sync {
    /// A connect attempt finished. Called from the reactor or the timeout
    /// thread; heavy work belongs on the task pool.
    fn socket_connected(&self, conn: &Arc<Connection>, connected: bool);

    /// The engine removed `conn` from the registry and cleared its
    /// callbacks. The owner forgets it and schedules the close event.
    fn will_close(&self, conn: &Arc<Connection>, closed_by_error: bool);
}

/// Stream side of a connection.
pub struct TcpIo {
    pub recv: RecvBuffer,
    pub send: SendBuffer,
    keepalive: Option<KeepAlive>,
}

impl TcpIo {
    pub fn keepalive(&self) -> Option<&KeepAlive> {
        self.keepalive.as_ref()
    }
}

/// Datagram side of a connection.
pub struct UdpIo {
    datagram: Mutex<Box<dyn ReliableDatagram>>,
}

impl UdpIo {
    fn lock(&self) -> MutexGuard<'_, Box<dyn ReliableDatagram>> {
        match self.datagram.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn enqueue(&self, frame: Vec<u8>, discardable: bool) -> NetResult<()> {
        self.lock().enqueue(frame, discardable)
    }

    pub fn flush(&self, fd: RawSocket, now_ms: u64) -> Result<bool, i32> {
        self.lock().flush(fd, now_ms)
    }

    pub fn receive(&self, fd: RawSocket, now_ms: u64, out: &mut Vec<Vec<u8>>) -> DatagramRecv {
        self.lock().receive(fd, now_ms, out)
    }

    /// False when the peer went silent or the datagram layer gave up.
    pub fn is_valid(&self, now_ms: u64) -> bool {
        let d = self.lock();
        !d.require_close() && d.is_alive(now_ms)
    }
}

pub enum ConnIo {
    Tcp(TcpIo),
    Udp(UdpIo),
}

/// Receives complete inbound frames before decoding. Returning false
/// closes the connection as an error.
///
/// Frames arrive decrypted in package mode and with their header in stream
/// mode; answers bypass the correlator too.
pub type RawFrameHandler = dyn Fn(&ConnectionInfo, &[u8]) -> bool + Send + Sync;

/// Who to report to and how long connecting may take.
#[derive(Default)]
pub struct ConnectionSetup {
    pub owner: Option<Weak<dyn ConnectionOwner>>,
    pub processor: Option<Arc<dyn QuestProcessor>>,
    pub raw_receiver: Option<Arc<RawFrameHandler>>,
    /// Absolute deadline for a pending connect; ignored once connected.
    pub connect_deadline_ms: u64,
}

pub struct Connection {
    info: Arc<ConnectionInfo>,
    io: ConnIo,
    correlator: Correlator,
    gate: Mutex<EventGate>,
    pins: AtomicUsize,
    socket_connected: AtomicBool,
    io_enabled: AtomicBool,
    connect_deadline_ms: u64,
    owner: Option<Weak<dyn ConnectionOwner>>,
    processor: Option<Arc<dyn QuestProcessor>>,
    raw_receiver: Option<Arc<RawFrameHandler>>,
}

impl Connection {
    /// TCP connection. The reactor ignores it for reading until
    /// [`Connection::enable_io`]; the client closes the buffers with
    /// [`Connection::disable_io`] once encryption is configured.
    pub fn new_tcp(
        info: ConnectionInfo,
        setup: ConnectionSetup,
        max_package_len: usize,
        keepalive: Option<KeepAlive>,
    ) -> Self {
        let tcp = TcpIo {
            recv: RecvBuffer::new(max_package_len),
            send: SendBuffer::new(),
            keepalive,
        };
        Self::with_io(info, setup, ConnIo::Tcp(tcp), false)
    }

    /// UDP connection. Datagram sockets are connected at creation and never
    /// gate their I/O.
    pub fn new_udp(info: ConnectionInfo, setup: ConnectionSetup, datagram: Box<dyn ReliableDatagram>) -> Self {
        let udp = UdpIo {
            datagram: Mutex::new(datagram),
        };
        let conn = Self::with_io(info, setup, ConnIo::Udp(udp), true);
        conn.io_enabled.store(true, Ordering::Release);
        conn
    }

    fn with_io(info: ConnectionInfo, setup: ConnectionSetup, io: ConnIo, connected: bool) -> Self {
        Self {
            info: Arc::new(info),
            io,
            correlator: Correlator::new(),
            gate: Mutex::new(EventGate::new()),
            pins: AtomicUsize::new(0),
            socket_connected: AtomicBool::new(connected),
            io_enabled: AtomicBool::new(false),
            connect_deadline_ms: setup.connect_deadline_ms,
            owner: setup.owner,
            processor: setup.processor,
            raw_receiver: setup.raw_receiver,
        }
    }

    pub fn info(&self) -> &Arc<ConnectionInfo> {
        &self.info
    }

    #[inline]
    pub fn socket(&self) -> RawSocket {
        self.info.socket()
    }

    pub fn token(&self) -> ConnectionToken {
        self.info.token()
    }

    pub fn io(&self) -> &ConnIo {
        &self.io
    }

    pub fn tcp(&self) -> Option<&TcpIo> {
        match &self.io {
            ConnIo::Tcp(t) => Some(t),
            ConnIo::Udp(_) => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpIo> {
        match &self.io {
            ConnIo::Udp(u) => Some(u),
            ConnIo::Tcp(_) => None,
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn gate(&self) -> MutexGuard<'_, EventGate> {
        match self.gate.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// `None` once the owning client is gone.
    pub fn owner(&self) -> Option<Arc<dyn ConnectionOwner>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    pub fn processor(&self) -> Option<&Arc<dyn QuestProcessor>> {
        self.processor.as_ref()
    }

    /// Set when inbound frames skip decoding and dispatch.
    pub fn raw_receiver(&self) -> Option<&Arc<RawFrameHandler>> {
        self.raw_receiver.as_ref()
    }

    pub fn is_socket_connected(&self) -> bool {
        self.socket_connected.load(Ordering::Acquire)
    }

    /// Returns false if it was already marked.
    pub fn mark_socket_connected(&self) -> bool {
        !self.socket_connected.swap(true, Ordering::AcqRel)
    }

    pub fn connect_deadline_ms(&self) -> u64 {
        self.connect_deadline_ms
    }

    pub fn is_io_enabled(&self) -> bool {
        self.io_enabled.load(Ordering::Acquire)
    }

    /// Hold both buffer tokens so nothing moves until the connected event
    /// has run.
    pub fn disable_io(&self) {
        if let ConnIo::Tcp(t) = &self.io {
            t.recv.disable();
            t.send.disable();
        }
        self.io_enabled.store(false, Ordering::Release);
    }

    /// Open the buffers. The caller flushes whatever queued up meanwhile.
    pub fn enable_io(&self) {
        if let ConnIo::Tcp(t) = &self.io {
            t.recv.allow();
            t.send.allow();
        }
        self.io_enabled.store(true, Ordering::Release);
    }

    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Stamp inbound traffic for keepalive.
    pub fn touch_recv(&self, now_ms: u64) {
        if let Some(ka) = self.tcp().and_then(TcpIo::keepalive) {
            ka.touch_recv(now_ms);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        sys::close(self.info.socket());
    }
}

/// RAII pin: keeps the reclaimer away while a thread works on the
/// connection outside the registry lock.
pub struct Pinned {
    conn: Arc<Connection>,
}

impl Pinned {
    pub fn new(conn: Arc<Connection>) -> Self {
        conn.pins.fetch_add(1, Ordering::AcqRel);
        Self { conn }
    }

    pub fn arc(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl std::ops::Deref for Pinned {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        self.conn.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
