//! Loopback peers for tests and the smoke binary.
//!
//! Blocking std sockets, one thread per connection, frames through
//! `BinaryCodec`. Not a server library: just enough of the other side to
//! drive a client through every path.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use questnet_core::{
    kdebug, Answer, CipherMode, Codec, Encryptor, ErrorCode, Frame, KeyHandshake, KeyMaterial, NetError, NetResult,
    Quest, KEY_METHOD, PING_METHOD,
};
use questnet_module::{BinaryCodec, ChaChaEncryptor};

use crate::client::ClientCore;

type AnswerFn = dyn Fn(&Quest) -> Option<Answer> + Send + Sync;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct LoopbackPeerBuilder {
    material: Option<KeyMaterial>,
    reject_keys: bool,
    ignore_pings: bool,
}

impl LoopbackPeerBuilder {
    /// Accept a `*key` quest as the first frame and encrypt with this
    /// material afterwards.
    pub fn encrypted(mut self, key: Vec<u8>, iv: Vec<u8>) -> Self {
        self.material = Some(KeyMaterial { key, iv });
        self
    }

    /// Answer `*key` with an error.
    pub fn reject_keys(mut self) -> Self {
        self.reject_keys = true;
        self
    }

    /// Count pings but never answer them.
    pub fn ignore_pings(mut self) -> Self {
        self.ignore_pings = true;
        self
    }

    /// Bind `127.0.0.1:0` and start accepting. `answer` runs for every
    /// two-way application quest; `None` leaves it unanswered.
    pub fn spawn<F>(self, answer: F) -> NetResult<LoopbackPeer>
    where
        F: Fn(&Quest) -> Option<Answer> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").map_err(|e| NetError::Os(e.raw_os_error().unwrap_or(0)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| NetError::Os(e.raw_os_error().unwrap_or(0)))?;
        let addr = listener.local_addr().map_err(|e| NetError::Os(e.raw_os_error().unwrap_or(0)))?;

        let shared = Arc::new(PeerShared {
            answer: Box::new(answer),
            material: self.material,
            reject_keys: self.reject_keys,
            ignore_pings: self.ignore_pings,
            received: Mutex::new(Vec::new()),
            keys: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
            conns: Mutex::new(Vec::new()),
            pushed: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
        });
        let accept_shared = shared.clone();
        let accept = thread::Builder::new()
            .name("qnet-peer-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))
            .map_err(|e| NetError::Os(e.raw_os_error().unwrap_or(0)))?;

        Ok(LoopbackPeer {
            addr,
            shared,
            accept: Some(accept),
        })
    }
}

struct PeerShared {
    answer: Box<AnswerFn>,
    material: Option<KeyMaterial>,
    reject_keys: bool,
    ignore_pings: bool,
    received: Mutex<Vec<Quest>>,
    keys: Mutex<Vec<KeyHandshake>>,
    pings: AtomicUsize,
    conns: Mutex<Vec<Arc<PeerConn>>>,
    pushed: Mutex<HashMap<u32, mpsc::Sender<Answer>>>,
    stop: AtomicBool,
}

/// Write side of one accepted connection.
struct PeerConn {
    stream: TcpStream,
    cipher: Mutex<Option<(CipherMode, ChaChaEncryptor)>>,
}

impl PeerConn {
    fn write_frame(&self, mut bytes: Vec<u8>) -> std::io::Result<()> {
        let mut cipher = lock(&self.cipher);
        if let Some((mode, enc)) = cipher.as_mut() {
            enc.encrypt(&mut bytes);
            if *mode == CipherMode::Package {
                let mut framed = (bytes.len() as u32).to_le_bytes().to_vec();
                framed.extend_from_slice(&bytes);
                bytes = framed;
            }
        }
        (&self.stream).write_all(&bytes)
    }
}

/// TCP peer answering quests through a closure.
pub struct LoopbackPeer {
    addr: SocketAddr,
    shared: Arc<PeerShared>,
    accept: Option<JoinHandle<()>>,
}

impl LoopbackPeer {
    pub fn builder() -> LoopbackPeerBuilder {
        LoopbackPeerBuilder::default()
    }

    pub fn spawn<F>(answer: F) -> NetResult<Self>
    where
        F: Fn(&Quest) -> Option<Answer> + Send + Sync + 'static,
    {
        Self::builder().spawn(answer)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Application quests received so far, in arrival order.
    pub fn received(&self) -> Vec<Quest> {
        lock(&self.shared.received).clone()
    }

    pub fn key_handshakes(&self) -> Vec<KeyHandshake> {
        lock(&self.shared.keys).clone()
    }

    pub fn pings(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        lock(&self.shared.conns).len()
    }

    /// Send a quest to the most recent client and wait for its answer.
    /// One-way quests return `None` right after sending.
    pub fn push(&self, quest: Quest, timeout: Duration) -> Option<Answer> {
        let conn = lock(&self.shared.conns).last().cloned()?;
        let rx = if quest.is_two_way() {
            let (tx, rx) = mpsc::channel();
            lock(&self.shared.pushed).insert(quest.seq(), tx);
            Some(rx)
        } else {
            None
        };
        let bytes = BinaryCodec::new().encode_quest(&quest).ok()?;
        conn.write_frame(bytes).ok()?;
        rx?.recv_timeout(timeout).ok()
    }

    /// Drop every accepted connection.
    pub fn close_all(&self) {
        let conns = std::mem::take(&mut *lock(&self.shared.conns));
        for conn in conns {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.close_all();
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<PeerShared>) {
    while !shared.stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let _ = stream.set_nodelay(true);
                let (reader, writer) = match stream.try_clone() {
                    Ok(w) => (stream, w),
                    Err(_) => continue,
                };
                let conn = Arc::new(PeerConn {
                    stream: writer,
                    cipher: Mutex::new(None),
                });
                lock(&shared.conns).push(conn.clone());
                let conn_shared = shared.clone();
                let _ = thread::Builder::new()
                    .name("qnet-peer-conn".into())
                    .spawn(move || serve(reader, conn, conn_shared));
            }
            Err(_) => thread::sleep(Duration::from_millis(5)),
        }
    }
}

fn serve(mut reader: TcpStream, conn: Arc<PeerConn>, shared: Arc<PeerShared>) {
    let codec = BinaryCodec::new();
    let mut decryptor: Option<(CipherMode, ChaChaEncryptor)> = None;
    loop {
        let frames = match read_unit(&mut reader, &codec, &mut decryptor) {
            Ok(frames) => frames,
            Err(_) => break,
        };
        for frame in frames {
            if handle(&codec, &conn, &shared, &mut decryptor, frame).is_err() {
                return;
            }
        }
    }
    kdebug!("loopback peer connection ended");
}

/// Read one frame, or one package's worth of frames.
fn read_unit(
    reader: &mut TcpStream,
    codec: &BinaryCodec,
    decryptor: &mut Option<(CipherMode, ChaChaEncryptor)>,
) -> std::io::Result<Vec<Frame>> {
    let bad = |e: NetError| std::io::Error::new(ErrorKind::InvalidData, e.to_string());
    match decryptor {
        Some((CipherMode::Package, dec)) => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            let mut package = vec![0u8; u32::from_le_bytes(len) as usize];
            reader.read_exact(&mut package)?;
            dec.decrypt(&mut package);
            let mut frames = Vec::new();
            let mut at = 0;
            while at < package.len() {
                let end = at + codec.header_len() + codec.body_len(&package[at..]).map_err(bad)?;
                if end > package.len() {
                    return Err(bad(NetError::Codec("truncated package".into())));
                }
                frames.push(codec.decode(&package[at..end]).map_err(bad)?);
                at = end;
            }
            Ok(frames)
        }
        other => {
            let mut frame = vec![0u8; codec.header_len()];
            reader.read_exact(&mut frame)?;
            if let Some((_, dec)) = other.as_mut() {
                dec.decrypt(&mut frame);
            }
            let mut body = vec![0u8; codec.body_len(&frame).map_err(bad)?];
            reader.read_exact(&mut body)?;
            if let Some((_, dec)) = other.as_mut() {
                dec.decrypt(&mut body);
            }
            frame.extend_from_slice(&body);
            Ok(vec![codec.decode(&frame).map_err(bad)?])
        }
    }
}

fn handle(
    codec: &BinaryCodec,
    conn: &PeerConn,
    shared: &PeerShared,
    decryptor: &mut Option<(CipherMode, ChaChaEncryptor)>,
    frame: Frame,
) -> std::io::Result<()> {
    let quest = match frame {
        Frame::Answer(answer) => {
            if let Some(tx) = lock(&shared.pushed).remove(&answer.seq()) {
                let _ = tx.send(answer);
            }
            return Ok(());
        }
        Frame::Quest(q) => q,
    };

    let answer = if quest.method() == KEY_METHOD && decryptor.is_none() {
        let Some(material) = shared.material.as_ref() else {
            return Err(std::io::Error::new(ErrorKind::InvalidData, "unexpected key quest"));
        };
        let key = KeyHandshake::decode(quest.payload())
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        let mode = key.mode();
        lock(&shared.keys).push(key);
        let cipher = |m: &KeyMaterial| {
            ChaChaEncryptor::new(m, mode).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))
        };
        *decryptor = Some((mode, cipher(material)?));
        *lock(&conn.cipher) = Some((mode, cipher(material)?));
        if shared.reject_keys {
            Some(Answer::error_for(&quest, ErrorCode::InvalidConnection, "key rejected"))
        } else {
            Some(Answer::for_quest(&quest, Vec::new()))
        }
    } else if quest.method() == PING_METHOD {
        shared.pings.fetch_add(1, Ordering::SeqCst);
        if shared.ignore_pings {
            None
        } else {
            Some(Answer::for_quest(&quest, Vec::new()))
        }
    } else {
        lock(&shared.received).push(quest.clone());
        if quest.is_two_way() {
            (shared.answer)(&quest)
        } else {
            None
        }
    };

    match answer {
        Some(answer) => {
            let bytes = codec
                .encode_answer(&answer)
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
            conn.write_frame(bytes)
        }
        None => Ok(()),
    }
}

/// UDP peer: one frame per datagram, answers sent back to the source.
pub struct LoopbackDatagramPeer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Quest>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LoopbackDatagramPeer {
    pub fn spawn<F>(answer: F) -> NetResult<Self>
    where
        F: Fn(&Quest) -> Option<Answer> + Send + Sync + 'static,
    {
        let os = |e: std::io::Error| NetError::Os(e.raw_os_error().unwrap_or(0));
        let socket = UdpSocket::bind("127.0.0.1:0").map_err(os)?;
        socket.set_read_timeout(Some(Duration::from_millis(20))).map_err(os)?;
        let addr = socket.local_addr().map_err(os)?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let (rec, flag) = (received.clone(), stop.clone());
        let handle = thread::Builder::new()
            .name("qnet-peer-udp".into())
            .spawn(move || {
                let codec = BinaryCodec::new();
                let mut buf = vec![0u8; 65_536];
                while !flag.load(Ordering::Acquire) {
                    let (n, from) = match socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    if n == 0 {
                        // Heartbeat; return the favour.
                        let _ = socket.send_to(&[], from);
                        continue;
                    }
                    let quest = match codec.decode(&buf[..n]) {
                        Ok(Frame::Quest(q)) => q,
                        _ => continue,
                    };
                    lock(&rec).push(quest.clone());
                    let reply = match quest.method() {
                        PING_METHOD => Some(Answer::for_quest(&quest, Vec::new())),
                        _ if quest.is_two_way() => answer(&quest),
                        _ => None,
                    };
                    if let Some(bytes) = reply.and_then(|a| codec.encode_answer(&a).ok()) {
                        let _ = socket.send_to(&bytes, from);
                    }
                }
            })
            .map_err(os)?;

        Ok(Self {
            addr,
            received,
            stop,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn received(&self) -> Vec<Quest> {
        lock(&self.received).clone()
    }
}

impl Drop for LoopbackDatagramPeer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Far end of a connect that never completes.
///
/// The client is handed a socket whose send buffer is already full, so
/// write readiness (which is what finishes a connect) never arrives while
/// this value is alive.
pub struct StalledConnect {
    _peer: UnixStream,
}

/// Put `client` into `Connecting` on a socket that stays pending.
pub fn stall_connect(client: &ClientCore) -> NetResult<StalledConnect> {
    let os = |e: std::io::Error| NetError::Os(e.raw_os_error().unwrap_or(0));
    let (held, peer) = UnixStream::pair().map_err(os)?;
    held.set_nonblocking(true).map_err(os)?;
    let chunk = [0u8; 64 * 1024];
    loop {
        match (&held).write(&chunk) {
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(os(e)),
        }
    }
    if !client.adopt_connecting(held.into_raw_fd()) {
        return Err(NetError::Code(ErrorCode::InvalidConnection));
    }
    Ok(StalledConnect { _peer: peer })
}
