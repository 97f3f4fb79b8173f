//! Incoming frame assembly for one TCP connection.
//!
//! Reads happen only while holding the receive token. A connection's reads
//! stay disabled (token held) until its connected event has completed.
//!
//! Three receiver modes:
//! - plain: codec header, then the body length it announces, then body;
//! - stream: as plain, each part deciphered right after it is read;
//! - package: 4-byte little-endian length, ciphertext, deciphered at fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use questnet_core::codec::{Codec, Frame};
use questnet_core::encryptor::{CipherMode, Encryptor};
use questnet_core::{kwarn, NetError, NetResult, RawSocket};
use questnet_module::sys::{self, would_block};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// Socket drained, frame incomplete.
    NeedMore,
    /// One whole frame is ready for `fetch()`.
    Complete,
    /// Peer closed the connection.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Head,
    Body,
    Ready,
}

struct Receiver {
    cipher: Option<(CipherMode, Box<dyn Encryptor>)>,
    head: Vec<u8>,
    body: Vec<u8>,
    read: usize,
    stage: Stage,
    received_packages: u64,
    closed: bool,
}

impl Receiver {
    fn mode(&self) -> Option<CipherMode> {
        self.cipher.as_ref().map(|(mode, _)| *mode)
    }

    fn decrypt(&mut self, which: Stage) {
        if let Some((_, dec)) = self.cipher.as_mut() {
            match which {
                Stage::Head => dec.decrypt(&mut self.head),
                _ => dec.decrypt(&mut self.body),
            }
        }
    }

    fn reset(&mut self) {
        self.head.clear();
        self.body.clear();
        self.read = 0;
        self.stage = Stage::Head;
    }

    fn on_head(&mut self, codec: &dyn Codec, max_len: usize) -> NetResult<()> {
        let body_len = match self.mode() {
            Some(CipherMode::Package) => {
                let len = u32::from_le_bytes([self.head[0], self.head[1], self.head[2], self.head[3]]) as usize;
                if len > max_len {
                    return Err(NetError::Codec(format!("package of {} bytes exceeds limit {}", len, max_len)));
                }
                len
            }
            mode => {
                if mode == Some(CipherMode::Stream) {
                    self.decrypt(Stage::Head);
                }
                let len = codec.body_len(&self.head)?;
                if self.head.len() + len > max_len {
                    return Err(NetError::Codec(format!(
                        "package of {} bytes exceeds limit {}",
                        self.head.len() + len,
                        max_len
                    )));
                }
                len
            }
        };
        self.body.resize(body_len, 0);
        self.read = 0;
        self.stage = Stage::Body;
        if body_len == 0 {
            self.on_body();
        }
        Ok(())
    }

    fn on_body(&mut self) {
        if self.mode() == Some(CipherMode::Stream) {
            self.decrypt(Stage::Body);
        }
        self.stage = Stage::Ready;
    }
}

pub struct RecvBuffer {
    token: AtomicBool,
    inner: Mutex<Receiver>,
    max_package_len: usize,
}

impl RecvBuffer {
    pub fn new(max_package_len: usize) -> Self {
        Self {
            token: AtomicBool::new(false),
            inner: Mutex::new(Receiver {
                cipher: None,
                head: Vec::new(),
                body: Vec::new(),
                read: 0,
                stage: Stage::Head,
                received_packages: 0,
                closed: false,
            }),
            max_package_len,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Receiver> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_token(&self) -> bool {
        self.token
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn return_token(&self) {
        self.token.store(false, Ordering::Release);
    }

    pub fn allow(&self) {
        self.token.store(false, Ordering::Release);
    }

    pub fn disable(&self) {
        self.token.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn received_packages(&self) -> u64 {
        self.lock().received_packages
    }

    /// Read until one frame is complete or the socket is drained.
    /// Caller must hold the token.
    pub fn recv_package(&self, fd: RawSocket, codec: &dyn Codec) -> NetResult<RecvStatus> {
        let mut rx = self.lock();
        loop {
            let stage = rx.stage;
            if stage == Stage::Ready {
                return Ok(RecvStatus::Complete);
            }
            if stage == Stage::Head && rx.read == 0 && rx.head.is_empty() {
                let head_len = match rx.mode() {
                    Some(CipherMode::Package) => 4,
                    _ => codec.header_len(),
                };
                rx.head.resize(head_len, 0);
            }

            let receiver = &mut *rx;
            let offset = receiver.read;
            let target = match stage {
                Stage::Head => &mut receiver.head[offset..],
                _ => &mut receiver.body[offset..],
            };
            match sys::read(fd, target) {
                Ok(0) => {
                    if stage != Stage::Head || rx.read > 0 {
                        kwarn!("fd {} closed in the middle of a frame", fd);
                    }
                    rx.closed = true;
                    return Ok(RecvStatus::Closed);
                }
                Ok(n) => {
                    rx.read += n;
                    let done = match stage {
                        Stage::Head => rx.read == rx.head.len(),
                        _ => rx.read == rx.body.len(),
                    };
                    if done {
                        if stage == Stage::Head {
                            rx.on_head(codec, self.max_package_len)?;
                        } else {
                            rx.on_body();
                        }
                    }
                }
                Err(e) if would_block(e) => return Ok(RecvStatus::NeedMore),
                Err(e) => return Err(NetError::Os(e)),
            }
        }
    }

    /// Decode the completed frame and start the next one.
    pub fn fetch(&self, codec: &dyn Codec) -> NetResult<Frame> {
        let frame = self.fetch_raw()?;
        codec.decode(&frame)
    }

    /// Take the completed frame's bytes undecoded: decrypted in package
    /// mode, header included otherwise.
    pub fn fetch_raw(&self) -> NetResult<Vec<u8>> {
        let mut rx = self.lock();
        if rx.stage != Stage::Ready {
            return Err(NetError::Codec("no complete frame".into()));
        }
        let frame = match rx.mode() {
            Some(CipherMode::Package) => {
                rx.decrypt(Stage::Body);
                std::mem::take(&mut rx.body)
            }
            _ => {
                let mut bytes = std::mem::take(&mut rx.head);
                bytes.append(&mut rx.body);
                bytes
            }
        };
        rx.reset();
        rx.received_packages += 1;
        Ok(frame)
    }

    /// Install the incoming cipher. Fails after more than one package was
    /// received, when a cipher exists, or in the middle of a frame.
    pub fn entry_encrypt_mode(&self, mode: CipherMode, decryptor: Box<dyn Encryptor>) -> bool {
        let mut rx = self.lock();
        if rx.received_packages > 1 || rx.cipher.is_some() || rx.read > 0 || rx.stage != Stage::Head {
            return false;
        }
        rx.head.clear();
        rx.cipher = Some((mode, decryptor));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use questnet_core::{Answer, CipherSuite, KeyMaterial, Quest};
    use questnet_module::{BinaryCodec, ChaChaSuite};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    fn pair() -> (TcpStream, TcpStream) {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let c = TcpStream::connect(l.local_addr().unwrap()).unwrap();
        c.set_nonblocking(true).unwrap();
        let (s, _) = l.accept().unwrap();
        (c, s)
    }

    fn material() -> KeyMaterial {
        KeyMaterial {
            key: vec![11; 32],
            iv: vec![13; 16],
        }
    }

    /// Poll recv_package until it reports something other than NeedMore.
    fn recv_until(rb: &RecvBuffer, fd: RawSocket, codec: &BinaryCodec) -> RecvStatus {
        for _ in 0..500 {
            match rb.recv_package(fd, codec).unwrap() {
                RecvStatus::NeedMore => std::thread::sleep(Duration::from_millis(2)),
                other => return other,
            }
        }
        panic!("no frame");
    }

    #[test]
    fn test_plain_frames_split_writes() {
        let (client, mut server) = pair();
        let codec = BinaryCodec::new();
        let rb = RecvBuffer::new(1024);
        let a = Answer::ok(41, b"payload".to_vec());
        let q = Quest::from_parts("push".into(), 42, false, vec![1, 2, 3]);
        let mut bytes = codec.encode_answer(&a).unwrap();
        bytes.extend(codec.encode_quest(&q).unwrap());

        server.write_all(&bytes[..5]).unwrap();
        assert!(rb.get_token());
        assert_eq!(rb.recv_package(client.as_raw_fd(), &codec).unwrap(), RecvStatus::NeedMore);
        server.write_all(&bytes[5..]).unwrap();

        assert_eq!(recv_until(&rb, client.as_raw_fd(), &codec), RecvStatus::Complete);
        assert_eq!(rb.fetch(&codec).unwrap(), Frame::Answer(a));
        assert_eq!(recv_until(&rb, client.as_raw_fd(), &codec), RecvStatus::Complete);
        assert_eq!(rb.fetch(&codec).unwrap(), Frame::Quest(q));
        assert_eq!(rb.received_packages(), 2);
        rb.return_token();
    }

    #[test]
    fn test_oversize_frame_is_error() {
        let (client, mut server) = pair();
        let codec = BinaryCodec::new();
        let rb = RecvBuffer::new(64);
        let bytes = codec.encode_answer(&Answer::ok(1, vec![0; 100])).unwrap();
        server.write_all(&bytes).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(rb.recv_package(client.as_raw_fd(), &codec), Err(NetError::Codec(_))));
    }

    #[test]
    fn test_closed_by_peer() {
        let (client, server) = pair();
        let codec = BinaryCodec::new();
        let rb = RecvBuffer::new(1024);
        drop(server);
        assert_eq!(recv_until(&rb, client.as_raw_fd(), &codec), RecvStatus::Closed);
        assert!(rb.is_closed());
    }

    #[test]
    fn test_stream_mode() {
        let (client, mut server) = pair();
        let codec = BinaryCodec::new();
        let rb = RecvBuffer::new(1024);
        let dec = ChaChaSuite.create(&material(), CipherMode::Stream).unwrap();
        assert!(rb.entry_encrypt_mode(CipherMode::Stream, dec));

        let mut enc = ChaChaSuite.create(&material(), CipherMode::Stream).unwrap();
        let a1 = Answer::ok(1, b"one".to_vec());
        let a2 = Answer::ok(2, b"two".to_vec());
        let mut wire = codec.encode_answer(&a1).unwrap();
        wire.extend(codec.encode_answer(&a2).unwrap());
        enc.encrypt(&mut wire);
        server.write_all(&wire).unwrap();

        assert_eq!(recv_until(&rb, client.as_raw_fd(), &codec), RecvStatus::Complete);
        assert_eq!(rb.fetch(&codec).unwrap(), Frame::Answer(a1));
        assert_eq!(recv_until(&rb, client.as_raw_fd(), &codec), RecvStatus::Complete);
        assert_eq!(rb.fetch(&codec).unwrap(), Frame::Answer(a2));
    }

    #[test]
    fn test_package_mode() {
        let (client, mut server) = pair();
        let codec = BinaryCodec::new();
        let rb = RecvBuffer::new(1024);
        let dec = ChaChaSuite.create(&material(), CipherMode::Package).unwrap();
        assert!(rb.entry_encrypt_mode(CipherMode::Package, dec));

        let mut enc = ChaChaSuite.create(&material(), CipherMode::Package).unwrap();
        let a = Answer::error(5, questnet_core::ErrorCode::Timeout, "late");
        let mut cipher = codec.encode_answer(&a).unwrap();
        enc.encrypt(&mut cipher);
        let mut wire = (cipher.len() as u32).to_le_bytes().to_vec();
        wire.extend(cipher);
        server.write_all(&wire).unwrap();

        assert_eq!(recv_until(&rb, client.as_raw_fd(), &codec), RecvStatus::Complete);
        assert_eq!(rb.fetch(&codec).unwrap(), Frame::Answer(a));
    }

    #[test]
    fn test_fetch_raw_returns_plaintext_frame() {
        let (client, mut server) = pair();
        let codec = BinaryCodec::new();
        let rb = RecvBuffer::new(1024);
        let dec = ChaChaSuite.create(&material(), CipherMode::Package).unwrap();
        assert!(rb.entry_encrypt_mode(CipherMode::Package, dec));

        let mut enc = ChaChaSuite.create(&material(), CipherMode::Package).unwrap();
        let plain = codec.encode_quest(&Quest::one_way("push", b"raw".to_vec())).unwrap();
        let mut cipher = plain.clone();
        enc.encrypt(&mut cipher);
        let mut wire = (cipher.len() as u32).to_le_bytes().to_vec();
        wire.extend(cipher);
        server.write_all(&wire).unwrap();

        assert_eq!(recv_until(&rb, client.as_raw_fd(), &codec), RecvStatus::Complete);
        assert_eq!(rb.fetch_raw().unwrap(), plain);
        assert_eq!(rb.received_packages(), 1);
        assert!(rb.fetch_raw().is_err());
    }

    #[test]
    fn test_entry_encrypt_mode_after_traffic() {
        let (client, mut server) = pair();
        let codec = BinaryCodec::new();
        let rb = RecvBuffer::new(1024);
        for seq in 0..2 {
            server.write_all(&codec.encode_answer(&Answer::ok(seq, vec![])).unwrap()).unwrap();
            assert_eq!(recv_until(&rb, client.as_raw_fd(), &codec), RecvStatus::Complete);
            rb.fetch(&codec).unwrap();
        }
        let dec = ChaChaSuite.create(&material(), CipherMode::Package).unwrap();
        assert!(!rb.entry_encrypt_mode(CipherMode::Package, dec));
    }

    #[test]
    fn test_token() {
        let rb = RecvBuffer::new(16);
        rb.disable();
        assert!(!rb.get_token());
        rb.allow();
        assert!(rb.get_token());
        assert!(!rb.get_token());
        rb.return_token();
        assert!(rb.get_token());
    }
}
