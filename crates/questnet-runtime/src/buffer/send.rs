//! Outgoing byte pipeline for one TCP connection.
//!
//! Any thread may enqueue. Only the holder of the send token writes to the
//! socket; a sender that finds the token taken leaves its bytes queued for
//! the holder and returns at once. The queue lock covers a push or a pop,
//! never encryption or a syscall. Buffers are enciphered when popped, so
//! the cipher sees them in exactly the order they hit the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use questnet_core::encryptor::{CipherMode, Encryptor};
use questnet_core::RawSocket;
use questnet_module::sys::{self, would_block};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Another thread holds the token and will write the data.
    Queued,
    /// Everything queued has been written.
    Flushed,
    /// Socket buffer full; write readiness is needed.
    WouldBlock,
}

/// Token-holder state. Only the token holder locks it while writing, so
/// the lock is uncontended on the send path.
struct Writer {
    current: Option<Vec<u8>>,
    offset: usize,
    cipher: Option<(CipherMode, Box<dyn Encryptor>)>,
    encrypt_after_first: bool,
}

pub struct SendBuffer {
    token: AtomicBool,
    queue: Mutex<VecDeque<Vec<u8>>>,
    writer: Mutex<Writer>,
    /// A popped buffer is partly written.
    partial: AtomicBool,
    sent_bytes: AtomicU64,
    sent_packages: AtomicU64,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SendBuffer {
    pub fn new() -> Self {
        Self {
            token: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            writer: Mutex::new(Writer {
                current: None,
                offset: 0,
                cipher: None,
                encrypt_after_first: false,
            }),
            partial: AtomicBool::new(false),
            sent_bytes: AtomicU64::new(0),
            sent_packages: AtomicU64::new(0),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        match self.queue.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn writer(&self) -> MutexGuard<'_, Writer> {
        match self.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get_token(&self) -> bool {
        self.token
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Queue `data` (if any) and write as much as the socket takes.
    ///
    /// `Err(errno)` on a hard socket error; the token is released either way.
    pub fn send(&self, fd: RawSocket, data: Option<Vec<u8>>) -> Result<SendOutcome, i32> {
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            self.queue().push_back(data);
        }
        loop {
            if !self.get_token() {
                return Ok(SendOutcome::Queued);
            }
            let result = self.drain(fd);
            self.token.store(false, Ordering::Release);
            match result {
                Ok(()) => {}
                Err(e) if would_block(e) => return Ok(SendOutcome::WouldBlock),
                Err(e) => return Err(e),
            }
            // Senders that pushed while the token was held returned `Queued`;
            // their bytes must not wait for the next caller.
            if self.queue().is_empty() {
                return Ok(SendOutcome::Flushed);
            }
        }
    }

    /// Write until the queue is empty. Caller holds the token.
    fn drain(&self, fd: RawSocket) -> Result<(), i32> {
        let mut w = self.writer();
        loop {
            if w.current.is_none() {
                let Some(buf) = self.queue().pop_front() else { return Ok(()) };
                let buf = self.prepare(&mut w, buf);
                w.current = Some(buf);
                w.offset = 0;
                self.partial.store(true, Ordering::Release);
            }
            let offset = w.offset;
            let (n, len) = match w.current.as_ref() {
                Some(buf) => (sys::write(fd, &buf[offset..])?, buf.len()),
                None => return Ok(()),
            };
            w.offset += n;
            self.sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
            if w.offset >= len {
                w.current = None;
                w.offset = 0;
                self.partial.store(false, Ordering::Release);
            }
        }
    }

    /// Encipher a popped buffer if due and count it.
    fn prepare(&self, w: &mut Writer, mut buf: Vec<u8>) -> Vec<u8> {
        let due = self.sent_packages.load(Ordering::Relaxed) > 0 || !w.encrypt_after_first;
        if let (Some((mode, enc)), true) = (w.cipher.as_mut(), due) {
            enc.encrypt(&mut buf);
            if *mode == CipherMode::Package {
                let mut framed = Vec::with_capacity(4 + buf.len());
                framed.extend_from_slice(&(buf.len() as u32).to_le_bytes());
                framed.extend_from_slice(&buf);
                buf = framed;
            }
        }
        self.sent_packages.fetch_add(1, Ordering::Relaxed);
        buf
    }

    /// Queue without writing. Used for the key handshake, which must lead
    /// every other frame.
    pub fn append(&self, data: Vec<u8>) {
        if !data.is_empty() {
            self.queue().push_back(data);
        }
    }

    /// Install the outgoing cipher. Fails once bytes have been sent, when a
    /// cipher already exists, or while a writer holds the token.
    pub fn entry_encrypt_mode(&self, mode: CipherMode, encryptor: Box<dyn Encryptor>) -> bool {
        if self.token.load(Ordering::Acquire) || self.sent_bytes.load(Ordering::Acquire) > 0 {
            return false;
        }
        let mut w = self.writer();
        if w.cipher.is_some() {
            return false;
        }
        w.cipher = Some((mode, encryptor));
        true
    }

    /// Send the first package in clear (the handshake).
    pub fn encrypt_after_first_package(&self) {
        self.writer().encrypt_after_first = true;
    }

    /// Let writers in.
    pub fn allow(&self) {
        self.token.store(false, Ordering::Release);
    }

    /// Hold the token so nothing is written until `allow()`.
    pub fn disable(&self) {
        self.token.store(true, Ordering::Release);
    }

    pub fn has_pending(&self) -> bool {
        self.partial.load(Ordering::Acquire) || !self.queue().is_empty()
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn sent_packages(&self) -> u64 {
        self.sent_packages.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use questnet_module::ChaChaSuite;
    use questnet_core::{CipherSuite, KeyMaterial};
    use std::io::Read;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let c = std::net::TcpStream::connect(l.local_addr().unwrap()).unwrap();
        c.set_nonblocking(true).unwrap();
        let (s, _) = l.accept().unwrap();
        (c, s)
    }

    fn material() -> KeyMaterial {
        KeyMaterial {
            key: vec![3; 32],
            iv: vec![5; 16],
        }
    }

    #[test]
    fn test_send_in_order() {
        let (client, mut server) = pair();
        let sb = SendBuffer::new();
        for i in 0..10u8 {
            assert_eq!(sb.send(client.as_raw_fd(), Some(vec![i; 3])).unwrap(), SendOutcome::Flushed);
        }
        let mut got = vec![0u8; 30];
        server.read_exact(&mut got).unwrap();
        let want: Vec<u8> = (0..10u8).flat_map(|i| [i; 3]).collect();
        assert_eq!(got, want);
        assert_eq!(sb.sent_bytes(), 30);
        assert_eq!(sb.sent_packages(), 10);
        assert!(!sb.has_pending());
    }

    #[test]
    fn test_disabled_queues_until_allowed() {
        let (client, mut server) = pair();
        let sb = SendBuffer::new();
        sb.disable();
        assert_eq!(sb.send(client.as_raw_fd(), Some(b"abc".to_vec())).unwrap(), SendOutcome::Queued);
        assert!(sb.has_pending());
        sb.allow();
        assert_eq!(sb.send(client.as_raw_fd(), None).unwrap(), SendOutcome::Flushed);
        let mut got = [0u8; 3];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"abc");
    }

    #[test]
    fn test_would_block_keeps_remainder() {
        let (client, mut server) = pair();
        let sb = SendBuffer::new();
        let big = vec![7u8; 16 * 1024 * 1024];
        let outcome = sb.send(client.as_raw_fd(), Some(big.clone())).unwrap();
        assert_eq!(outcome, SendOutcome::WouldBlock);
        assert!(sb.has_pending());

        let reader = std::thread::spawn(move || {
            let mut got = vec![0u8; 16 * 1024 * 1024];
            server.read_exact(&mut got).unwrap();
            got
        });
        loop {
            match sb.send(client.as_raw_fd(), None).unwrap() {
                SendOutcome::Flushed => break,
                _ => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }
        assert_eq!(reader.join().unwrap(), big);
    }

    #[test]
    fn test_package_encryption_clear_first() {
        let (client, mut server) = pair();
        let sb = SendBuffer::new();
        let enc = ChaChaSuite.create(&material(), CipherMode::Package).unwrap();
        assert!(sb.entry_encrypt_mode(CipherMode::Package, enc));
        sb.encrypt_after_first_package();
        sb.append(b"hello".to_vec());
        sb.send(client.as_raw_fd(), Some(b"secret".to_vec())).unwrap();

        let mut first = [0u8; 5];
        server.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"hello");

        let mut len = [0u8; 4];
        server.read_exact(&mut len).unwrap();
        assert_eq!(u32::from_le_bytes(len), 6);
        let mut body = [0u8; 6];
        server.read_exact(&mut body).unwrap();
        assert_ne!(&body, b"secret");
        let mut dec = ChaChaSuite.create(&material(), CipherMode::Package).unwrap();
        dec.decrypt(&mut body);
        assert_eq!(&body, b"secret");
    }

    #[test]
    fn test_entry_encrypt_mode_rules() {
        let (client, _server) = pair();
        let sb = SendBuffer::new();
        sb.send(client.as_raw_fd(), Some(b"x".to_vec())).unwrap();
        let enc = ChaChaSuite.create(&material(), CipherMode::Stream).unwrap();
        assert!(!sb.entry_encrypt_mode(CipherMode::Stream, enc));

        let fresh = SendBuffer::new();
        fresh.disable();
        let enc = ChaChaSuite.create(&material(), CipherMode::Stream).unwrap();
        assert!(!fresh.entry_encrypt_mode(CipherMode::Stream, enc));
        fresh.allow();
        let enc = ChaChaSuite.create(&material(), CipherMode::Stream).unwrap();
        assert!(fresh.entry_encrypt_mode(CipherMode::Stream, enc));
        let enc = ChaChaSuite.create(&material(), CipherMode::Stream).unwrap();
        assert!(!fresh.entry_encrypt_mode(CipherMode::Stream, enc));
    }

    /// Passes bytes through unchanged, slowly.
    struct SlowCipher(Duration);

    impl Encryptor for SlowCipher {
        fn encrypt(&mut self, _data: &mut [u8]) {
            std::thread::sleep(self.0);
        }

        fn decrypt(&mut self, _data: &mut [u8]) {}
    }

    #[test]
    fn test_concurrent_sender_not_blocked_by_writer() {
        let (client, mut server) = pair();
        let fd = client.as_raw_fd();
        let sb = Arc::new(SendBuffer::new());
        assert!(sb.entry_encrypt_mode(CipherMode::Stream, Box::new(SlowCipher(Duration::from_millis(300)))));

        let writer = {
            let sb = sb.clone();
            std::thread::spawn(move || sb.send(fd, Some(b"first".to_vec())).unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        let outcome = sb.send(fd, Some(b"second".to_vec())).unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
        assert!(start.elapsed() < Duration::from_millis(200), "blocked for {:?}", start.elapsed());

        // The token holder picks up the queued package before returning.
        assert_eq!(writer.join().unwrap(), SendOutcome::Flushed);
        let mut got = [0u8; 11];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"firstsecond");
        assert!(!sb.has_pending());
        assert_eq!(sb.sent_packages(), 2);
    }
}
