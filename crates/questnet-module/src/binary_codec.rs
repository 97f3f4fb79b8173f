//! `BinaryCodec` - default `Codec` implementation.
//!
//! Header (12 bytes, little-endian):
//!
//! ```text
//!  0      2    3      4          8          12
//!  +------+----+------+----------+----------+
//!  | "QN" | v1 | flag | body len |   seq    |
//!  +------+----+------+----------+----------+
//! ```
//!
//! Flags: bit 0 request, bit 1 two-way, bit 2 error answer.
//! Quest body: method length (u8), method bytes, payload.
//! Answer body: payload, or for error answers code (u32) then message.

use questnet_core::codec::{Answer, AnswerStatus, Codec, Frame, Quest};
use questnet_core::{NetError, NetResult};

pub const HEADER_LEN: usize = 12;
const MAGIC: [u8; 2] = *b"QN";
const VERSION: u8 = 1;

const FLAG_REQUEST: u8 = 0x01;
const FLAG_TWO_WAY: u8 = 0x02;
const FLAG_ERROR: u8 = 0x04;

#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl BinaryCodec {
    pub fn new() -> Self {
        BinaryCodec
    }

    fn check_header(header: &[u8]) -> NetResult<()> {
        if header.len() < HEADER_LEN {
            return Err(NetError::Codec(format!("short header: {} bytes", header.len())));
        }
        if header[0..2] != MAGIC {
            return Err(NetError::Codec(format!(
                "bad magic {:02x}{:02x}",
                header[0], header[1]
            )));
        }
        if header[2] != VERSION {
            return Err(NetError::Codec(format!("unsupported version {}", header[2])));
        }
        Ok(())
    }

    fn frame(flags: u8, seq: u32, body_len: usize) -> NetResult<Vec<u8>> {
        let len = u32::try_from(body_len)
            .map_err(|_| NetError::Codec(format!("body too large: {} bytes", body_len)))?;
        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.push(flags);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&seq.to_le_bytes());
        Ok(out)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl Codec for BinaryCodec {
    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn body_len(&self, header: &[u8]) -> NetResult<usize> {
        Self::check_header(header)?;
        Ok(read_u32(header, 4) as usize)
    }

    fn is_request(&self, header: &[u8]) -> bool {
        header.len() > 3 && header[3] & FLAG_REQUEST != 0
    }

    fn encode_quest(&self, quest: &Quest) -> NetResult<Vec<u8>> {
        let method = quest.method().as_bytes();
        if method.is_empty() || method.len() > u8::MAX as usize {
            return Err(NetError::Codec(format!(
                "method name length {} out of range",
                method.len()
            )));
        }
        let mut flags = FLAG_REQUEST;
        if quest.is_two_way() {
            flags |= FLAG_TWO_WAY;
        }
        let body_len = 1 + method.len() + quest.payload().len();
        let mut out = Self::frame(flags, quest.seq(), body_len)?;
        out.push(method.len() as u8);
        out.extend_from_slice(method);
        out.extend_from_slice(quest.payload());
        Ok(out)
    }

    fn encode_answer(&self, answer: &Answer) -> NetResult<Vec<u8>> {
        match answer.status() {
            AnswerStatus::Ok => {
                let mut out = Self::frame(0, answer.seq(), answer.payload().len())?;
                out.extend_from_slice(answer.payload());
                Ok(out)
            }
            AnswerStatus::Error { code, ex } => {
                let mut out = Self::frame(FLAG_ERROR, answer.seq(), 4 + ex.len())?;
                out.extend_from_slice(&code.to_le_bytes());
                out.extend_from_slice(ex.as_bytes());
                Ok(out)
            }
        }
    }

    fn decode(&self, frame: &[u8]) -> NetResult<Frame> {
        let body_len = self.body_len(frame)?;
        if frame.len() != HEADER_LEN + body_len {
            return Err(NetError::Codec(format!(
                "frame length {} does not match header ({} + {})",
                frame.len(),
                HEADER_LEN,
                body_len
            )));
        }
        let flags = frame[3];
        let seq = read_u32(frame, 8);
        let body = &frame[HEADER_LEN..];

        if flags & FLAG_REQUEST != 0 {
            let method_len = *body
                .first()
                .ok_or_else(|| NetError::Codec("quest without method".into()))?
                as usize;
            if body.len() < 1 + method_len || method_len == 0 {
                return Err(NetError::Codec("truncated method name".into()));
            }
            let method = std::str::from_utf8(&body[1..1 + method_len])
                .map_err(|_| NetError::Codec("method name is not utf-8".into()))?;
            return Ok(Frame::Quest(Quest::from_parts(
                method.to_string(),
                seq,
                flags & FLAG_TWO_WAY != 0,
                body[1 + method_len..].to_vec(),
            )));
        }

        if flags & FLAG_ERROR != 0 {
            if body.len() < 4 {
                return Err(NetError::Codec("truncated error answer".into()));
            }
            let code = read_u32(body, 0);
            let ex = String::from_utf8_lossy(&body[4..]).into_owned();
            return Ok(Frame::Answer(Answer::error_raw(seq, code, ex)));
        }

        Ok(Frame::Answer(Answer::ok(seq, body.to_vec())))
    }
}
