//! Per-client output: a fixed inline buffer followed by a queue of chunks.
//!
//! Small replies go to the inline buffer while nothing is queued behind
//! it. Everything else is appended to the chunk queue, coalescing into the
//! tail chunk while it is below the chunk size. Chunks are reference
//! counted so a shared reply can be queued without copying; appending to
//! a shared tail copies it first.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::rc::Rc;

use crate::config::OutputBufferLimit;
use crate::util;

/// Stop writing to one client after this many bytes per event so others
/// get a turn.
pub const MAX_WRITE_PER_EVENT: usize = 64 * 1024;

#[derive(Debug)]
pub struct Reply {
    buf: Vec<u8>,
    buf_cap: usize,
    chunks: VecDeque<Rc<Vec<u8>>>,
    /// Bytes of the front of the output (inline buffer or first chunk)
    /// already written.
    sent: usize,
    /// Bytes held by the chunk queue.
    reply_bytes: usize,
}

impl Reply {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(chunk_bytes),
            buf_cap: chunk_bytes,
            chunks: VecDeque::new(),
            sent: 0,
            reply_bytes: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty() || !self.chunks.is_empty()
    }

    /// Bytes queued in chunks, the figure output limits are checked on.
    pub fn reply_bytes(&self) -> usize {
        self.reply_bytes
    }

    pub fn buf_len(&self) -> usize {
        self.buf.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total bytes not yet written.
    pub fn pending_bytes(&self) -> usize {
        let front = if self.buf.is_empty() { 0 } else { self.buf.len() - self.sent };
        let queued = if self.buf.is_empty() {
            self.reply_bytes - self.sent
        } else {
            self.reply_bytes
        };
        front + queued
    }

    pub fn add(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.chunks.is_empty() && self.buf.len() + bytes.len() <= self.buf_cap {
            self.buf.extend_from_slice(bytes);
            return;
        }
        self.add_to_list(bytes);
    }

    /// Queues a reference-counted payload, sharing it when it cannot be
    /// packed into existing space.
    pub fn add_shared(&mut self, chunk: Rc<Vec<u8>>) {
        if chunk.is_empty() {
            return;
        }
        if self.chunks.is_empty() && self.buf.len() + chunk.len() <= self.buf_cap {
            self.buf.extend_from_slice(&chunk);
            return;
        }
        if self.tail_has_room(chunk.len()) {
            self.add_to_list(&chunk);
            return;
        }
        self.reply_bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    fn tail_has_room(&self, n: usize) -> bool {
        self.chunks
            .back()
            .is_some_and(|tail| tail.len() + n <= self.buf_cap)
    }

    fn add_to_list(&mut self, bytes: &[u8]) {
        self.reply_bytes += bytes.len();
        if self.tail_has_room(bytes.len()) {
            if let Some(tail) = self.chunks.back_mut() {
                Rc::make_mut(tail).extend_from_slice(bytes);
                return;
            }
        }
        self.chunks.push_back(Rc::new(bytes.to_vec()));
    }

    /// Writes pending output until it is drained, the socket would block,
    /// or `MAX_WRITE_PER_EVENT` bytes went out. Returns bytes written.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while self.has_pending() {
            let front: &[u8] = if !self.buf.is_empty() {
                &self.buf[self.sent..]
            } else {
                match self.chunks.front() {
                    Some(chunk) => &chunk[self.sent..],
                    None => break,
                }
            };

            let n = match w.write(front) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "connection closed while writing")),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            let front_len = front.len();
            self.sent += n;
            total += n;

            if n == front_len {
                if !self.buf.is_empty() {
                    self.buf.clear();
                } else if let Some(chunk) = self.chunks.pop_front() {
                    self.reply_bytes -= chunk.len();
                }
                self.sent = 0;
            }
            if total > MAX_WRITE_PER_EVENT {
                break;
            }
        }
        Ok(total)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.chunks.clear();
        self.sent = 0;
        self.reply_bytes = 0;
    }
}

/// Checks queued output against a class limit. The soft limit only trips
/// after being exceeded continuously for `soft_seconds`; `soft_since`
/// records when that started.
pub fn output_limit_reached(
    used: usize,
    limit: &OutputBufferLimit,
    soft_since: &mut Option<u64>,
    now_secs: u64,
) -> bool {
    if limit.hard_bytes > 0 && used >= limit.hard_bytes {
        return true;
    }
    if limit.soft_bytes > 0 && used >= limit.soft_bytes {
        match *soft_since {
            None => {
                *soft_since = Some(now_secs);
                false
            }
            Some(since) => now_secs - since > limit.soft_seconds,
        }
    } else {
        *soft_since = None;
        false
    }
}

pub fn out_nil(out: &mut Reply) {
    out.add(b"$-1\r\n");
}

pub fn out_null_arr(out: &mut Reply) {
    out.add(b"*-1\r\n");
}

pub fn out_ok(out: &mut Reply) {
    out.add(b"+OK\r\n");
}

pub fn out_status(out: &mut Reply, status: &str) {
    out.add(format!("+{status}\r\n").as_bytes());
}

/// Generic error reply, sent with the `ERR` code.
pub fn out_err(out: &mut Reply, msg: &str) {
    out.add(format!("-ERR {msg}\r\n").as_bytes());
}

/// Error reply whose message already starts with its code, such as
/// `WRONGTYPE ...`.
pub fn out_err_code(out: &mut Reply, msg: &str) {
    out.add(format!("-{msg}\r\n").as_bytes());
}

pub fn out_int(out: &mut Reply, val: i64) {
    out.add(format!(":{val}\r\n").as_bytes());
}

pub fn out_bulk(out: &mut Reply, bytes: &[u8]) {
    out.add(format!("${}\r\n", bytes.len()).as_bytes());
    out.add(bytes);
    out.add(b"\r\n");
}

pub fn out_str(out: &mut Reply, s: &str) {
    out_bulk(out, s.as_bytes());
}

/// Doubles are sent as bulk strings.
pub fn out_dbl(out: &mut Reply, val: f64) {
    out_bulk(out, util::format_f64(val).as_bytes());
}

pub fn out_arr(out: &mut Reply, n: usize) {
    out.add(format!("*{n}\r\n").as_bytes());
}
