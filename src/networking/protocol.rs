//! Incremental request parser for inline and multibulk commands.
//!
//! A [`RequestParser`] is fed the client's query buffer after every read.
//! It consumes complete pieces from the front of the buffer and keeps the
//! rest of its progress (remaining argument count, awaited bulk length) in
//! its own fields, so a request split over any number of reads is parsed
//! exactly once.

use crate::error::ProtocolError;
use crate::util::string2ll;

use super::buffer::Buffer;

/// Largest accepted multibulk argument count.
pub const MAX_MULTIBULK_LEN: i64 = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    /// Longest inline request, and longest unterminated header line.
    pub inline_max: usize,
    /// Bulk arguments at least this long are read into their own buffer.
    pub mbulk_big_arg: usize,
    pub proto_max_bulk_len: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            inline_max: 64 * 1024,
            mbulk_big_arg: 32 * 1024,
            proto_max_bulk_len: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Inline,
    Multibulk,
}

#[derive(Debug)]
pub struct RequestParser {
    req_type: Option<RequestType>,
    /// Arguments still expected in the current multibulk request.
    multibulk_len: i64,
    /// Length of the bulk being awaited, -1 before its header is read.
    bulk_len: i64,
    argv: Vec<Vec<u8>>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            req_type: None,
            multibulk_len: 0,
            bulk_len: -1,
            argv: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.req_type = None;
        self.multibulk_len = 0;
        self.bulk_len = -1;
        self.argv = Vec::new();
    }

    pub fn request_type(&self) -> Option<RequestType> {
        self.req_type
    }

    /// True while a request has been partially consumed.
    pub fn in_progress(&self) -> bool {
        self.req_type.is_some()
    }

    /// When a big bulk argument is being received, the number of bytes
    /// still missing from it (payload plus CRLF). Reads are capped to this
    /// so the buffer ends up holding exactly the argument.
    pub fn pending_big_bulk(&self, buffered: usize, limits: &ParseLimits) -> Option<usize> {
        if self.req_type == Some(RequestType::Multibulk) && self.bulk_len >= limits.mbulk_big_arg as i64 {
            let want = self.bulk_len as usize + 2;
            if want > buffered {
                return Some(want - buffered);
            }
        }
        None
    }

    /// Parses the next complete request from `buf`. Returns `Ok(None)`
    /// when more input is needed. An empty argument vector means a blank
    /// request that should be ignored.
    pub fn parse(&mut self, buf: &mut Buffer, limits: &ParseLimits) -> Result<Option<Vec<Vec<u8>>>, ProtocolError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let req_type = match self.req_type {
            Some(t) => t,
            None => {
                let t = if buf.data()[0] == b'*' {
                    RequestType::Multibulk
                } else {
                    RequestType::Inline
                };
                self.req_type = Some(t);
                t
            }
        };

        let parsed = match req_type {
            RequestType::Inline => self.parse_inline(buf, limits),
            RequestType::Multibulk => self.parse_multibulk(buf, limits),
        }?;
        if parsed.is_some() {
            self.req_type = None;
            self.multibulk_len = 0;
            self.bulk_len = -1;
        }
        Ok(parsed)
    }

    fn parse_inline(&mut self, buf: &mut Buffer, limits: &ParseLimits) -> Result<Option<Vec<Vec<u8>>>, ProtocolError> {
        let data = buf.data();
        let Some(nl) = memchr(b'\n', data) else {
            if data.len() > limits.inline_max {
                return Err(ProtocolError::InlineTooBig);
            }
            return Ok(None);
        };

        let mut line = &data[..nl];
        if let [rest @ .., b'\r'] = line {
            line = rest;
        }
        let argv = split_args(line).ok_or(ProtocolError::UnbalancedQuotes)?;
        buf.consume(nl + 1);
        Ok(Some(argv))
    }

    fn parse_multibulk(&mut self, buf: &mut Buffer, limits: &ParseLimits) -> Result<Option<Vec<Vec<u8>>>, ProtocolError> {
        let mut pos = 0;

        if self.multibulk_len == 0 {
            let data = buf.data();
            let Some(cr) = memchr(b'\r', data) else {
                if data.len() > limits.inline_max {
                    return Err(ProtocolError::BigMultibulkCount);
                }
                return Ok(None);
            };
            // The header is complete only once its '\n' arrived too.
            if cr + 1 >= data.len() {
                return Ok(None);
            }
            let count = match string2ll(&data[1..cr]) {
                Some(n) if n <= MAX_MULTIBULK_LEN => n,
                _ => return Err(ProtocolError::InvalidMultibulkLength),
            };
            pos = cr + 2;
            if count <= 0 {
                buf.consume(pos);
                return Ok(Some(Vec::new()));
            }
            self.multibulk_len = count;
            self.argv = Vec::with_capacity(count as usize);
        }

        while self.multibulk_len > 0 {
            if self.bulk_len == -1 {
                let data = &buf.data()[pos..];
                let Some(cr) = memchr(b'\r', data) else {
                    if data.len() > limits.inline_max {
                        return Err(ProtocolError::BigBulkCount);
                    }
                    break;
                };
                if cr + 1 >= data.len() {
                    break;
                }
                if data[0] != b'$' {
                    return Err(ProtocolError::ExpectedDollar(data[0] as char));
                }
                let len = match string2ll(&data[1..cr]) {
                    Some(n) if n >= 0 && n as u64 <= limits.proto_max_bulk_len as u64 => n,
                    _ => return Err(ProtocolError::InvalidBulkLength),
                };
                pos += cr + 2;

                if len as usize >= limits.mbulk_big_arg {
                    // Start the argument at the front of the buffer so it
                    // can be handed over whole once it arrived.
                    buf.consume(pos);
                    pos = 0;
                    buf.compact();
                    let want = len as usize + 2;
                    if buf.len() < want {
                        buf.reserve(want - buf.len());
                    }
                }
                self.bulk_len = len;
            }

            let need = self.bulk_len as usize + 2;
            if buf.len() - pos < need {
                break;
            }

            let big = pos == 0 && self.bulk_len as usize >= limits.mbulk_big_arg;
            let stolen = if big { buf.steal_exact(need) } else { None };
            match stolen {
                Some(mut arg) => {
                    arg.truncate(need - 2);
                    self.argv.push(arg);
                }
                None => {
                    let data = buf.data();
                    self.argv.push(data[pos..pos + need - 2].to_vec());
                    pos += need;
                }
            }
            self.bulk_len = -1;
            self.multibulk_len -= 1;
        }

        if pos > 0 {
            buf.consume(pos);
        }
        if self.multibulk_len == 0 {
            return Ok(Some(std::mem::take(&mut self.argv)));
        }
        Ok(None)
    }
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Splits an inline request into arguments. Supports double quotes with
/// `\n \r \t \b \a \xHH` escapes and single quotes with `\'`. Returns
/// `None` on unbalanced quotes or a closing quote not followed by a space.
pub fn split_args(line: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut args = Vec::new();
    let mut i = 0;
    loop {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i == line.len() {
            return Some(args);
        }

        let mut cur = Vec::new();
        let mut in_dq = false;
        let mut in_sq = false;
        loop {
            if in_dq {
                let c = *line.get(i)?;
                if c == b'\\' && i + 3 < line.len() && line[i + 1] == b'x' {
                    if let (Some(h), Some(l)) = (hex_digit(line[i + 2]), hex_digit(line[i + 3])) {
                        cur.push(h * 16 + l);
                        i += 4;
                        continue;
                    }
                }
                if c == b'\\' && i + 1 < line.len() {
                    cur.push(match line[i + 1] {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        b'b' => 0x08,
                        b'a' => 0x07,
                        other => other,
                    });
                    i += 2;
                    continue;
                }
                if c == b'"' {
                    if i + 1 < line.len() && !line[i + 1].is_ascii_whitespace() {
                        return None;
                    }
                    i += 1;
                    break;
                }
                cur.push(c);
                i += 1;
            } else if in_sq {
                let c = *line.get(i)?;
                if c == b'\\' && line.get(i + 1) == Some(&b'\'') {
                    cur.push(b'\'');
                    i += 2;
                    continue;
                }
                if c == b'\'' {
                    if i + 1 < line.len() && !line[i + 1].is_ascii_whitespace() {
                        return None;
                    }
                    i += 1;
                    break;
                }
                cur.push(c);
                i += 1;
            } else {
                match line.get(i) {
                    None => break,
                    Some(c) if c.is_ascii_whitespace() => break,
                    Some(b'"') => in_dq = true,
                    Some(b'\'') => in_sq = true,
                    Some(&c) => cur.push(c),
                }
                i += 1;
            }
        }
        args.push(cur);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut RequestParser, buf: &mut Buffer, bytes: &[u8]) -> Vec<Vec<Vec<u8>>> {
        let limits = ParseLimits::default();
        buf.append(bytes);
        let mut out = Vec::new();
        while let Some(argv) = parser.parse(buf, &limits).unwrap() {
            out.push(argv);
        }
        out
    }

    fn args(v: &[&str]) -> Vec<Vec<u8>> {
        v.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_split_mid_header() {
        let mut p = RequestParser::new();
        let mut b = Buffer::new();
        assert!(feed(&mut p, &mut b, b"*2\r\n$3\r\nGET\r\n$1\r").is_empty());
        assert!(p.in_progress());
        assert_eq!(feed(&mut p, &mut b, b"\nA\r\n"), vec![args(&["GET", "A"])]);
        assert!(b.is_empty());
        assert!(!p.in_progress());
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let wire = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$12\r\nhello\r\nworld\r\n*1\r\n$4\r\nPING\r\n";
        let mut p = RequestParser::new();
        let mut b = Buffer::new();
        let mut got = Vec::new();
        for byte in wire.iter() {
            got.extend(feed(&mut p, &mut b, std::slice::from_ref(byte)));
        }
        assert_eq!(got, vec![args(&["SET", "key", "hello\r\nworld"]), args(&["PING"])]);
    }

    #[test]
    fn test_pipelined_inline_and_multibulk() {
        let mut p = RequestParser::new();
        let mut b = Buffer::new();
        let got = feed(&mut p, &mut b, b"PING\r\nECHO  hi\n*1\r\n$4\r\nPING\r\n\r\n");
        assert_eq!(got, vec![args(&["PING"]), args(&["ECHO", "hi"]), args(&["PING"]), vec![]]);
    }

    #[test]
    fn test_empty_multibulk() {
        let mut p = RequestParser::new();
        let mut b = Buffer::new();
        assert_eq!(feed(&mut p, &mut b, b"*0\r\n*-1\r\n"), vec![Vec::<Vec<u8>>::new(), Vec::<Vec<u8>>::new()]);
    }

    #[test]
    fn test_inline_quoting() {
        assert_eq!(
            split_args(br#"SET "a b" 'c\'d' "\x41\n""#).unwrap(),
            vec![b"SET".to_vec(), b"a b".to_vec(), b"c'd".to_vec(), b"A\n".to_vec()]
        );
        assert_eq!(split_args(b"   ").unwrap(), Vec::<Vec<u8>>::new());
        assert!(split_args(b"SET \"unterminated").is_none());
        assert!(split_args(b"SET \"a\"b").is_none());
        assert!(split_args(b"'x").is_none());
    }

    #[test]
    fn test_protocol_errors() {
        let limits = ParseLimits {
            inline_max: 16,
            ..ParseLimits::default()
        };
        let cases: &[(&[u8], ProtocolError)] = &[
            (b"*abc\r\n", ProtocolError::InvalidMultibulkLength),
            (b"*2000000\r\n", ProtocolError::InvalidMultibulkLength),
            (b"*1\r\n+foo\r\n", ProtocolError::ExpectedDollar('+')),
            (b"*1\r\n$-1\r\n", ProtocolError::InvalidBulkLength),
            (b"*1\r\n$x\r\n", ProtocolError::InvalidBulkLength),
            (b"*1\r\n$999999999999\r\n", ProtocolError::InvalidBulkLength),
            (b"*11111111111111111111", ProtocolError::BigMultibulkCount),
            (b"*1\r\n$11111111111111111111", ProtocolError::BigBulkCount),
            (b"aaaaaaaaaaaaaaaaaaaaaaa", ProtocolError::InlineTooBig),
            (b"SET \"x\n", ProtocolError::UnbalancedQuotes),
        ];
        for (input, expected) in cases {
            let mut p = RequestParser::new();
            let mut b = Buffer::new();
            b.append(input);
            assert_eq!(p.parse(&mut b, &limits).unwrap_err(), *expected, "input {:?}", input);
        }
        assert_eq!(
            ProtocolError::ExpectedDollar('+').to_string(),
            "Protocol error: expected '$', got '+'"
        );
    }

    #[test]
    fn test_big_argument_is_handed_over() {
        let limits = ParseLimits {
            mbulk_big_arg: 8,
            ..ParseLimits::default()
        };
        let payload = vec![b'z'; 20];
        let mut p = RequestParser::new();
        let mut b = Buffer::new();

        b.append(b"*2\r\n$3\r\nSET\r\n$20\r\nzzzz");
        assert!(p.parse(&mut b, &limits).unwrap().is_none());
        // Header and first argument consumed, the partial payload moved to
        // the front of the buffer.
        assert_eq!(b.data(), b"zzzz");
        assert_eq!(p.pending_big_bulk(b.len(), &limits), Some(18));

        b.append(&payload[4..]);
        b.append(b"\r\n");
        let argv = p.parse(&mut b, &limits).unwrap().unwrap();
        assert_eq!(argv, vec![b"SET".to_vec(), payload]);
        assert!(b.is_empty());
        assert_eq!(p.pending_big_bulk(0, &limits), None);
    }
}
