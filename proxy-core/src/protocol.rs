//! Inline/multi-bulk stream parser.
//!
//! Parses as far into a client's accumulated read buffer as there is data for, splitting a
//! single read that contains more than one pipelined command into one `Request` per command
//! (spec §4.1 "Pipeline splitting"). Argument offsets reference the request's own buffer —
//! the decoded value itself is never copied out of it.

use crate::error::ProxyError;
use crate::request::{ClientId, QueueLocation, RequestArena, RequestId};

const MIN_ARG_GROWTH: usize = 10;

enum FrameResult {
    /// Not enough bytes yet; caller must wait for more data from the socket.
    Incomplete,
    /// A full command was parsed; `consumed` bytes (from the start of the slice) belong to
    /// it and `args` are offsets into that same slice.
    Complete {
        consumed: usize,
        args: Vec<(usize, usize)>,
    },
}

/// A tiny forward-only cursor over a byte slice, used only while parsing one frame.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Read one line terminated by `\n` (optionally preceded by `\r`), returning the line
    /// body without the terminator. Advances past the terminator. `None` if no terminator
    /// has arrived yet.
    fn read_line(&mut self) -> Option<&'a [u8]> {
        let rest = self.remaining();
        let nl = rest.iter().position(|&b| b == b'\n')?;
        let mut end = nl;
        if end > 0 && rest[end - 1] == b'\r' {
            end -= 1;
        }
        let line = &rest[..end];
        self.pos += nl + 1;
        Some(line)
    }

    fn read_exact(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining().len() < n {
            return None;
        }
        let slice = &self.remaining()[..n];
        self.pos += n;
        Some(slice)
    }

    fn peek_byte(&self) -> Option<u8> {
        self.remaining().first().copied()
    }
}

fn parse_decimal(line: &[u8]) -> Result<i64, ProxyError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(ProxyError::ProtocolError)
}

fn parse_multibulk(data: &[u8]) -> Result<FrameResult, ProxyError> {
    let mut cursor = Cursor::new(data);

    // Skip the leading '*'.
    cursor.pos += 1;
    let header = match cursor.read_line() {
        Some(line) => line,
        None => return Ok(FrameResult::Incomplete),
    };

    let raw_count = parse_decimal(header)?;
    let count = raw_count.max(0) as usize;

    // Round capacity up to the next MIN_ARG_GROWTH step rather than allocating exactly
    // `count` slots, amortizing across similarly-sized pipelined commands.
    let rounded = count.div_ceil(MIN_ARG_GROWTH).max(1) * MIN_ARG_GROWTH;
    let mut args = Vec::with_capacity(rounded);

    for _ in 0..count {
        match cursor.peek_byte() {
            Some(b'$') => cursor.pos += 1,
            Some(_) => return Err(ProxyError::ProtocolError),
            None => return Ok(FrameResult::Incomplete),
        }

        let len_line = match cursor.read_line() {
            Some(line) => line,
            None => return Ok(FrameResult::Incomplete),
        };
        let raw_len = parse_decimal(len_line)?;
        let len = raw_len.max(0) as usize;

        let arg_start = cursor.pos;
        if cursor.read_exact(len).is_none() {
            return Ok(FrameResult::Incomplete);
        }
        // Trailing CRLF after the bulk payload.
        match cursor.read_line() {
            Some(trailer) if trailer.is_empty() => {}
            Some(_) => return Err(ProxyError::ProtocolError),
            None => return Ok(FrameResult::Incomplete),
        }

        args.push((arg_start, len));
    }

    Ok(FrameResult::Complete {
        consumed: cursor.pos,
        args,
    })
}

fn parse_inline(data: &[u8]) -> Result<FrameResult, ProxyError> {
    let mut cursor = Cursor::new(data);
    let line = match cursor.read_line() {
        Some(line) => line,
        None => {
            if data.len() > 64 * 1024 {
                // An inline request with no terminator for 64KB is never going to resolve;
                // treat it as a protocol error rather than buffering forever.
                return Err(ProxyError::ProtocolError);
            }
            return Ok(FrameResult::Incomplete);
        }
    };

    let line_start = 0usize;
    let mut args = Vec::new();
    let mut idx = 0usize;
    while idx < line.len() {
        while idx < line.len() && line[idx] == b' ' {
            idx += 1;
        }
        if idx >= line.len() {
            break;
        }
        let start = idx;
        while idx < line.len() && line[idx] != b' ' {
            idx += 1;
        }
        args.push((line_start + start, idx - start));
    }

    Ok(FrameResult::Complete {
        consumed: cursor.pos,
        args,
    })
}

fn parse_frame(data: &[u8]) -> Result<FrameResult, ProxyError> {
    match data.first() {
        None => Ok(FrameResult::Incomplete),
        Some(b'*') => parse_multibulk(data),
        Some(_) => parse_inline(data),
    }
}

/// Parse as many complete commands as `accum` currently holds, turning each into a `Request`
/// in `arena` and linking consecutive ones via `prev`/`next`. Bytes belonging to parsed
/// commands are drained from `accum`; an incomplete trailing command is left in place for
/// the next read. Returns the ids of newly created requests, in order.
pub fn drain_pipeline(
    client_id: ClientId,
    accum: &mut Vec<u8>,
    arena: &mut RequestArena,
) -> Result<Vec<RequestId>, ProxyError> {
    let mut produced = Vec::new();
    let mut cursor = 0usize;
    let mut predecessor: Option<RequestId> = None;

    loop {
        let slice = &accum[cursor..];
        if slice.is_empty() {
            break;
        }
        match parse_frame(slice) {
            Ok(FrameResult::Incomplete) => break,
            Ok(FrameResult::Complete { consumed, args }) => {
                let command_name = args
                    .first()
                    .map(|&(off, len)| {
                        String::from_utf8_lossy(&slice[off..off + len]).to_ascii_lowercase()
                    })
                    .unwrap_or_default();

                let buf = slice[..consumed].to_vec();
                let id = arena.insert(client_id, buf, args, command_name);
                if let Some(prev_id) = predecessor {
                    arena.get_mut(prev_id).unwrap().next = Some(id);
                    arena.get_mut(id).unwrap().prev = Some(prev_id);
                }
                arena.get_mut(id).unwrap().location = QueueLocation::ClientParseQueue;

                produced.push(id);
                predecessor = Some(id);
                cursor += consumed;
            }
            Err(e) => {
                // No well-defined "consumed" length on a hard parse error; drop the whole
                // unconsumed remainder since the byte stream can no longer be trusted to
                // resync mid-frame.
                accum.clear();
                return Err(e);
            }
        }
    }

    accum.drain(..cursor);
    Ok(produced)
}
