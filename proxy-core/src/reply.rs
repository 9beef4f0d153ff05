//! Boundary detection for upstream replies.
//!
//! The proxy never decodes a reply's payload — it only needs to know where one ends so the
//! exact byte range can be copied into the owning client's output buffer verbatim. This
//! covers the RESP-like reply types a cluster node actually sends back: simple strings,
//! errors, integers, bulk strings (including the null bulk `$-1\r\n`), and arrays of the
//! above (including the null array `*-1\r\n`), nested arbitrarily deep for commands like MGET.

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n").map(|pos| pos + 2)
}

fn parse_header_count(data: &[u8], header_len: usize) -> Option<i64> {
    std::str::from_utf8(&data[1..header_len - 2]).ok()?.parse().ok()
}

fn line_reply_len(data: &[u8]) -> Option<usize> {
    find_crlf(data)
}

fn bulk_reply_len(data: &[u8]) -> Option<usize> {
    let header_len = find_crlf(data)?;
    let n = parse_header_count(data, header_len)?;
    if n < 0 {
        return Some(header_len);
    }
    let total = header_len + n as usize + 2;
    if data.len() < total {
        return None;
    }
    Some(total)
}

fn array_reply_len(data: &[u8]) -> Option<usize> {
    let header_len = find_crlf(data)?;
    let count = parse_header_count(data, header_len)?;
    let mut cursor = header_len;
    if count < 0 {
        return Some(cursor);
    }
    for _ in 0..count {
        let remaining = data.get(cursor..)?;
        let elem_len = reply_len(remaining)?;
        cursor += elem_len;
    }
    Some(cursor)
}

/// Length in bytes of one complete reply at the start of `data`, or `None` if `data` doesn't
/// yet hold a full reply (more bytes needed) or starts with an unrecognized type byte.
pub fn reply_len(data: &[u8]) -> Option<usize> {
    match data.first()? {
        b'+' | b'-' | b':' => line_reply_len(data),
        b'$' => bulk_reply_len(data),
        b'*' => array_reply_len(data),
        _ => None,
    }
}
