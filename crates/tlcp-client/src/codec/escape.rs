//! TLCP value escaping.
//!
//! Only the characters that would break request framing are escaped;
//! everything else, non-ASCII included, is sent verbatim. Decoding reverses
//! `%XX` sequences and never turns `+` into a space.

use std::borrow::Cow;

use crate::error::{TlcpError, TlcpResult};

/// Append `value` to `out`, escaping CR, LF, `%`, `+`, `&` and `=`.
pub fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            '%' => out.push_str("%25"),
            '+' => out.push_str("%2B"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            other => out.push(other),
        }
    }
}

/// Escape `value` into a new string.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    escape_into(&mut out, value);
    out
}

/// Decode a TLCP escaped value.
///
/// Consecutive `%XX` sequences form one byte run that is decoded as UTF-8.
/// Returns the input unchanged when it holds no escape.
pub fn unescape(value: &str) -> TlcpResult<Cow<'_, str>> {
    let bytes = value.as_bytes();
    let Some(first) = memchr::memchr(b'%', bytes) else {
        return Ok(Cow::Borrowed(value));
    };

    let mut out = String::with_capacity(value.len());
    out.push_str(&value[..first]);

    let mut run = Vec::new();
    let mut i = first;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            // copy up to the next escape; '%' is ASCII so the slice stays on a char boundary
            let end = memchr::memchr(b'%', &bytes[i..]).map_or(bytes.len(), |offset| i + offset);
            out.push_str(&value[i..end]);
            i = end;
            continue;
        }

        run.clear();
        while i < bytes.len() && bytes[i] == b'%' {
            let byte = bytes
                .get(i + 1..i + 3)
                .and_then(|hex| Some(hex_value(hex[0])? << 4 | hex_value(hex[1])?))
                .ok_or_else(|| {
                    TlcpError::decode(format!(
                        "Illegal hex characters in escape (%) pattern at {i}: {value}"
                    ))
                })?;
            run.push(byte);
            i += 3;
        }
        out.push_str(&String::from_utf8_lossy(&run));
    }

    Ok(Cow::Owned(out))
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}
