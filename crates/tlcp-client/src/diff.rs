//! Decoder for the TLCP positional diff format.
//!
//! A patch is a run of `(copy, add, delete)` triples, each length encoded as
//! a base-26 varint: `A`-`Z` are continuation digits and `a`-`z` terminate
//! the number. `add` is followed by that many literal characters. The patch
//! may stop after any complete number. Lengths count UTF-16 code units.

use crate::{
    error::{TlcpError, TlcpResult},
    types::DiffFormat,
};

const VARINT_RADIX: usize = 26;

/// Apply `patch`, expressed in `format`, to `source`.
pub fn apply_patch(format: DiffFormat, source: &str, patch: &str) -> TlcpResult<String> {
    match format {
        DiffFormat::TlcpDiff => apply_tlcp_diff(source, patch),
        other => Err(TlcpError::decode(format!(
            "Unsupported diff format {other:?}"
        ))),
    }
}

/// Apply a TLCP diff to `source`.
pub fn apply_tlcp_diff(source: &str, patch: &str) -> TlcpResult<String> {
    let source: Vec<u16> = source.encode_utf16().collect();
    let patch: Vec<u16> = patch.encode_utf16().collect();

    let length = result_length(&patch)?;
    let mut output = Vec::with_capacity(length);
    let mut source_cursor = Cursor::new(&source);
    let mut patch_cursor = Cursor::new(&patch);

    loop {
        let Some(copy) = patch_cursor.next_varint()? else {
            break;
        };
        output.extend_from_slice(source_cursor.take(copy)?);

        let Some(add) = patch_cursor.next_varint()? else {
            break;
        };
        output.extend_from_slice(patch_cursor.take(add)?);

        let Some(delete) = patch_cursor.next_varint()? else {
            break;
        };
        source_cursor.take(delete)?;
    }

    debug_assert_eq!(output.len(), length);
    String::from_utf16(&output)
        .map_err(|_| TlcpError::decode("Patch splits a surrogate pair"))
}

fn result_length(patch: &[u16]) -> TlcpResult<usize> {
    let mut cursor = Cursor::new(patch);
    let mut length = 0usize;
    loop {
        let Some(copy) = cursor.next_varint()? else {
            break;
        };
        length = checked_add(length, copy)?;

        let Some(add) = cursor.next_varint()? else {
            break;
        };
        cursor.take(add)?;
        length = checked_add(length, add)?;

        if cursor.next_varint()?.is_none() {
            break;
        }
    }
    Ok(length)
}

fn checked_add(a: usize, b: usize) -> TlcpResult<usize> {
    a.checked_add(b)
        .ok_or_else(|| TlcpError::decode("Patch length overflow"))
}

struct Cursor<'a> {
    data: &'a [u16],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u16]) -> Self {
        Self { data, position: 0 }
    }

    fn has_next(&self) -> bool {
        self.position < self.data.len()
    }

    fn take(&mut self, n: usize) -> TlcpResult<&'a [u16]> {
        let end = self
            .position
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                TlcpError::decode(format!(
                    "Patch runs past the end of its input at {} (+{n})",
                    self.position
                ))
            })?;
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    /// Decode the next varint, or `None` at the end of the input.
    fn next_varint(&mut self) -> TlcpResult<Option<usize>> {
        if !self.has_next() {
            return Ok(None);
        }
        let mut value = 0usize;
        loop {
            let Some(&unit) = self.data.get(self.position) else {
                return Err(TlcpError::decode("Truncated varint in patch"));
            };
            self.position += 1;
            let (digit, last) = match unit {
                0x61..=0x7A => (unit - 0x61, true),
                0x41..=0x5A => (unit - 0x41, false),
                other => {
                    return Err(TlcpError::decode(format!(
                        "Malformed input string: '{}'",
                        char::from_u32(u32::from(other)).unwrap_or(char::REPLACEMENT_CHARACTER)
                    )));
                }
            };
            value = value
                .checked_mul(VARINT_RADIX)
                .and_then(|value| value.checked_add(usize::from(digit)))
                .ok_or_else(|| TlcpError::decode("Varint overflow in patch"))?;
            if last {
                return Ok(Some(value));
            }
        }
    }
}
