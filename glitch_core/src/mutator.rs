use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Byte values that tend to upset parsers when dropped in place of a single byte.
pub const INTERESTING_BYTES: [u8; 9] = [0x00, 0x01, 0x7F, 0x80, 0xFF, b'A', b'\r', b'\n', b' '];

/// Little-endian boundary integers written by `IntegerBoundary`:
/// zero and all-ones at widths 1, 2 and 4, then `i32::MAX` and `i32::MIN`.
pub const BOUNDARY_PATTERNS: [&[u8]; 8] = [
    &[0x00],
    &[0xFF],
    &[0x00, 0x00],
    &[0xFF, 0xFF],
    &[0x00, 0x00, 0x00, 0x00],
    &[0xFF, 0xFF, 0xFF, 0xFF],
    &[0xFF, 0xFF, 0xFF, 0x7F],
    &[0x00, 0x00, 0x00, 0x80],
];

/// printf-family payloads injected by `FormatString`.
pub const FORMAT_PAYLOADS: [&[u8]; 7] = [
    b"%s",
    b"%x",
    b"%n",
    b"%d",
    b"%s%s%s%s%s",
    b"AAAA%08x.%08x.%08x.%08x",
    b"%p%p%p%p",
];

/// Upper bound on the chunk copied by `Duplication`.
pub const MAX_DUPLICATION_CHUNK: usize = 100;

/// Width of the little-endian field rewritten by `LengthCorruption`.
const LENGTH_FIELD_WIDTH: usize = 4;

/// Errors raised by a single mutation attempt. None of them leave partial state behind:
/// the input slice is never modified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// The buffer is shorter than the strategy's minimum length.
    #[error("{strategy} needs at least {required} byte(s), buffer has {actual}")]
    BufferTooSmall {
        strategy: Strategy,
        required: usize,
        actual: usize,
    },

    /// An explicitly supplied offset lies outside the strategy's valid range.
    #[error("{strategy}: offset {offset} is out of bounds for a {len}-byte buffer")]
    OffsetOutOfBounds {
        strategy: Strategy,
        offset: usize,
        len: usize,
    },

    /// Some other explicit parameter (bit index, chunk length) is invalid.
    #[error("{strategy}: {reason}")]
    InvalidParameter { strategy: Strategy, reason: String },
}

/// A strategy name that matched none of the canonical names.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown mutation strategy '{0}'")]
pub struct UnknownStrategy(pub String);

/// Immutable record of one applied transformation.
///
/// `offset` refers to the buffer as it was *before* the mutation. Length-changing
/// strategies record the removed span in `original` (truncation) or the inserted span
/// in `mutated` (duplication), leaving the other side empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mutation {
    pub offset: usize,
    #[serde(serialize_with = "hex::serde::serialize")]
    pub original: Vec<u8>,
    #[serde(serialize_with = "hex::serde::serialize")]
    pub mutated: Vec<u8>,
    pub strategy: Strategy,
    pub description: String,
}

/// The closed set of mutation strategies.
///
/// Every variant is stateless; its constant tables live in this module. Dispatch goes
/// through [`Strategy::mutate`], which picks random parameters and delegates to the
/// matching deterministic primitive (`flip_bit`, `truncate`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Strategy {
    BitFlip,
    ByteOverwrite,
    IntegerBoundary,
    FormatString,
    LengthCorruption,
    Truncation,
    Duplication,
}

impl Strategy {
    /// All strategies, in registry order.
    pub const ALL: [Strategy; 7] = [
        Strategy::BitFlip,
        Strategy::ByteOverwrite,
        Strategy::IntegerBoundary,
        Strategy::FormatString,
        Strategy::LengthCorruption,
        Strategy::Truncation,
        Strategy::Duplication,
    ];

    /// Canonical name, as accepted by the strategy filter.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::BitFlip => "BitFlip",
            Strategy::ByteOverwrite => "ByteOverwrite",
            Strategy::IntegerBoundary => "IntegerBoundary",
            Strategy::FormatString => "FormatString",
            Strategy::LengthCorruption => "LengthCorruption",
            Strategy::Truncation => "Truncation",
            Strategy::Duplication => "Duplication",
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Strategy::BitFlip => "Flip individual bits",
            Strategy::ByteOverwrite => "Replace bytes with interesting values",
            Strategy::IntegerBoundary => "Replace integers with boundary values",
            Strategy::FormatString => "Inject format string specifiers",
            Strategy::LengthCorruption => "Corrupt length fields with extreme values",
            Strategy::Truncation => "Truncate data at random positions",
            Strategy::Duplication => "Duplicate sections of data",
        }
    }

    /// Smallest buffer this strategy can operate on.
    pub fn min_len(&self) -> usize {
        match self {
            Strategy::BitFlip
            | Strategy::ByteOverwrite
            | Strategy::IntegerBoundary
            | Strategy::Duplication => 1,
            Strategy::FormatString => shortest_format_payload(),
            Strategy::LengthCorruption => LENGTH_FIELD_WIDTH,
            Strategy::Truncation => 2,
        }
    }

    /// Whether the strategy can be applied to a buffer of `len` bytes.
    pub fn applies_to(&self, len: usize) -> bool {
        len >= self.min_len()
    }

    /// Applies this strategy to `data`, returning the new buffer and its record.
    ///
    /// When `offset` is `None` the strategy picks one uniformly within its own valid
    /// range. For `Duplication` the offset is the source of the copied chunk; the
    /// insertion point is always random. All remaining parameters (bit index,
    /// replacement value, payload, chunk length) are drawn from `rng`.
    pub fn mutate<R: Rng + ?Sized>(
        &self,
        data: &[u8],
        offset: Option<usize>,
        rng: &mut R,
    ) -> Result<(Vec<u8>, Mutation), MutationError> {
        self.ensure_len(data)?;
        let len = data.len();

        match self {
            Strategy::BitFlip => {
                let offset = offset.unwrap_or_else(|| rng.random_range(0..len));
                let bit = rng.random_range(0..8u8);
                flip_bit(data, offset, bit)
            }
            Strategy::ByteOverwrite => {
                let offset = offset.unwrap_or_else(|| rng.random_range(0..len));
                let value = INTERESTING_BYTES[rng.random_range(0..INTERESTING_BYTES.len())];
                overwrite_byte(data, offset, value)
            }
            Strategy::IntegerBoundary => {
                let pattern = BOUNDARY_PATTERNS[rng.random_range(0..BOUNDARY_PATTERNS.len())];
                let offset = offset
                    .unwrap_or_else(|| rng.random_range(0..=len.saturating_sub(pattern.len())));
                write_boundary(data, offset, pattern)
            }
            Strategy::FormatString => {
                let fitting: Vec<&[u8]> = FORMAT_PAYLOADS
                    .iter()
                    .copied()
                    .filter(|payload| payload.len() <= len)
                    .collect();
                let payload = fitting[rng.random_range(0..fitting.len())];
                let offset =
                    offset.unwrap_or_else(|| rng.random_range(0..=len - payload.len()));
                inject_format(data, offset, payload)
            }
            Strategy::LengthCorruption => {
                let offset = match offset {
                    Some(offset) => offset,
                    None => {
                        let candidates = length_field_candidates(data);
                        if candidates.is_empty() {
                            rng.random_range(0..=len - LENGTH_FIELD_WIDTH)
                        } else {
                            candidates[rng.random_range(0..candidates.len())]
                        }
                    }
                };
                let replacements = length_replacements(len);
                let value = replacements[rng.random_range(0..replacements.len())];
                corrupt_length(data, offset, value)
            }
            Strategy::Truncation => {
                let offset = offset.unwrap_or_else(|| rng.random_range(1..len));
                truncate(data, offset)
            }
            Strategy::Duplication => {
                let source = offset.unwrap_or_else(|| rng.random_range(0..len));
                if source >= len {
                    return Err(MutationError::OffsetOutOfBounds {
                        strategy: *self,
                        offset: source,
                        len,
                    });
                }
                let chunk_len = rng.random_range(1..=MAX_DUPLICATION_CHUNK.min(len - source));
                let insert_at = rng.random_range(0..=len);
                duplicate(data, source, chunk_len, insert_at)
            }
        }
    }

    fn ensure_len(&self, data: &[u8]) -> Result<(), MutationError> {
        if self.applies_to(data.len()) {
            Ok(())
        } else {
            Err(MutationError::BufferTooSmall {
                strategy: *self,
                required: self.min_len(),
                actual: data.len(),
            })
        }
    }

    fn check_offset(&self, offset: usize, limit: usize, len: usize) -> Result<(), MutationError> {
        if offset < limit {
            Ok(())
        } else {
            Err(MutationError::OffsetOutOfBounds {
                strategy: *self,
                offset,
                len,
            })
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    /// Case-insensitive match against the canonical names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownStrategy(s.to_string()))
    }
}

fn shortest_format_payload() -> usize {
    FORMAT_PAYLOADS
        .iter()
        .map(|payload| payload.len())
        .min()
        .unwrap_or(1)
}

/// Offsets of 4-byte little-endian values that could plausibly be length fields:
/// strictly greater than 1 and strictly less than the number of bytes left from there.
pub fn length_field_candidates(data: &[u8]) -> Vec<usize> {
    data.windows(LENGTH_FIELD_WIDTH)
        .enumerate()
        .filter(|(offset, window)| {
            let value = u32::from_le_bytes([window[0], window[1], window[2], window[3]]) as usize;
            1 < value && value < data.len() - offset
        })
        .map(|(offset, _)| offset)
        .collect()
}

/// Extreme replacement values for a length field in a buffer of `len` bytes.
pub fn length_replacements(len: usize) -> [u32; 4] {
    [
        u32::MAX,
        i32::MAX as u32,
        0,
        (len as u64).wrapping_add(1000) as u32,
    ]
}

/// XORs bit `bit` (0-7) of the byte at `offset`.
pub fn flip_bit(data: &[u8], offset: usize, bit: u8) -> Result<(Vec<u8>, Mutation), MutationError> {
    let strategy = Strategy::BitFlip;
    strategy.ensure_len(data)?;
    strategy.check_offset(offset, data.len(), data.len())?;
    if bit > 7 {
        return Err(MutationError::InvalidParameter {
            strategy,
            reason: format!("bit index {bit} is not in 0..=7"),
        });
    }

    let mut out = data.to_vec();
    out[offset] ^= 1 << bit;
    let mutation = Mutation {
        offset,
        original: vec![data[offset]],
        mutated: vec![out[offset]],
        strategy,
        description: format!("Flipped bit {bit} at offset {offset}"),
    };
    Ok((out, mutation))
}

pub fn overwrite_byte(
    data: &[u8],
    offset: usize,
    value: u8,
) -> Result<(Vec<u8>, Mutation), MutationError> {
    let strategy = Strategy::ByteOverwrite;
    strategy.ensure_len(data)?;
    strategy.check_offset(offset, data.len(), data.len())?;

    let mut out = data.to_vec();
    out[offset] = value;
    let mutation = Mutation {
        offset,
        original: vec![data[offset]],
        mutated: vec![value],
        strategy,
        description: format!("Overwrote byte at {offset} with 0x{value:02x}"),
    };
    Ok((out, mutation))
}

/// Writes `pattern` at `offset`, clamping it to the bytes left before the tail.
pub fn write_boundary(
    data: &[u8],
    offset: usize,
    pattern: &[u8],
) -> Result<(Vec<u8>, Mutation), MutationError> {
    let strategy = Strategy::IntegerBoundary;
    strategy.ensure_len(data)?;
    strategy.check_offset(offset, data.len(), data.len())?;

    let size = pattern.len().min(data.len() - offset);
    let value = &pattern[..size];
    let mut out = data.to_vec();
    out[offset..offset + size].copy_from_slice(value);
    let mutation = Mutation {
        offset,
        original: data[offset..offset + size].to_vec(),
        mutated: value.to_vec(),
        strategy,
        description: format!("Replaced {size} bytes at {offset} with boundary value"),
    };
    Ok((out, mutation))
}

/// Overwrites a span with `payload`. An offset whose span would overrun the tail is
/// pulled back so the whole payload fits.
pub fn inject_format(
    data: &[u8],
    offset: usize,
    payload: &[u8],
) -> Result<(Vec<u8>, Mutation), MutationError> {
    let strategy = Strategy::FormatString;
    if payload.is_empty() {
        return Err(MutationError::InvalidParameter {
            strategy,
            reason: "format payload is empty".to_string(),
        });
    }
    if payload.len() > data.len() {
        return Err(MutationError::BufferTooSmall {
            strategy,
            required: payload.len(),
            actual: data.len(),
        });
    }
    strategy.check_offset(offset, data.len(), data.len())?;

    let offset = offset.min(data.len() - payload.len());
    let end = offset + payload.len();
    let mut out = data.to_vec();
    out[offset..end].copy_from_slice(payload);
    let mutation = Mutation {
        offset,
        original: data[offset..end].to_vec(),
        mutated: payload.to_vec(),
        strategy,
        description: format!(
            "Injected format string {:?} at {offset}",
            String::from_utf8_lossy(payload)
        ),
    };
    Ok((out, mutation))
}

pub fn corrupt_length(
    data: &[u8],
    offset: usize,
    value: u32,
) -> Result<(Vec<u8>, Mutation), MutationError> {
    let strategy = Strategy::LengthCorruption;
    strategy.ensure_len(data)?;
    strategy.check_offset(offset, data.len() - LENGTH_FIELD_WIDTH + 1, data.len())?;

    let end = offset + LENGTH_FIELD_WIDTH;
    let mut out = data.to_vec();
    out[offset..end].copy_from_slice(&value.to_le_bytes());
    let mutation = Mutation {
        offset,
        original: data[offset..end].to_vec(),
        mutated: out[offset..end].to_vec(),
        strategy,
        description: format!("Corrupted potential length field at {offset} to 0x{value:08x}"),
    };
    Ok((out, mutation))
}

/// Keeps the first `offset` bytes. `offset` must be interior: `1 <= offset < len`.
pub fn truncate(data: &[u8], offset: usize) -> Result<(Vec<u8>, Mutation), MutationError> {
    let strategy = Strategy::Truncation;
    strategy.ensure_len(data)?;
    if offset == 0 {
        return Err(MutationError::OffsetOutOfBounds {
            strategy,
            offset,
            len: data.len(),
        });
    }
    strategy.check_offset(offset, data.len(), data.len())?;

    let removed = &data[offset..];
    let mutation = Mutation {
        offset,
        original: removed.to_vec(),
        mutated: Vec::new(),
        strategy,
        description: format!(
            "Truncated data at position {offset} (removed {} bytes)",
            removed.len()
        ),
    };
    Ok((data[..offset].to_vec(), mutation))
}

/// Copies `chunk_len` bytes starting at `source` and inserts the copy before
/// `insert_at` (which may equal the buffer length to append).
///
/// The record's offset is the source of the chunk, so it always lies inside the input.
/// `original` is empty, `mutated` holds the inserted bytes and the insertion point is
/// named in the description.
pub fn duplicate(
    data: &[u8],
    source: usize,
    chunk_len: usize,
    insert_at: usize,
) -> Result<(Vec<u8>, Mutation), MutationError> {
    let strategy = Strategy::Duplication;
    strategy.ensure_len(data)?;
    let len = data.len();
    strategy.check_offset(source, len, len)?;
    strategy.check_offset(insert_at, len + 1, len)?;
    let max_chunk = MAX_DUPLICATION_CHUNK.min(len - source);
    if chunk_len == 0 || chunk_len > max_chunk {
        return Err(MutationError::InvalidParameter {
            strategy,
            reason: format!("chunk length {chunk_len} is not in 1..={max_chunk}"),
        });
    }

    let chunk = &data[source..source + chunk_len];
    let mut out = Vec::with_capacity(len + chunk_len);
    out.extend_from_slice(&data[..insert_at]);
    out.extend_from_slice(chunk);
    out.extend_from_slice(&data[insert_at..]);
    let mutation = Mutation {
        offset: source,
        original: Vec::new(),
        mutated: chunk.to_vec(),
        strategy,
        description: format!("Duplicated {chunk_len} bytes from {source} to {insert_at}"),
    };
    Ok((out, mutation))
}
