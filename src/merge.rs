//! Merge operators combine a base value with a chain of operands.
//!
//! Operands are kept as separate entries until a read needs the value; the
//! read collects the newest operands down to the first full value (or
//! deletion) and calls [`MergeOperator::full_merge`] with them oldest first.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `None` when the operands cannot be applied; the read then
    /// fails with a corruption status.
    fn full_merge(&self, key: &[u8], existing: Option<&[u8]>, operands: &[Vec<u8>])
        -> Option<Vec<u8>>;

    /// Combines adjacent operands without a base value.
    fn partial_merge(&self, _key: &[u8], _left: &[u8], _right: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

pub type MergeOperatorRef = Arc<dyn MergeOperator>;

/// Concatenates operands onto the existing value with a delimiter.
#[derive(Debug, Clone)]
pub struct StringAppendOperator {
    delimiter: Vec<u8>,
}

impl StringAppendOperator {
    pub fn new(delimiter: impl Into<Vec<u8>>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }
}

impl Default for StringAppendOperator {
    fn default() -> Self {
        Self::new(b",".to_vec())
    }
}

impl MergeOperator for StringAppendOperator {
    fn name(&self) -> &str {
        "StringAppendOperator"
    }

    fn full_merge(
        &self,
        _key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut first = true;
        if let Some(base) = existing {
            out.extend_from_slice(base);
            first = false;
        }
        for operand in operands {
            if !first {
                out.extend_from_slice(&self.delimiter);
            }
            out.extend_from_slice(operand);
            first = false;
        }
        Some(out)
    }

    fn partial_merge(&self, _key: &[u8], left: &[u8], right: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(left.len() + self.delimiter.len() + right.len());
        out.extend_from_slice(left);
        out.extend_from_slice(&self.delimiter);
        out.extend_from_slice(right);
        Some(out)
    }
}

/// Adds little-endian u64 counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct UInt64AddOperator;

impl UInt64AddOperator {
    fn decode(value: &[u8]) -> Option<u64> {
        if value.len() != 8 {
            return None;
        }
        Some(LittleEndian::read_u64(value))
    }
}

impl MergeOperator for UInt64AddOperator {
    fn name(&self) -> &str {
        "UInt64AddOperator"
    }

    fn full_merge(
        &self,
        _key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>> {
        let mut total = match existing {
            Some(base) => Self::decode(base)?,
            None => 0,
        };
        for operand in operands {
            total = total.wrapping_add(Self::decode(operand)?);
        }
        let mut out = vec![0u8; 8];
        LittleEndian::write_u64(&mut out, total);
        Some(out)
    }

    fn partial_merge(&self, _key: &[u8], left: &[u8], right: &[u8]) -> Option<Vec<u8>> {
        let sum = Self::decode(left)?.wrapping_add(Self::decode(right)?);
        let mut out = vec![0u8; 8];
        LittleEndian::write_u64(&mut out, sum);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_append_without_base() {
        let op = StringAppendOperator::default();
        let merged = op.full_merge(b"k", None, &[b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(merged.as_deref(), Some(&b"a,b"[..]));
    }

    #[test]
    fn test_string_append_with_base_and_custom_delimiter() {
        let op = StringAppendOperator::new(b"|".to_vec());
        let merged = op.full_merge(b"k", Some(b"x"), &[b"y".to_vec()]);
        assert_eq!(merged.as_deref(), Some(&b"x|y"[..]));
        assert_eq!(op.partial_merge(b"k", b"1", b"2").as_deref(), Some(&b"1|2"[..]));
    }

    #[test]
    fn test_uint64_add() {
        let op = UInt64AddOperator;
        let one = 1u64.to_le_bytes().to_vec();
        let five = 5u64.to_le_bytes().to_vec();
        let merged = op.full_merge(b"c", Some(&five), &[one.clone(), one]).unwrap();
        assert_eq!(LittleEndian::read_u64(&merged), 7);
        assert!(op.full_merge(b"c", Some(b"bad"), &[]).is_none());
    }
}
