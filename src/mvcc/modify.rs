//! Partial-value updates ("modifies").
//!
//! A modify is a list of byte-range replacements applied in order to a base
//! value. Offsets past the end of the base pad with zero bytes.

use crate::error::{LapisError, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Largest byte range a single modify entry may address.
pub const MAX_MODIFY_SPAN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyEntry {
    pub offset: usize,
    /// Number of base bytes replaced
    pub size: usize,
    pub data: Vec<u8>,
}

impl ModifyEntry {
    pub fn new(offset: usize, size: usize, data: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            size,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modify {
    pub entries: SmallVec<[ModifyEntry; 2]>,
}

impl Modify {
    pub fn new(entries: impl IntoIterator<Item = ModifyEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Reject entries whose range overflows or reaches past
    /// [`MAX_MODIFY_SPAN`].
    pub fn validate(&self) -> Result<()> {
        for entry in &self.entries {
            match entry.offset.checked_add(entry.size) {
                Some(end) if end <= MAX_MODIFY_SPAN => {}
                _ => {
                    return Err(LapisError::invalid(format!(
                        "modify range {}+{} exceeds {} bytes",
                        entry.offset, entry.size, MAX_MODIFY_SPAN
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn apply(&self, base: &[u8]) -> Vec<u8> {
        let mut value = base.to_vec();
        for entry in &self.entries {
            if entry.offset > value.len() {
                value.resize(entry.offset, 0);
            }
            let end = entry.offset.saturating_add(entry.size).min(value.len());
            let _replaced: Vec<u8> = value.splice(entry.offset..end, entry.data.iter().copied()).collect();
        }
        value
    }

    /// Apply a run of modifies oldest-first.
    pub fn apply_all<'a>(base: &[u8], oldest_first: impl IntoIterator<Item = &'a Modify>) -> Vec<u8> {
        let mut value = base.to_vec();
        for m in oldest_first {
            value = m.apply(&value);
        }
        value
    }

    pub fn mem_size(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.data.len() + std::mem::size_of::<ModifyEntry>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_replace_in_place() {
        let m = Modify::new([ModifyEntry::new(2, 3, b"XYZ".to_vec())]);
        assert_eq!(m.apply(b"abcdefg"), b"abXYZfg".to_vec());
    }

    #[test]
    fn test_apply_grow_and_shrink() {
        let grow = Modify::new([ModifyEntry::new(1, 1, b"1234".to_vec())]);
        assert_eq!(grow.apply(b"abc"), b"a1234c".to_vec());

        let shrink = Modify::new([ModifyEntry::new(0, 2, Vec::new())]);
        assert_eq!(shrink.apply(b"abc"), b"c".to_vec());
    }

    #[test]
    fn test_apply_past_end_pads() {
        let m = Modify::new([ModifyEntry::new(5, 0, b"!".to_vec())]);
        assert_eq!(m.apply(b"ab"), vec![b'a', b'b', 0, 0, 0, b'!']);
    }

    #[test]
    fn test_validate_rejects_overflowing_ranges() {
        assert!(Modify::new([ModifyEntry::new(1, usize::MAX, b"X".to_vec())]).validate().is_err());
        assert!(Modify::new([ModifyEntry::new(MAX_MODIFY_SPAN, 1, Vec::new())]).validate().is_err());
        assert!(Modify::new([ModifyEntry::new(2, 3, b"XYZ".to_vec())]).validate().is_ok());

        // Saturates instead of overflowing
        let m = Modify::new([ModifyEntry::new(1, usize::MAX, b"X".to_vec())]);
        assert_eq!(m.apply(b"abc"), b"aX".to_vec());
    }

    #[test]
    fn test_apply_all_order() {
        let first = Modify::new([ModifyEntry::new(0, 1, b"B".to_vec())]);
        let second = Modify::new([ModifyEntry::new(1, 1, b"C".to_vec())]);
        assert_eq!(Modify::apply_all(b"aaa", [&first, &second]), b"BCa".to_vec());
    }
}
