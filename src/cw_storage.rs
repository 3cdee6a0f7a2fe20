//! Storage Backend Interface
//!
//! The commit store persists into six ordered byte-keyed tables. Backends
//! hand out read snapshots and atomic write batches; everything a single
//! commit changes goes through one batch so a partially applied commit is
//! never observable.
//!
//! Key layouts (all integers big-endian so byte order matches numeric order):
//!
//! ```text
//! commits         timestamp(8) medallion(8)                  -> commit bytes
//! chain_heads     medallion(8) chain_start(8)                -> header-only commit
//! containers      muid(20)                                   -> container record
//! entries         source(20) key(..) entry muid(20)          -> entry record
//! exits           source(20) key(..) entry muid(20)          -> exit timestamp(8)
//! claimed_chains  medallion(8)                               -> chain_start(8)
//! ```

use crate::cw_error::CwError;
use crate::cw_interface::{ChainKey, Key, Medallion, Muid, Timestamp, MUID_LEN};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Commits,
    ChainHeads,
    Containers,
    Entries,
    Exits,
    ClaimedChains,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Commits,
        Table::ChainHeads,
        Table::Containers,
        Table::Entries,
        Table::Exits,
        Table::ClaimedChains,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::Commits => "commits",
            Table::ChainHeads => "chain_heads",
            Table::Containers => "containers",
            Table::Entries => "entries",
            Table::Exits => "exits",
            Table::ClaimedChains => "claimed_chains",
        }
    }
}

pub type Row = (Vec<u8>, Vec<u8>);

pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Row, CwError>> + 'a>;

// ============================================================================
// Backend traits
// ============================================================================

/// Consistent read view of every table.
pub trait StoreSnapshot {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, CwError>;

    /// Rows with `lower <= key < upper` (unbounded above when `upper` is None),
    /// ascending or, with `reverse`, descending.
    fn scan(
        &self,
        table: Table,
        lower: &[u8],
        upper: Option<&[u8]>,
        reverse: bool,
    ) -> Result<RowIter<'_>, CwError>;

    /// Rows whose key starts with `prefix`.
    fn scan_prefix(&self, table: Table, prefix: &[u8], reverse: bool) -> Result<RowIter<'_>, CwError> {
        let upper = prefix_successor(prefix);
        self.scan(table, prefix, upper.as_deref(), reverse)
    }
}

/// Write operations accumulated and applied atomically.
///
/// # Example
/// ```rust
/// use chainweave::cw_memory_backend::MemoryBackend;
/// use chainweave::cw_storage::{StoreBackend, Table};
///
/// let backend = MemoryBackend::new();
/// let mut batch = backend.begin_batch();
/// batch.put(Table::Commits, b"key", b"value");
/// batch.commit().unwrap();
///
/// let snapshot = backend.snapshot().unwrap();
/// assert_eq!(snapshot.get(Table::Commits, b"key").unwrap(), Some(b"value".to_vec()));
/// ```
pub trait StorageBatch {
    fn put(&mut self, table: Table, key: &[u8], value: &[u8]);

    /// Number of queued writes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply every queued write or none of them.
    fn commit(self: Box<Self>) -> Result<(), CwError>;
}

pub trait StoreBackend: Send + Sync {
    fn snapshot(&self) -> Result<Box<dyn StoreSnapshot + '_>, CwError>;

    fn begin_batch(&self) -> Box<dyn StorageBatch + '_>;

    /// Release underlying resources.
    fn close(&self) -> Result<(), CwError> {
        Ok(())
    }
}

// ============================================================================
// Key encoding
// ============================================================================

/// Smallest key greater than every key starting with `prefix`, or None when
/// no such key exists (prefix is all 0xff).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < 0xff {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

pub fn commit_key(timestamp: Timestamp, medallion: Medallion) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..8].copy_from_slice(&timestamp.to_be_bytes());
    out[8..16].copy_from_slice(&medallion.to_be_bytes());
    out
}

pub fn decode_commit_key(key: &[u8]) -> Result<(Timestamp, Medallion), CwError> {
    if key.len() != 16 {
        return Err(CwError::Storage(format!("commit key of {} bytes", key.len())));
    }
    Ok((read_u64(&key[0..8])?, read_u64(&key[8..16])?))
}

pub fn chain_key(chain: &ChainKey) -> [u8; 16] {
    chain.to_bytes()
}

pub fn claim_key(medallion: Medallion) -> [u8; 8] {
    medallion.to_be_bytes()
}

const KEY_NONE: u8 = 0;
const KEY_NUMBER: u8 = 1;
const KEY_TEXT: u8 = 2;

/// Order-preserving encoding of an optional semantic key.
pub fn encode_key(key: Option<&Key>, out: &mut Vec<u8>) {
    match key {
        None => out.push(KEY_NONE),
        Some(Key::Number(n)) => {
            out.push(KEY_NUMBER);
            out.extend_from_slice(&((*n as u64) ^ (1 << 63)).to_be_bytes());
        }
        Some(Key::Text(s)) => {
            out.push(KEY_TEXT);
            // 0x00 is escaped as 0x00 0xff; 0x00 0x00 terminates
            for &byte in s.as_bytes() {
                out.push(byte);
                if byte == 0 {
                    out.push(0xff);
                }
            }
            out.extend_from_slice(&[0, 0]);
        }
    }
}

/// Undo the text escaping, returning the text and the bytes after it.
fn decode_text(data: &[u8]) -> Option<(String, &[u8])> {
    let mut text = Vec::new();
    let mut i = 0;
    loop {
        match (*data.get(i)?, data.get(i + 1).copied()) {
            (0, Some(0)) => break,
            (0, Some(0xff)) => {
                text.push(0);
                i += 2;
            }
            (0, _) => return None,
            (byte, _) => {
                text.push(byte);
                i += 1;
            }
        }
    }
    let text = String::from_utf8(text).ok()?;
    Some((text, &data[i + 2..]))
}

/// Prefix selecting every entry (or exit) under `source`.
pub fn source_prefix(source: &Muid) -> Vec<u8> {
    source.to_bytes().to_vec()
}

/// Prefix selecting every entry (or exit) under `source` with `key`.
pub fn source_key_prefix(source: &Muid, key: Option<&Key>) -> Vec<u8> {
    let mut out = source_prefix(source);
    encode_key(key, &mut out);
    out
}

/// Full entries/exits key.
pub fn placement_key(source: &Muid, key: Option<&Key>, entry: &Muid) -> Vec<u8> {
    let mut out = source_key_prefix(source, key);
    out.extend_from_slice(&entry.to_bytes());
    out
}

/// Split an entries/exits key back into its parts.
pub fn decode_placement_key(data: &[u8]) -> Result<(Muid, Option<Key>, Muid), CwError> {
    let corrupt = || CwError::Storage(format!("placement key of {} bytes", data.len()));
    if data.len() < 2 * MUID_LEN + 1 {
        return Err(corrupt());
    }
    let source = Muid::from_bytes(&data[..MUID_LEN]).ok_or_else(corrupt)?;
    let rest = &data[MUID_LEN..];
    let (key, tail) = match rest[0] {
        KEY_NONE => (None, &rest[1..]),
        KEY_NUMBER => {
            let raw = rest.get(1..9).ok_or_else(corrupt)?;
            let n = (read_u64(raw)? ^ (1 << 63)) as i64;
            (Some(Key::Number(n)), &rest[9..])
        }
        KEY_TEXT => {
            let (text, tail) = decode_text(&rest[1..]).ok_or_else(corrupt)?;
            (Some(Key::Text(text)), tail)
        }
        _ => return Err(corrupt()),
    };
    let entry = Muid::from_bytes(tail).ok_or_else(corrupt)?;
    Ok((source, key, entry))
}

pub fn read_u64(data: &[u8]) -> Result<u64, CwError> {
    data.try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| CwError::Storage(format!("expected 8 bytes, found {}", data.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(&[1, 2]), Some(vec![1, 3]));
        assert_eq!(prefix_successor(&[1, 0xff]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_placement_key_parts() {
        let source = Muid::new(10, 20, 1);
        let entry = Muid::new(30, 40, 2);
        for key in [None, Some(Key::Number(-5)), Some(Key::from("name"))] {
            let encoded = placement_key(&source, key.as_ref(), &entry);
            assert!(encoded.starts_with(&source_key_prefix(&source, key.as_ref())));
            assert_eq!(decode_placement_key(&encoded).unwrap(), (source, key, entry));
        }
    }

    #[test]
    fn test_number_keys_sort_numerically() {
        let source = Muid::new(1, 1, 1);
        let entry = Muid::new(2, 2, 2);
        let low = placement_key(&source, Some(&Key::Number(-3)), &entry);
        let mid = placement_key(&source, Some(&Key::Number(0)), &entry);
        let high = placement_key(&source, Some(&Key::Number(7)), &entry);
        assert!(low < mid && mid < high);
    }

    #[test]
    fn test_text_keys_sort_lexicographically() {
        let source = Muid::new(1, 1, 1);
        let entry = Muid::new(2, 2, 2);
        let keys = ["", "a", "a\0", "a\0b", "aa", "b"];
        let encoded: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| placement_key(&source, Some(&Key::from(*k)), &entry))
            .collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));
        for (key, bytes) in keys.iter().zip(&encoded) {
            assert_eq!(decode_placement_key(bytes).unwrap().1, Some(Key::from(*key)));
        }
    }

    #[test]
    fn test_text_key_prefix_does_not_match_longer_key() {
        let source = Muid::new(1, 1, 1);
        let entry = Muid::new(2, 2, 2);
        let longer = placement_key(&source, Some(&Key::from("abc")), &entry);
        assert!(!longer.starts_with(&source_key_prefix(&source, Some(&Key::from("ab")))));
    }

    #[test]
    fn test_corrupt_placement_key() {
        assert!(matches!(
            decode_placement_key(&[0u8; 10]),
            Err(CwError::Storage(_))
        ));
    }
}
