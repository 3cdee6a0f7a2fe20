// In-memory storage backend
//
// Keeps every table in a BTreeMap so scans come out in key order. Used for
// tests, simulation and ephemeral replicas.
//
// For persistent storage, see cw_redb_backend.rs

use std::collections::btree_map::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

use parking_lot::{RwLock, RwLockReadGuard};

use crate::cw_error::CwError;
use crate::cw_storage::{Row, RowIter, StorageBatch, StoreBackend, StoreSnapshot, Table};

type Tables = [BTreeMap<Vec<u8>, Vec<u8>>; 6];

/// In-memory backend holding all six tables behind one lock
///
/// Snapshots hold the read lock for their lifetime, so a batch commit waits
/// until outstanding snapshots are dropped.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in one table
    pub fn row_count(&self, table: Table) -> usize {
        self.tables.read()[table.index()].len()
    }
}

impl StoreBackend for MemoryBackend {
    fn snapshot(&self) -> Result<Box<dyn StoreSnapshot + '_>, CwError> {
        Ok(Box::new(MemorySnapshot {
            tables: self.tables.read(),
        }))
    }

    fn begin_batch(&self) -> Box<dyn StorageBatch + '_> {
        Box::new(MemoryBatch {
            backend: self,
            puts: Vec::new(),
        })
    }
}

struct MemorySnapshot<'a> {
    tables: RwLockReadGuard<'a, Tables>,
}

impl StoreSnapshot for MemorySnapshot<'_> {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, CwError> {
        Ok(self.tables[table.index()].get(key).cloned())
    }

    fn scan(
        &self,
        table: Table,
        lower: &[u8],
        upper: Option<&[u8]>,
        reverse: bool,
    ) -> Result<RowIter<'_>, CwError> {
        let upper = match upper {
            Some(u) if u <= lower => return Ok(Box::new(std::iter::empty())),
            Some(u) => Excluded(u),
            None => Unbounded,
        };
        let range = self.tables[table.index()]
            .range::<[u8], _>((Included(lower), upper))
            .map(|(k, v)| Ok::<Row, CwError>((k.clone(), v.clone())));
        if reverse {
            Ok(Box::new(range.rev()))
        } else {
            Ok(Box::new(range))
        }
    }
}

/// Batch for memory backend
///
/// Collects writes and applies them all under one write lock at commit time.
pub struct MemoryBatch<'a> {
    backend: &'a MemoryBackend,
    puts: Vec<(Table, Vec<u8>, Vec<u8>)>,
}

impl StorageBatch for MemoryBatch<'_> {
    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) {
        self.puts.push((table, key.to_vec(), value.to_vec()));
    }

    fn len(&self) -> usize {
        self.puts.len()
    }

    fn commit(self: Box<Self>) -> Result<(), CwError> {
        let mut tables = self.backend.tables.write();
        for (table, key, value) in self.puts {
            tables[table.index()].insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(iter: RowIter<'_>) -> Vec<Vec<u8>> {
        iter.map(|row| row.unwrap().0).collect()
    }

    #[test]
    fn test_batch_is_invisible_until_commit() {
        let backend = MemoryBackend::new();
        let mut batch = backend.begin_batch();
        batch.put(Table::Entries, &[1], &[10]);
        batch.put(Table::Exits, &[1], &[11]);
        assert_eq!(batch.len(), 2);
        assert_eq!(backend.row_count(Table::Entries), 0);

        batch.commit().unwrap();
        assert_eq!(backend.row_count(Table::Entries), 1);
        assert_eq!(backend.row_count(Table::Exits), 1);
    }

    #[test]
    fn test_scan_bounds_and_direction() {
        let backend = MemoryBackend::new();
        let mut batch = backend.begin_batch();
        for key in [[1u8, 0], [1, 5], [2, 0], [2, 9], [3, 1]] {
            batch.put(Table::Commits, &key, b"");
        }
        batch.commit().unwrap();

        let snapshot = backend.snapshot().unwrap();
        assert_eq!(
            keys(snapshot.scan_prefix(Table::Commits, &[2], false).unwrap()),
            vec![vec![2, 0], vec![2, 9]]
        );
        assert_eq!(
            keys(snapshot.scan_prefix(Table::Commits, &[2], true).unwrap()),
            vec![vec![2, 9], vec![2, 0]]
        );
        assert_eq!(
            keys(snapshot.scan(Table::Commits, &[1, 5], None, false).unwrap()).len(),
            4
        );
        assert_eq!(
            keys(snapshot.scan(Table::Commits, &[3], Some(&[2]), false).unwrap()).len(),
            0
        );
        assert!(snapshot.get(Table::ChainHeads, &[1, 0]).unwrap().is_none());
    }
}
