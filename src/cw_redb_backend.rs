// redb storage backend
//
// Persists the six store tables in a single redb database file. Each table is
// a `&[u8] -> &[u8]` redb table; a batch is applied in one write transaction.

use std::ops::Bound;
use std::path::Path;

use parking_lot::RwLock;
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition};

use crate::cw_error::CwError;
use crate::cw_storage::{Row, RowIter, StorageBatch, StoreBackend, StoreSnapshot, Table};

const COMMITS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("commits");
const CHAIN_HEADS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chain_heads");
const CONTAINERS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("containers");
const ENTRIES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");
const EXITS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("exits");
const CLAIMED_CHAINS_TABLE: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("claimed_chains");

fn definition(table: Table) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match table {
        Table::Commits => COMMITS_TABLE,
        Table::ChainHeads => CHAIN_HEADS_TABLE,
        Table::Containers => CONTAINERS_TABLE,
        Table::Entries => ENTRIES_TABLE,
        Table::Exits => EXITS_TABLE,
        Table::ClaimedChains => CLAIMED_CHAINS_TABLE,
    }
}

/// Durable backend over one redb file
///
/// `close` drops the database handle, releasing the file so it can be
/// reopened; any later operation fails with `StoreClosed`.
pub struct RedbBackend {
    db: RwLock<Option<Database>>,
}

impl RedbBackend {
    /// Open or create the database at `path` and make sure all tables exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CwError> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        for table in Table::ALL {
            let _ = write_txn.open_table(definition(table))?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: RwLock::new(Some(db)),
        })
    }

    fn begin_read(&self) -> Result<ReadTransaction, CwError> {
        let db = self.db.read();
        let db = db.as_ref().ok_or(CwError::StoreClosed)?;
        Ok(db.begin_read()?)
    }
}

impl StoreBackend for RedbBackend {
    fn snapshot(&self) -> Result<Box<dyn StoreSnapshot + '_>, CwError> {
        Ok(Box::new(RedbSnapshot {
            txn: self.begin_read()?,
        }))
    }

    fn begin_batch(&self) -> Box<dyn StorageBatch + '_> {
        Box::new(RedbBatch {
            backend: self,
            puts: Vec::new(),
        })
    }

    fn close(&self) -> Result<(), CwError> {
        self.db.write().take();
        Ok(())
    }
}

struct RedbSnapshot {
    txn: ReadTransaction,
}

impl StoreSnapshot for RedbSnapshot {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, CwError> {
        let table = self.txn.open_table(definition(table))?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan(
        &self,
        table: Table,
        lower: &[u8],
        upper: Option<&[u8]>,
        reverse: bool,
    ) -> Result<RowIter<'_>, CwError> {
        if matches!(upper, Some(u) if u <= lower) {
            return Ok(Box::new(std::iter::empty()));
        }
        let table = self.txn.open_table(definition(table))?;
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (
            Bound::Included(lower),
            upper.map_or(Bound::Unbounded, Bound::Excluded),
        );

        // rows are read as the caller pulls them
        let rows = table
            .range::<&[u8]>(bounds)?
            .map(|item| -> Result<Row, CwError> {
                let (key, value) = item?;
                Ok((key.value().to_vec(), value.value().to_vec()))
            });
        if reverse {
            Ok(Box::new(rows.rev()))
        } else {
            Ok(Box::new(rows))
        }
    }
}

/// Batch for the redb backend, applied in a single write transaction
pub struct RedbBatch<'a> {
    backend: &'a RedbBackend,
    puts: Vec<(Table, Vec<u8>, Vec<u8>)>,
}

impl StorageBatch for RedbBatch<'_> {
    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) {
        self.puts.push((table, key.to_vec(), value.to_vec()));
    }

    fn len(&self) -> usize {
        self.puts.len()
    }

    fn commit(self: Box<Self>) -> Result<(), CwError> {
        let db = self.backend.db.read();
        let db = db.as_ref().ok_or(CwError::StoreClosed)?;

        let write_txn = db.begin_write()?;
        {
            for table in Table::ALL {
                let rows: Vec<_> = self.puts.iter().filter(|(t, _, _)| *t == table).collect();
                if rows.is_empty() {
                    continue;
                }
                let mut handle = write_txn.open_table(definition(table))?;
                for (_, key, value) in rows {
                    handle.insert(key.as_slice(), value.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_redb_tables_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.redb");

        {
            let backend = RedbBackend::open(&path).unwrap();
            let mut batch = backend.begin_batch();
            batch.put(Table::ClaimedChains, &[7], &[1, 2]);
            batch.put(Table::Commits, &[1], b"one");
            batch.put(Table::Commits, &[2], b"two");
            batch.commit().unwrap();
            backend.close().unwrap();
        }

        let backend = RedbBackend::open(&path).unwrap();
        let snapshot = backend.snapshot().unwrap();
        assert_eq!(
            snapshot.get(Table::ClaimedChains, &[7]).unwrap(),
            Some(vec![1, 2])
        );
        let values: Vec<Vec<u8>> = snapshot
            .scan(Table::Commits, &[], None, true)
            .unwrap()
            .map(|row| row.unwrap().1)
            .collect();
        assert_eq!(values, vec![b"two".to_vec(), b"one".to_vec()]);
    }

    #[test]
    fn test_redb_scan_bounds_and_direction() {
        let dir = TempDir::new().unwrap();
        let backend = RedbBackend::open(dir.path().join("scan.redb")).unwrap();
        let mut batch = backend.begin_batch();
        for key in 1u8..=5 {
            batch.put(Table::Entries, &[key], &[key * 10]);
        }
        batch.commit().unwrap();

        let snapshot = backend.snapshot().unwrap();
        let keys = |rows: RowIter<'_>| -> Vec<u8> { rows.map(|row| row.unwrap().0[0]).collect() };

        assert_eq!(
            keys(snapshot.scan(Table::Entries, &[2], Some(&[5]), false).unwrap()),
            vec![2, 3, 4]
        );
        assert_eq!(
            keys(snapshot.scan(Table::Entries, &[2], Some(&[5]), true).unwrap()),
            vec![4, 3, 2]
        );
        assert_eq!(
            keys(Box::new(snapshot.scan(Table::Entries, &[], None, true).unwrap().take(2))),
            vec![5, 4]
        );
        assert_eq!(
            snapshot.scan(Table::Entries, &[4], Some(&[4]), false).unwrap().count(),
            0
        );
    }

    #[test]
    fn test_closed_backend_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let backend = RedbBackend::open(dir.path().join("closed.redb")).unwrap();
        backend.close().unwrap();

        assert!(matches!(backend.snapshot(), Err(CwError::StoreClosed)));
        let mut batch = backend.begin_batch();
        batch.put(Table::Commits, &[1], &[1]);
        assert!(matches!(batch.commit(), Err(CwError::StoreClosed)));
    }
}
