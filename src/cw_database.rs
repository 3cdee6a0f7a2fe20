//! Database
//!
//! Wires one commit store, its sync coordinator and chain acquisition
//! together. Commits made through a sequencer from `acquire_chain` go through
//! the coordinator, so they reach connected peers and local listeners the
//! same way received commits do.
//!
//! # Example
//!
//! ```
//! use chainweave::cw_commit::{Change, EntryValue, PendingCommit};
//! use chainweave::cw_database::Database;
//! use chainweave::cw_interface::{AsOf, EntryLookup, Key, Muid};
//!
//! let db = Database::in_memory();
//! let chain = db.acquire_chain().unwrap();
//!
//! let pending = PendingCommit::new();
//! pending
//!     .add_change(Change::entry(Muid::ROOT, Some(Key::from("greeting")), EntryValue::Scalar(b"hi".to_vec())))
//!     .unwrap();
//! chain.add_commit(&pending, None).wait().unwrap();
//!
//! let found = db
//!     .store()
//!     .get_entry(Muid::ROOT, &EntryLookup::Key(Key::from("greeting")), AsOf::Latest)
//!     .unwrap();
//! assert!(found.is_some());
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::cw_chain_sequencer::{ChainSequencer, SequencerConfig};
use crate::cw_commit_store::CommitStore;
use crate::cw_error::CwError;
use crate::cw_interface::{CommitInfo, ConnectionId, PeerTransport};
use crate::cw_sync::SyncCoordinator;

/// Where commits are persisted
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    Redb {
        path: PathBuf,
    },
}

/// Top-level configuration, loadable from YAML
///
/// ```yaml
/// storage:
///   kind: redb
///   path: /var/lib/chainweave/store.redb
/// sequencer:
///   start_comment: start
///   clock_poll_micros: 1
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub storage: StorageConfig,
    pub sequencer: SequencerConfig,
}

impl DatabaseConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CwError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

pub struct Database {
    store: Arc<CommitStore>,
    sync: Arc<SyncCoordinator>,
    config: DatabaseConfig,
}

impl Database {
    pub fn open(config: DatabaseConfig) -> Result<Self, CwError> {
        let store = match &config.storage {
            StorageConfig::Memory => CommitStore::in_memory(),
            StorageConfig::Redb { path } => CommitStore::open(path)?,
        };
        let store = Arc::new(store);
        let sync = Arc::new(SyncCoordinator::new(store.clone()));
        log::info!("opened database ({:?})", config.storage);
        Ok(Self {
            store,
            sync,
            config,
        })
    }

    pub fn in_memory() -> Self {
        let store = Arc::new(CommitStore::in_memory());
        Self {
            sync: Arc::new(SyncCoordinator::new(store.clone())),
            store,
            config: DatabaseConfig::default(),
        }
    }

    pub fn store(&self) -> &Arc<CommitStore> {
        &self.store
    }

    pub fn sync(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Sequencer for an idle claimed chain, or for a newly started one.
    pub fn acquire_chain(&self) -> Result<ChainSequencer, CwError> {
        ChainSequencer::acquire(self.store.clone(), self.sync.clone(), &self.config.sequencer)
    }

    /// See `SyncCoordinator::add_listener`; a listener must not commit
    /// through this database.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&[u8], &CommitInfo) -> Result<(), CwError> + Send + Sync + 'static,
    {
        self.sync.add_listener(listener)
    }

    pub fn connect(&self, transport: Arc<dyn PeerTransport>) -> Result<ConnectionId, CwError> {
        self.sync.connect(transport)
    }

    pub fn receive_message(&self, from: ConnectionId, bytes: &[u8]) -> Result<(), CwError> {
        self.sync.receive_message(from, bytes)
    }

    pub fn disconnect(&self, connection: ConnectionId) -> Result<(), CwError> {
        self.sync.disconnect(connection)
    }

    /// Close peers and the store. Sequencers should be closed first so their
    /// queued commits are stored.
    pub fn close(&self) -> Result<(), CwError> {
        self.sync.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cw_commit::PendingCommit;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_config_from_yaml() {
        let config = DatabaseConfig::from_yaml_str(
            "storage:\n  kind: redb\n  path: /tmp/x.redb\nsequencer:\n  start_comment: hello\n",
        )
        .unwrap();
        assert_eq!(
            config.storage,
            StorageConfig::Redb {
                path: PathBuf::from("/tmp/x.redb")
            }
        );
        assert_eq!(config.sequencer.start_comment, "hello");
        assert_eq!(config.sequencer.clock_poll_micros, 1);

        let empty = DatabaseConfig::from_yaml_str("{}").unwrap();
        assert_eq!(empty.storage, StorageConfig::Memory);

        assert!(matches!(
            DatabaseConfig::from_yaml_str("storage: [1, 2"),
            Err(CwError::Config(_))
        ));
    }

    #[test]
    fn test_local_commits_reach_listeners() {
        let db = Database::in_memory();
        let heard = Arc::new(Mutex::new(Vec::new()));
        let sink = heard.clone();
        db.add_listener(move |_, info| {
            sink.lock().push(info.timestamp);
            Ok(())
        });

        let chain = db.acquire_chain().unwrap();
        let timestamp = chain
            .add_commit(&PendingCommit::with_comment("one"), None)
            .wait()
            .unwrap();
        chain.close().unwrap();

        // chain start and the commit
        let heard = heard.lock().clone();
        assert_eq!(heard.len(), 2);
        assert_eq!(heard[1], timestamp);
    }

    #[test]
    fn test_redb_database_resumes_chain() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            storage: StorageConfig::Redb {
                path: dir.path().join("db.redb"),
            },
            ..Default::default()
        };

        let (chain, last) = {
            let db = Database::open(config.clone()).unwrap();
            let sequencer = db.acquire_chain().unwrap();
            let last = sequencer
                .add_commit(&PendingCommit::new(), None)
                .wait()
                .unwrap();
            let chain = sequencer.chain();
            sequencer.close().unwrap();
            db.close().unwrap();
            (chain, last)
        };

        let db = Database::open(config).unwrap();
        let sequencer = db.acquire_chain().unwrap();
        assert_eq!(sequencer.chain(), chain);
        let next = sequencer
            .add_commit(&PendingCommit::new(), None)
            .wait()
            .unwrap();
        assert!(next > last);
        assert_eq!(db.store().get_commit_infos().unwrap().len(), 3);
    }
}
