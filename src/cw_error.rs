use thiserror::Error;

use crate::cw_interface::{ChainStart, ConnectionId, Medallion, Offset, Timestamp};

/// Every failure the commit store, sequencers and the sync layer can report.
///
/// The harmless re-delivery of an already stored commit is not an error:
/// `CommitStore::add_commit` signals it with `Ok(None)`.
#[derive(Error, Debug)]
pub enum CwError {
    #[error("chain {medallion:x}/{chain_start}: prior time {found} does not match head {expected}")]
    ChainContinuity {
        medallion: Medallion,
        chain_start: ChainStart,
        expected: Timestamp,
        found: Timestamp,
    },

    #[error("chain {medallion:x}/{chain_start} has no recorded start")]
    UnknownChain {
        medallion: Medallion,
        chain_start: ChainStart,
    },

    #[error("commit has already been sealed")]
    AlreadySealed,

    #[error("medallion {medallion:x} is already claimed")]
    ChainClaimConflict { medallion: Medallion },

    #[error("cannot look back {requested} commits, only {available} stored")]
    AsOfOutOfRange { requested: u32, available: u32 },

    #[error("change at offset {offset} has no recognized kind")]
    UnsupportedChangeKind { offset: Offset },

    #[error("unable to parse message: {0}")]
    ProtocolParse(#[from] prost::DecodeError),

    #[error("malformed commit: {0}")]
    MalformedCommit(String),

    #[error("timestamp {requested} does not advance past {last}")]
    TimestampRegression { last: Timestamp, requested: Timestamp },

    #[error("no peer with connection id {0}")]
    UnknownPeer(ConnectionId),

    #[error("transport is closed")]
    TransportClosed,

    #[error("commit store is closed")]
    StoreClosed,

    #[error("chain sequencer stopped before the commit was applied")]
    SequencerStopped,

    #[error("commit listener failed: {0}")]
    Listener(String),

    #[error("corrupt storage record: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CwError {
    /// True for faults that mean a peer sent data that can never be applied
    /// here, as opposed to local failures.
    pub fn is_chain_violation(&self) -> bool {
        matches!(
            self,
            CwError::ChainContinuity { .. } | CwError::UnknownChain { .. }
        )
    }

    /// True for undecodable or structurally invalid commit data.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            CwError::ProtocolParse(_)
                | CwError::MalformedCommit(_)
                | CwError::UnsupportedChangeKind { .. }
        )
    }
}
