//! # chainweave - Replicated Append-Only Commit Store
//!
//! The storage and replication engine of a multi-writer data store. Every
//! writer appends immutable commits to its own chains; replicas converge by
//! gossiping the commits the other side is missing.
//!
//! ## Core Components
//!
//! - **ChainSequencer**: serializes commits onto one chain with strictly increasing timestamps
//! - **CommitStore**: durable commit log with chain continuity checks, exits and as-of queries
//! - **ChainTracker**: per-chain watermarks, exchanged as greetings
//! - **SyncCoordinator**: greeting/commit gossip with peers and local listeners
//! - **Database**: wires the above together
//!
//! ## Usage with Network Layer
//!
//! The library does not own sockets. You need to:
//! 1. Implement `PeerTransport` for your connection type
//! 2. Call `Database::connect` when a connection is established
//! 3. Pass every received message to `Database::receive_message`
//!
//! ```no_run
//! use std::sync::Arc;
//! use chainweave::cw_commit::PendingCommit;
//! use chainweave::cw_database::{Database, DatabaseConfig};
//! use chainweave::cw_transport::MemoryTransport;
//!
//! let config = DatabaseConfig::from_yaml_str("storage:\n  kind: redb\n  path: store.redb\n").unwrap();
//! let db = Database::open(config).unwrap();
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let peer = db.connect(transport.clone()).unwrap();
//!
//! let chain = db.acquire_chain().unwrap();
//! chain.add_commit(&PendingCommit::with_comment("hello"), None).wait().unwrap();
//!
//! // ship transport.drain() to the peer; feed its replies back with
//! // db.receive_message(peer, &bytes)
//! ```
//!
//! ## Simulation
//!
//! `simulator/gossip_sim.rs` runs YAML scenarios of in-memory replicas
//! connected in line, ring or full-mesh topologies.

// Shared types and wire format
pub mod cw_error;
pub mod cw_interface;
pub mod cw_wire;

// Commit construction and chain bookkeeping
pub mod cw_chain_sequencer;
pub mod cw_chain_tracker;
pub mod cw_commit;

// Storage
pub mod cw_commit_store;
pub mod cw_memory_backend;
pub mod cw_redb_backend;
pub mod cw_storage;

// Replication
pub mod cw_database;
pub mod cw_sync;
pub mod cw_transport;

// Re-export commonly used types
pub use cw_chain_sequencer::{ChainSequencer, CommitTicket, SequencerConfig};
pub use cw_chain_tracker::ChainTracker;
pub use cw_commit::{Change, EntryValue, PendingCommit};
pub use cw_commit_store::CommitStore;
pub use cw_database::{Database, DatabaseConfig, StorageConfig};
pub use cw_error::CwError;
pub use cw_interface::{
    AsOf, ChainInfo, ChainKey, CommitInfo, CommitSink, EntryLookup, FoundEntry, Key, Muid,
    PeerTransport,
};
pub use cw_sync::SyncCoordinator;
