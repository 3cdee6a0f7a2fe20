//! Chain Sequencer
//!
//! Serializes commits onto one chain. Each sequencer owns a worker thread
//! that drains a FIFO queue, so commits are sealed and stored in exactly the
//! order `add_commit` was called, and every assigned timestamp is strictly
//! greater than the one before it on the chain.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use chainweave::cw_chain_sequencer::{ChainSequencer, SequencerConfig};
//! use chainweave::cw_commit::PendingCommit;
//! use chainweave::cw_commit_store::CommitStore;
//! use chainweave::cw_interface::CommitSink;
//!
//! let store = Arc::new(CommitStore::in_memory());
//! let sink: Arc<dyn CommitSink> = store.clone();
//! let sequencer = ChainSequencer::acquire(store.clone(), sink, &SequencerConfig::default()).unwrap();
//!
//! let timestamp = sequencer.add_commit(&PendingCommit::with_comment("hello"), None).wait().unwrap();
//! assert!(timestamp > sequencer.chain().chain_start);
//! sequencer.close().unwrap();
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::cw_commit::PendingCommit;
use crate::cw_commit_store::CommitStore;
use crate::cw_error::CwError;
use crate::cw_interface::{micros_since_epoch, ChainKey, CommitSink, Medallion, Timestamp};

/// Medallions are drawn from this range.
const MEDALLION_MIN: Medallion = (1 << 48) + 1;
const MEDALLION_MAX: Medallion = (1 << 49) - 1;

/// Source of microsecond wall-clock readings.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> Timestamp {
        micros_since_epoch(SystemTime::now())
    }
}

/// Configuration for chain sequencers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Comment placed on the commit that starts a new chain
    pub start_comment: String,

    /// Sleep between clock readings while waiting for time to advance (0 spins)
    pub clock_poll_micros: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            start_comment: "start".to_string(),
            clock_poll_micros: 1,
        }
    }
}

struct QueuedCommit {
    pending: PendingCommit,
    timestamp: Option<Timestamp>,
    reply: oneshot::Sender<Result<Timestamp, CwError>>,
}

/// Completion handle for one queued commit.
///
/// Resolves to the assigned timestamp once the commit has been accepted by
/// the store. Can be awaited or waited on from a plain thread.
pub struct CommitTicket {
    receiver: oneshot::Receiver<Result<Timestamp, CwError>>,
}

impl CommitTicket {
    /// Block the current thread until the commit is applied.
    ///
    /// Must not be called from inside an async runtime; await the ticket there.
    pub fn wait(self) -> Result<Timestamp, CwError> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(CwError::SequencerStopped))
    }
}

impl Future for CommitTicket {
    type Output = Result<Timestamp, CwError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CwError::SequencerStopped)))
    }
}

/// Exclusive writer handle for one chain.
pub struct ChainSequencer {
    chain: ChainKey,
    store: Arc<CommitStore>,
    queue: Option<mpsc::UnboundedSender<QueuedCommit>>,
    worker: Option<JoinHandle<()>>,
}

impl ChainSequencer {
    /// Take over an idle claimed chain, or start a new one.
    ///
    /// Sealed commits are handed to `sink`, which is expected to store them
    /// in `store` (directly, or through a sync coordinator).
    pub fn acquire(
        store: Arc<CommitStore>,
        sink: Arc<dyn CommitSink>,
        config: &SequencerConfig,
    ) -> Result<Self, CwError> {
        Self::acquire_with_clock(store, sink, config, Arc::new(SystemClock))
    }

    pub fn acquire_with_clock(
        store: Arc<CommitStore>,
        sink: Arc<dyn CommitSink>,
        config: &SequencerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CwError> {
        if let Some(chain) = store.lease_available_chain()? {
            let resumed = match store.get_chain_info(chain) {
                Ok(Some(head)) => Self::start(chain, head.timestamp, store.clone(), sink, clock, config),
                Ok(None) => Err(CwError::UnknownChain {
                    medallion: chain.medallion,
                    chain_start: chain.chain_start,
                }),
                Err(err) => Err(err),
            };
            if resumed.is_err() {
                store.release(chain.medallion);
            } else {
                log::debug!("resumed chain {:x}/{}", chain.medallion, chain.chain_start);
            }
            return resumed;
        }

        let medallion = loop {
            let candidate = rand::thread_rng().gen_range(MEDALLION_MIN..=MEDALLION_MAX);
            if store.lease(candidate) {
                break candidate;
            }
        };
        let chain = ChainKey::new(medallion, clock.now_micros());
        let started = Self::mint(chain, &store, &*sink, config)
            .and_then(|()| Self::start(chain, chain.chain_start, store.clone(), sink, clock, config));
        match started {
            Ok(sequencer) => {
                log::info!("started chain {:x}/{}", chain.medallion, chain.chain_start);
                Ok(sequencer)
            }
            Err(err) => {
                store.release(medallion);
                Err(err)
            }
        }
    }

    /// Store the chain-start commit and claim the chain.
    fn mint(
        chain: ChainKey,
        store: &CommitStore,
        sink: &dyn CommitSink,
        config: &SequencerConfig,
    ) -> Result<(), CwError> {
        let (_, bytes) = PendingCommit::with_comment(config.start_comment.clone()).seal(
            chain,
            None,
            chain.chain_start,
        )?;
        sink.accept(&bytes)?;
        store.claim_chain(chain)
    }

    fn start(
        chain: ChainKey,
        last: Timestamp,
        store: Arc<CommitStore>,
        sink: Arc<dyn CommitSink>,
        clock: Arc<dyn Clock>,
        config: &SequencerConfig,
    ) -> Result<Self, CwError> {
        let (queue, receiver) = mpsc::unbounded_channel();
        let worker = SequencerWorker {
            chain,
            last,
            sink,
            clock,
            poll: Duration::from_micros(config.clock_poll_micros),
        };
        let handle = std::thread::Builder::new()
            .name(format!("chain-{:x}", chain.medallion))
            .spawn(move || worker.run(receiver))?;

        Ok(Self {
            chain,
            store,
            queue: Some(queue),
            worker: Some(handle),
        })
    }

    pub fn chain(&self) -> ChainKey {
        self.chain
    }

    pub fn medallion(&self) -> Medallion {
        self.chain.medallion
    }

    /// Queue `pending` for sealing onto this chain.
    ///
    /// An explicit `timestamp` must exceed the chain's last timestamp when
    /// the commit reaches the front of the queue, otherwise the ticket fails
    /// with `TimestampRegression`. If the store rejects the commit, `pending`
    /// is left unsealed and may be queued again.
    pub fn add_commit(&self, pending: &PendingCommit, timestamp: Option<Timestamp>) -> CommitTicket {
        let (reply, receiver) = oneshot::channel();
        if let Some(queue) = &self.queue {
            // a closed queue drops the reply sender, failing the ticket
            let _ = queue.send(QueuedCommit {
                pending: pending.clone(),
                timestamp,
                reply,
            });
        }
        CommitTicket { receiver }
    }

    /// Finish every queued commit, stop the worker and release the chain.
    pub fn close(mut self) -> Result<(), CwError> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        // dropping the sender lets the worker drain the queue and exit
        if self.queue.take().is_none() {
            return;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("sequencer worker for {:x} panicked", self.chain.medallion);
            }
        }
        self.store.release(self.chain.medallion);
        log::debug!("released chain {:x}/{}", self.chain.medallion, self.chain.chain_start);
    }
}

impl Drop for ChainSequencer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Worker
// ============================================================================

struct SequencerWorker {
    chain: ChainKey,
    /// Timestamp of the newest commit stored on the chain
    last: Timestamp,
    sink: Arc<dyn CommitSink>,
    clock: Arc<dyn Clock>,
    poll: Duration,
}

impl SequencerWorker {
    fn run(mut self, mut receiver: mpsc::UnboundedReceiver<QueuedCommit>) {
        while let Some(queued) = receiver.blocking_recv() {
            let result = self.apply(&queued.pending, queued.timestamp);
            if let Err(err) = &result {
                log::debug!("commit on {:x} failed: {}", self.chain.medallion, err);
            }
            let _ = queued.reply.send(result);
        }
    }

    fn apply(&mut self, pending: &PendingCommit, timestamp: Option<Timestamp>) -> Result<Timestamp, CwError> {
        let timestamp = match timestamp {
            Some(requested) if requested <= self.last => {
                return Err(CwError::TimestampRegression {
                    last: self.last,
                    requested,
                })
            }
            Some(requested) => requested,
            None => self.next_timestamp(),
        };

        let (info, bytes) = pending.seal(self.chain, Some(self.last), timestamp)?;
        match self.sink.accept(&bytes) {
            Ok(_) => {
                self.last = timestamp;
                Ok(timestamp)
            }
            // listeners only run after the commit has been stored
            Err(err @ CwError::Listener(_)) => {
                self.last = timestamp;
                Err(err)
            }
            Err(err) => {
                pending.unseal(&info);
                Err(err)
            }
        }
    }

    /// Wait until the clock moves past the last assigned timestamp.
    fn next_timestamp(&self) -> Timestamp {
        loop {
            let now = self.clock.now_micros();
            if now > self.last {
                return now;
            }
            if self.poll.is_zero() {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(self.poll);
            }
        }
    }
}
