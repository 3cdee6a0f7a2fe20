//! Commit Store
//!
//! Durable log of commits plus the indices derived from them: chain heads,
//! containers, entries and exits. Every accepted commit is written as one
//! atomic batch after its chain continuity has been checked against the
//! current head under the store's write lock.
//!
//! Each chain moves from unknown to started when its chain-start commit is
//! accepted, and its head advances with every later commit whose prior time
//! equals the current head. Re-delivery of anything at or below the head is
//! a no-op reported as `Ok(None)`.
//!
//! # Example
//!
//! ```
//! use chainweave::cw_commit::PendingCommit;
//! use chainweave::cw_commit_store::CommitStore;
//! use chainweave::cw_interface::ChainKey;
//!
//! let store = CommitStore::in_memory();
//! let chain = ChainKey::new(0x1_0000_0000_0001, 1_000);
//! let (_, start) = PendingCommit::with_comment("start").seal(chain, None, 1_000).unwrap();
//!
//! assert!(store.add_commit(&start).unwrap().is_some());
//! assert!(store.add_commit(&start).unwrap().is_none());
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashSet;
use parking_lot::Mutex;
use prost::Message;

use crate::cw_chain_tracker::ChainTracker;
use crate::cw_commit::decode_changes;
use crate::cw_error::CwError;
use crate::cw_interface::{
    micros_since_epoch, AsOf, ChainInfo, ChainKey, CommitInfo, CommitSink, EntryLookup,
    FoundEntry, Key, Medallion, Muid, Timestamp,
};
use crate::cw_memory_backend::MemoryBackend;
use crate::cw_redb_backend::RedbBackend;
use crate::cw_storage::{
    chain_key, claim_key, commit_key, decode_commit_key, decode_placement_key, placement_key,
    read_u64, source_key_prefix, source_prefix, StoreBackend, StoreSnapshot, Table,
};
use crate::cw_wire::{change_proto, entry_proto, CommitProto, EntryProto, MuidProto};

pub struct CommitStore {
    backend: Box<dyn StoreBackend>,
    /// Serializes head checks with the batch that advances the head
    write_lock: Mutex<()>,
    /// Medallions currently held by a sequencer in this process
    leases: Mutex<HashSet<Medallion>>,
    closed: AtomicBool,
}

impl CommitStore {
    pub fn new(backend: Box<dyn StoreBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
            leases: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    /// Open (or create) a durable store backed by a redb file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CwError> {
        Ok(Self::new(Box::new(RedbBackend::open(path)?)))
    }

    fn snapshot(&self) -> Result<Box<dyn StoreSnapshot + '_>, CwError> {
        if self.is_closed() {
            return Err(CwError::StoreClosed);
        }
        self.backend.snapshot()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Validate and persist one serialized commit.
    ///
    /// Returns the commit's info when it was new, `Ok(None)` when the chain
    /// head is already at or past it.
    pub fn add_commit(&self, bytes: &[u8]) -> Result<Option<CommitInfo>, CwError> {
        if self.is_closed() {
            return Err(CwError::StoreClosed);
        }
        let proto = CommitProto::decode(bytes)?;
        let info = CommitInfo::from(&proto);
        info.validate()?;
        if proto.changes.contains_key(&0) {
            return Err(CwError::MalformedCommit(format!(
                "commit {} has a change at offset 0",
                info.timestamp
            )));
        }
        decode_changes(&proto)?;

        let chain = info.chain();
        let _guard = self.write_lock.lock();
        let snapshot = self.snapshot()?;

        match read_head(snapshot.as_ref(), &chain)? {
            None if !info.is_chain_start() => {
                return Err(CwError::UnknownChain {
                    medallion: chain.medallion,
                    chain_start: chain.chain_start,
                });
            }
            Some(head) if info.timestamp <= head.timestamp => return Ok(None),
            Some(head) if info.prior_time != Some(head.timestamp) => {
                return Err(CwError::ChainContinuity {
                    medallion: chain.medallion,
                    chain_start: chain.chain_start,
                    expected: head.timestamp,
                    found: info.prior_time.unwrap_or(0),
                });
            }
            _ => {}
        }

        let mut batch = self.backend.begin_batch();
        batch.put(
            Table::Commits,
            &commit_key(info.timestamp, info.medallion),
            bytes,
        );
        batch.put(Table::ChainHeads, &chain_key(&chain), &info.to_header_bytes());

        let mut exits_in_batch: HashSet<Vec<u8>> = HashSet::new();
        for (offset, change) in &proto.changes {
            let address = Muid::local(*offset).resolve(&info);
            match change.kind.as_ref() {
                Some(change_proto::Kind::Container(container)) => {
                    batch.put(
                        Table::Containers,
                        &address.to_bytes(),
                        &container.encode_to_vec(),
                    );
                }
                Some(change_proto::Kind::Entry(entry)) => {
                    let source = resolve_proto(entry.source.as_ref(), &info);
                    let key = entry.key.as_ref().and_then(Key::from_proto);
                    let record = normalize_entry(entry, source, &info);
                    batch.put(
                        Table::Entries,
                        &placement_key(&source, key.as_ref(), &address),
                        &record.encode_to_vec(),
                    );
                }
                Some(change_proto::Kind::Exit(exit)) => {
                    let source = resolve_proto(exit.source.as_ref(), &info);
                    let key = exit.key.as_ref().and_then(Key::from_proto);
                    let entry = resolve_proto(exit.entry.as_ref(), &info);
                    let exit_key = placement_key(&source, key.as_ref(), &entry);
                    // first exit persisted for an entry wins
                    if exits_in_batch.contains(&exit_key)
                        || snapshot.get(Table::Exits, &exit_key)?.is_some()
                    {
                        log::debug!("dropping duplicate exit of entry {}", entry);
                        continue;
                    }
                    batch.put(Table::Exits, &exit_key, &info.timestamp.to_be_bytes());
                    exits_in_batch.insert(exit_key);
                }
                None => return Err(CwError::UnsupportedChangeKind { offset: *offset }),
            }
        }

        drop(snapshot);
        let writes = batch.len();
        batch.commit()?;
        log::debug!(
            "accepted commit {:x}/{} at {} ({} changes, {} writes)",
            info.medallion,
            info.chain_start,
            info.timestamp,
            proto.changes.len(),
            writes
        );
        Ok(Some(info))
    }

    /// Record that this replica may append to `chain`.
    pub fn claim_chain(&self, chain: ChainKey) -> Result<(), CwError> {
        let _guard = self.write_lock.lock();
        let snapshot = self.snapshot()?;
        if snapshot
            .get(Table::ClaimedChains, &claim_key(chain.medallion))?
            .is_some()
        {
            return Err(CwError::ChainClaimConflict {
                medallion: chain.medallion,
            });
        }
        drop(snapshot);

        let mut batch = self.backend.begin_batch();
        batch.put(
            Table::ClaimedChains,
            &claim_key(chain.medallion),
            &chain.chain_start.to_be_bytes(),
        );
        batch.commit()
    }

    /// Idempotent. Every later operation fails with `StoreClosed`.
    pub fn close(&self) -> Result<(), CwError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        log::debug!("closing commit store");
        self.backend.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Entry queries
    // ========================================================================

    /// Latest visible entry in `source` for `lookup` as of `as_of`.
    ///
    /// An entry that is a deletion marker, or that was exited at or before
    /// `as_of`, is not visible.
    pub fn get_entry(
        &self,
        source: Muid,
        lookup: &EntryLookup,
        as_of: AsOf,
    ) -> Result<Option<FoundEntry>, CwError> {
        let snapshot = self.snapshot()?;
        let as_of = resolve_as_of(snapshot.as_ref(), as_of)?;

        let found = match lookup {
            EntryLookup::Address(address) => {
                let key = placement_key(&source, None, address);
                match snapshot.get(Table::Entries, &key)? {
                    Some(value) if address.timestamp <= as_of => Some((key, value)),
                    _ => None,
                }
            }
            EntryLookup::Unkeyed | EntryLookup::Key(_) => {
                let key = match lookup {
                    EntryLookup::Key(key) => Some(key),
                    _ => None,
                };
                let prefix = source_key_prefix(&source, key);
                let mut winner = None;
                for row in snapshot.scan_prefix(Table::Entries, &prefix, true)? {
                    let (key, value) = row?;
                    let (_, _, address) = decode_placement_key(&key)?;
                    if address.timestamp <= as_of {
                        winner = Some((key, value));
                        break;
                    }
                }
                winner
            }
        };

        match found {
            Some((key, value)) if is_visible(snapshot.as_ref(), &key, &value, as_of)? => {
                Ok(Some(found_entry(&key, value)?))
            }
            _ => Ok(None),
        }
    }

    /// Latest visible entry for every semantic key under `source`, in key order.
    pub fn get_entries(&self, source: Muid, as_of: AsOf) -> Result<Vec<FoundEntry>, CwError> {
        let snapshot = self.snapshot()?;
        let as_of = resolve_as_of(snapshot.as_ref(), as_of)?;

        // latest entry per key; rows arrive grouped by key, oldest first
        let mut latest: Vec<(Option<Key>, Vec<u8>, Vec<u8>)> = Vec::new();
        for row in snapshot.scan_prefix(Table::Entries, &source_prefix(&source), false)? {
            let (key, value) = row?;
            let (_, semantic, address) = decode_placement_key(&key)?;
            if semantic.is_none() || address.timestamp > as_of {
                continue;
            }
            match latest.last_mut() {
                Some(last) if last.0 == semantic => *last = (semantic, key, value),
                _ => latest.push((semantic, key, value)),
            }
        }

        let mut result = Vec::with_capacity(latest.len());
        for (_, key, value) in latest {
            if is_visible(snapshot.as_ref(), &key, &value, as_of)? {
                result.push(found_entry(&key, value)?);
            }
        }
        Ok(result)
    }

    /// Up to `|limit|` entries under `source` not exited as of `as_of`.
    ///
    /// Positive `limit` scans from the earliest entry, negative from the
    /// latest. The entries and exits indices share a key layout, so one pass
    /// with both cursors in lock-step finds the exited entries.
    pub fn get_visible_entries(
        &self,
        source: Muid,
        limit: i64,
        as_of: AsOf,
    ) -> Result<Vec<FoundEntry>, CwError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let reverse = limit < 0;
        let needed = limit.unsigned_abs() as usize;

        let snapshot = self.snapshot()?;
        let as_of = resolve_as_of(snapshot.as_ref(), as_of)?;
        let prefix = source_prefix(&source);
        let entries = snapshot.scan_prefix(Table::Entries, &prefix, reverse)?;
        let mut exits = snapshot.scan_prefix(Table::Exits, &prefix, reverse)?;
        let mut exit_row = exits.next().transpose()?;

        let mut result = Vec::new();
        for row in entries {
            if result.len() >= needed {
                break;
            }
            let (key, value) = row?;
            let (_, _, address) = decode_placement_key(&key)?;
            if address.timestamp > as_of {
                continue;
            }

            let mut exited = false;
            loop {
                let Some((exit_key, exit_value)) = exit_row.as_ref() else {
                    break;
                };
                let behind = if reverse {
                    *exit_key > key
                } else {
                    *exit_key < key
                };
                if behind {
                    exit_row = exits.next().transpose()?;
                    continue;
                }
                exited = *exit_key == key && read_u64(exit_value)? <= as_of;
                break;
            }
            if !exited {
                result.push(found_entry(&key, value)?);
            }
        }
        Ok(result)
    }

    /// Raw container record stored at `address`.
    pub fn get_container_bytes(&self, address: Muid) -> Result<Option<Vec<u8>>, CwError> {
        self.snapshot()?.get(Table::Containers, &address.to_bytes())
    }

    /// Resolve `as_of` to the newest timestamp a query should include.
    pub fn resolve_as_of(&self, as_of: AsOf) -> Result<Timestamp, CwError> {
        let snapshot = self.snapshot()?;
        resolve_as_of(snapshot.as_ref(), as_of)
    }

    // ========================================================================
    // Chains and commits
    // ========================================================================

    /// Tracker holding the head of every chain in the store.
    pub fn get_chain_tracker(&self) -> Result<ChainTracker, CwError> {
        let snapshot = self.snapshot()?;
        let mut tracker = ChainTracker::new();
        for row in snapshot.scan(Table::ChainHeads, &[], None, false)? {
            let (_, value) = row?;
            tracker.mark_if_novel(&CommitInfo::from_commit_bytes(&value)?);
        }
        Ok(tracker)
    }

    pub fn get_chain_info(&self, chain: ChainKey) -> Result<Option<ChainInfo>, CwError> {
        let snapshot = self.snapshot()?;
        read_head(snapshot.as_ref(), &chain)
    }

    /// Chains this replica may append to, ordered by medallion.
    pub fn get_claimed_chains(&self) -> Result<Vec<ChainKey>, CwError> {
        let snapshot = self.snapshot()?;
        let mut chains = Vec::new();
        for row in snapshot.scan(Table::ClaimedChains, &[], None, false)? {
            let (key, value) = row?;
            chains.push(ChainKey::new(read_u64(&key)?, read_u64(&value)?));
        }
        Ok(chains)
    }

    /// Stream every stored commit in (timestamp, medallion) order.
    ///
    /// The scan holds a read snapshot; callbacks needing further store I/O
    /// should buffer and act after the scan.
    pub fn get_commits<F>(&self, mut callback: F) -> Result<(), CwError>
    where
        F: FnMut(&[u8], &CommitInfo),
    {
        let snapshot = self.snapshot()?;
        for row in snapshot.scan(Table::Commits, &[], None, false)? {
            let (_, bytes) = row?;
            let info = CommitInfo::from_commit_bytes(&bytes)?;
            callback(&bytes, &info);
        }
        Ok(())
    }

    pub fn get_commit_infos(&self) -> Result<Vec<CommitInfo>, CwError> {
        let mut infos = Vec::new();
        self.get_commits(|_, info| infos.push(info.clone()))?;
        Ok(infos)
    }

    pub fn get_comment(
        &self,
        medallion: Medallion,
        timestamp: Timestamp,
    ) -> Result<Option<String>, CwError> {
        let snapshot = self.snapshot()?;
        match snapshot.get(Table::Commits, &commit_key(timestamp, medallion))? {
            Some(bytes) => Ok(CommitInfo::from_commit_bytes(&bytes)?.comment),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Chain leases
    // ========================================================================

    /// Lease a claimed chain that no sequencer in this process holds.
    pub fn lease_available_chain(&self) -> Result<Option<ChainKey>, CwError> {
        let claimed = self.get_claimed_chains()?;
        let mut leases = self.leases.lock();
        let available = claimed
            .into_iter()
            .find(|chain| !leases.contains(&chain.medallion));
        if let Some(chain) = available {
            leases.insert(chain.medallion);
        }
        Ok(available)
    }

    /// Returns false when the medallion is already leased.
    pub fn lease(&self, medallion: Medallion) -> bool {
        self.leases.lock().insert(medallion)
    }

    pub fn release(&self, medallion: Medallion) {
        self.leases.lock().remove(&medallion);
    }
}

impl CommitSink for CommitStore {
    fn accept(&self, bytes: &[u8]) -> Result<Option<CommitInfo>, CwError> {
        self.add_commit(bytes)
    }
}

// ============================================================================
// Snapshot helpers
// ============================================================================

fn read_head(snapshot: &dyn StoreSnapshot, chain: &ChainKey) -> Result<Option<ChainInfo>, CwError> {
    match snapshot.get(Table::ChainHeads, &chain_key(chain))? {
        Some(bytes) => Ok(Some(CommitInfo::from_commit_bytes(&bytes)?)),
        None => Ok(None),
    }
}

fn resolve_as_of(snapshot: &dyn StoreSnapshot, as_of: AsOf) -> Result<Timestamp, CwError> {
    match as_of {
        AsOf::Latest | AsOf::CommitsBack(0) => Ok(Timestamp::MAX),
        AsOf::Timestamp(timestamp) => Ok(timestamp),
        AsOf::Time(time) => Ok(micros_since_epoch(time)),
        AsOf::CommitsBack(requested) => {
            let mut available = 0u32;
            for row in snapshot.scan(Table::Commits, &[], None, true)? {
                let (key, _) = row?;
                available += 1;
                if available == requested {
                    let (timestamp, _) = decode_commit_key(&key)?;
                    return Ok(timestamp - 1);
                }
            }
            Err(CwError::AsOfOutOfRange {
                requested,
                available,
            })
        }
    }
}

/// False for deletion markers and for entries exited at or before `as_of`.
fn is_visible(
    snapshot: &dyn StoreSnapshot,
    key: &[u8],
    value: &[u8],
    as_of: Timestamp,
) -> Result<bool, CwError> {
    if let Some(exit) = snapshot.get(Table::Exits, key)? {
        if read_u64(&exit)? <= as_of {
            return Ok(false);
        }
    }
    let entry = EntryProto::decode(value)?;
    Ok(!matches!(entry.value, Some(entry_proto::Value::Deleting(true))))
}

fn found_entry(key: &[u8], bytes: Vec<u8>) -> Result<FoundEntry, CwError> {
    let (_, key, address) = decode_placement_key(key)?;
    Ok(FoundEntry {
        address,
        key,
        bytes,
    })
}

fn resolve_proto(proto: Option<&MuidProto>, info: &CommitInfo) -> Muid {
    proto.map(Muid::from).unwrap_or(Muid::ROOT).resolve(info)
}

/// Entry record with commit-relative addresses made absolute.
fn normalize_entry(entry: &EntryProto, source: Muid, info: &CommitInfo) -> EntryProto {
    let value = match &entry.value {
        Some(entry_proto::Value::Pointee(pointee)) => Some(entry_proto::Value::Pointee(
            Muid::from(pointee).resolve(info).into(),
        )),
        other => other.clone(),
    };
    EntryProto {
        source: Some(source.into()),
        key: entry.key.clone(),
        value,
    }
}
