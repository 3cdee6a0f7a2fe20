//! Pending Commits
//!
//! A `PendingCommit` gathers changes before a `ChainSequencer` seals it.
//! Changes receive offsets 1, 2, 3, ... in the order they are added and keep
//! them even when earlier changes are removed, so addresses handed out while
//! the commit is being built stay valid.
//!
//! # Example
//!
//! ```
//! use chainweave::cw_commit::{Change, PendingCommit};
//! use chainweave::cw_wire::Behavior;
//!
//! let pending = PendingCommit::with_comment("first");
//! let address = pending.add_change(Change::container(Behavior::Directory)).unwrap();
//! assert_eq!(address.offset, 1);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use prost::Message;

use crate::cw_error::CwError;
use crate::cw_interface::{ChainKey, CommitBytes, CommitInfo, Key, Muid, Offset, Timestamp};
use crate::cw_wire::{
    change_proto, entry_proto, Behavior, ChangeProto, CommitProto, ContainerProto, EntryProto,
    ExitProto, KeyProto, MuidProto,
};

// ============================================================================
// Typed changes
// ============================================================================

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EntryValue {
    /// Opaque encoded value
    Scalar(Vec<u8>),
    /// Address of another container
    Pointee(Muid),
    /// Deletion marker
    Deletion,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EntryChange {
    pub container: Muid,
    pub key: Option<Key>,
    pub value: EntryValue,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExitChange {
    pub container: Muid,
    pub key: Option<Key>,
    pub entry: Muid,
}

/// One change inside a commit.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Change {
    Container { behavior: Behavior },
    Entry(EntryChange),
    Exit(ExitChange),
}

impl Change {
    pub fn container(behavior: Behavior) -> Self {
        Change::Container { behavior }
    }

    pub fn entry(container: Muid, key: Option<Key>, value: EntryValue) -> Self {
        Change::Entry(EntryChange {
            container,
            key,
            value,
        })
    }

    pub fn exit(container: Muid, key: Option<Key>, entry: Muid) -> Self {
        Change::Exit(ExitChange {
            container,
            key,
            entry,
        })
    }

    /// Decode a change found at `offset` inside a commit envelope.
    pub fn from_proto(offset: Offset, proto: &ChangeProto) -> Result<Change, CwError> {
        match proto.kind.as_ref() {
            Some(change_proto::Kind::Container(c)) => Ok(Change::Container {
                behavior: Behavior::try_from(c.behavior).unwrap_or(Behavior::Unknown),
            }),
            Some(change_proto::Kind::Entry(e)) => {
                let value = match e.value.as_ref() {
                    Some(entry_proto::Value::Scalar(bytes)) => EntryValue::Scalar(bytes.clone()),
                    Some(entry_proto::Value::Pointee(muid)) => EntryValue::Pointee(muid.into()),
                    Some(entry_proto::Value::Deleting(true)) => EntryValue::Deletion,
                    _ => return Err(CwError::UnsupportedChangeKind { offset }),
                };
                Ok(Change::Entry(EntryChange {
                    container: muid_or_default(e.source.as_ref()),
                    key: e.key.as_ref().and_then(Key::from_proto),
                    value,
                }))
            }
            Some(change_proto::Kind::Exit(x)) => Ok(Change::Exit(ExitChange {
                container: muid_or_default(x.source.as_ref()),
                key: x.key.as_ref().and_then(Key::from_proto),
                entry: muid_or_default(x.entry.as_ref()),
            })),
            None => Err(CwError::UnsupportedChangeKind { offset }),
        }
    }

    pub fn to_proto(&self) -> ChangeProto {
        let kind = match self {
            Change::Container { behavior } => change_proto::Kind::Container(ContainerProto {
                behavior: *behavior as i32,
            }),
            Change::Entry(e) => change_proto::Kind::Entry(EntryProto {
                source: Some(e.container.into()),
                key: e.key.as_ref().map(KeyProto::from),
                value: Some(match &e.value {
                    EntryValue::Scalar(bytes) => entry_proto::Value::Scalar(bytes.clone()),
                    EntryValue::Pointee(muid) => entry_proto::Value::Pointee((*muid).into()),
                    EntryValue::Deletion => entry_proto::Value::Deleting(true),
                }),
            }),
            Change::Exit(x) => change_proto::Kind::Exit(ExitProto {
                source: Some(x.container.into()),
                key: x.key.as_ref().map(KeyProto::from),
                entry: Some(x.entry.into()),
            }),
        };
        ChangeProto { kind: Some(kind) }
    }
}

fn muid_or_default(proto: Option<&MuidProto>) -> Muid {
    proto.map(Muid::from).unwrap_or_default()
}

/// Decode every change of a commit envelope, in offset order.
pub fn decode_changes(proto: &CommitProto) -> Result<Vec<(Offset, Change)>, CwError> {
    proto
        .changes
        .iter()
        .map(|(offset, change)| Ok((*offset, Change::from_proto(*offset, change)?)))
        .collect()
}

// ============================================================================
// Pending commit
// ============================================================================

#[derive(Debug, Default)]
struct PendingState {
    comment: Option<String>,
    changes: BTreeMap<Offset, Change>,
    /// Offsets handed out so far; never decreases
    count: Offset,
    sealed: Option<CommitInfo>,
}

/// An unsealed commit under construction.
///
/// Cloning yields another handle to the same commit, so the caller can keep
/// one after handing the commit to a sequencer and later resolve addresses.
#[derive(Clone, Debug, Default)]
pub struct PendingCommit {
    state: Arc<Mutex<PendingState>>,
}

impl PendingCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_comment(comment: impl Into<String>) -> Self {
        let pending = Self::new();
        pending.state.lock().comment = Some(comment.into());
        pending
    }

    pub fn set_comment(&self, comment: impl Into<String>) -> Result<(), CwError> {
        let mut state = self.state.lock();
        if state.sealed.is_some() {
            return Err(CwError::AlreadySealed);
        }
        state.comment = Some(comment.into());
        Ok(())
    }

    /// Add a change and return its commit-relative address.
    pub fn add_change(&self, change: Change) -> Result<Muid, CwError> {
        let mut state = self.state.lock();
        if state.sealed.is_some() {
            return Err(CwError::AlreadySealed);
        }
        state.count += 1;
        let offset = state.count;
        state.changes.insert(offset, change);
        Ok(Muid::local(offset))
    }

    /// Drop a previously added change. Offsets of other changes are kept.
    pub fn remove_change(&self, address: Muid) -> Result<Option<Change>, CwError> {
        let mut state = self.state.lock();
        if state.sealed.is_some() {
            return Err(CwError::AlreadySealed);
        }
        if address.timestamp != 0 || address.medallion != 0 {
            return Ok(None);
        }
        Ok(state.changes.remove(&address.offset))
    }

    pub fn len(&self) -> usize {
        self.state.lock().changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed.is_some()
    }

    /// Metadata assigned at sealing time.
    pub fn info(&self) -> Option<CommitInfo> {
        self.state.lock().sealed.clone()
    }

    /// Global address of a change once the commit is sealed.
    pub fn resolve(&self, address: Muid) -> Option<Muid> {
        self.state
            .lock()
            .sealed
            .as_ref()
            .map(|info| address.resolve(info))
    }

    /// Freeze the commit onto a chain. A commit can be sealed only once.
    pub fn seal(
        &self,
        chain: ChainKey,
        prior_time: Option<Timestamp>,
        timestamp: Timestamp,
    ) -> Result<(CommitInfo, CommitBytes), CwError> {
        let mut state = self.state.lock();
        if state.sealed.is_some() {
            return Err(CwError::AlreadySealed);
        }
        let info = CommitInfo {
            timestamp,
            medallion: chain.medallion,
            chain_start: chain.chain_start,
            prior_time,
            comment: state.comment.clone(),
        };
        let proto = CommitProto {
            timestamp,
            previous_timestamp: prior_time.unwrap_or(0),
            chain_start: chain.chain_start,
            medallion: chain.medallion,
            comment: state.comment.clone(),
            changes: state
                .changes
                .iter()
                .map(|(offset, change)| (*offset, change.to_proto()))
                .collect(),
        };
        state.sealed = Some(info.clone());
        Ok((info, proto.encode_to_vec()))
    }

    /// Undo a seal whose bytes were never stored, so the same changes can be
    /// submitted again. Does nothing unless `info` is the current seal.
    pub fn unseal(&self, info: &CommitInfo) -> bool {
        let mut state = self.state.lock();
        if state.sealed.as_ref() != Some(info) {
            return false;
        }
        state.sealed = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ChainKey {
        ChainKey::new(0x1_0000_0000_0001, 1_000)
    }

    #[test]
    fn test_offsets_are_dense_and_stable() {
        let pending = PendingCommit::new();
        let a = pending.add_change(Change::container(Behavior::Box)).unwrap();
        let b = pending.add_change(Change::container(Behavior::List)).unwrap();
        assert_eq!((a.offset, b.offset), (1, 2));

        pending.remove_change(a).unwrap();
        let c = pending
            .add_change(Change::container(Behavior::Directory))
            .unwrap();
        assert_eq!(c.offset, 3);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_seal_resolves_addresses() {
        let pending = PendingCommit::with_comment("hello");
        let dir = pending
            .add_change(Change::container(Behavior::Directory))
            .unwrap();
        pending
            .add_change(Change::entry(
                dir,
                Some(Key::from("name")),
                EntryValue::Scalar(b"x".to_vec()),
            ))
            .unwrap();

        assert_eq!(pending.resolve(dir), None);
        let (info, bytes) = pending.seal(chain(), Some(1_000), 1_005).unwrap();
        assert_eq!(info.comment.as_deref(), Some("hello"));
        assert_eq!(pending.resolve(dir), Some(Muid::new(1_005, chain().medallion, 1)));

        let proto = CommitProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(CommitInfo::from(&proto), info);
        let changes = decode_changes(&proto).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0], (1, Change::container(Behavior::Directory)));
    }

    #[test]
    fn test_sealed_commit_is_frozen() {
        let pending = PendingCommit::new();
        pending.seal(chain(), None, 1_000).unwrap();
        assert!(matches!(
            pending.seal(chain(), Some(1_000), 1_001),
            Err(CwError::AlreadySealed)
        ));
        assert!(matches!(
            pending.add_change(Change::container(Behavior::Box)),
            Err(CwError::AlreadySealed)
        ));
        assert!(matches!(pending.set_comment("late"), Err(CwError::AlreadySealed)));
    }

    #[test]
    fn test_unseal_reopens_only_matching_seal() {
        let pending = PendingCommit::new();
        let entry = pending
            .add_change(Change::entry(Muid::ROOT, Some(Key::from(1_i64)), EntryValue::Deletion))
            .unwrap();
        let (info, _) = pending.seal(chain(), Some(1_000), 1_005).unwrap();

        let mut other = info.clone();
        other.timestamp = 1_006;
        assert!(!pending.unseal(&other));
        assert!(pending.is_sealed());

        assert!(pending.unseal(&info));
        assert!(!pending.is_sealed());
        assert_eq!(pending.resolve(entry), None);
        pending.add_change(Change::container(Behavior::Box)).unwrap();
        pending.seal(chain(), Some(1_000), 1_007).unwrap();
        assert_eq!(pending.resolve(entry), Some(Muid::new(1_007, chain().medallion, 1)));
    }

    #[test]
    fn test_change_without_kind_is_rejected() {
        let empty = ChangeProto { kind: None };
        assert!(matches!(
            Change::from_proto(4, &empty),
            Err(CwError::UnsupportedChangeKind { offset: 4 })
        ));
    }
}
