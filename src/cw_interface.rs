use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::cw_error::CwError;
use crate::cw_wire::{key_proto, CommitProto, EntryProto, KeyProto, MuidProto};

// all microsecond timestamps share one type so they can be compared directly
pub type Timestamp = u64;
pub type ChainStart = Timestamp;
pub type Medallion = u64;
pub type Offset = u32;
pub type CommitBytes = Vec<u8>;
pub type ConnectionId = u64;

/// Microseconds since the unix epoch.
pub fn micros_since_epoch(time: SystemTime) -> Timestamp {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as Timestamp)
        .unwrap_or(0)
}

// ============================================================================
// Addresses
// ============================================================================

/// Global address of any item ever written: `(timestamp, medallion, offset)`.
///
/// Inside a pending commit an address has zero timestamp and medallion,
/// meaning "this commit"; those parts are filled in once the commit is
/// sealed (see [`Muid::resolve`]).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct Muid {
    pub timestamp: Timestamp,
    pub medallion: Medallion,
    pub offset: Offset,
}

/// Encoded width of a muid inside storage keys.
pub const MUID_LEN: usize = 20;

impl Muid {
    pub const ROOT: Muid = Muid::new(0, 0, 0);

    pub const fn new(timestamp: Timestamp, medallion: Medallion, offset: Offset) -> Self {
        Self {
            timestamp,
            medallion,
            offset,
        }
    }

    /// Address of an item inside a commit that has not been sealed yet.
    pub const fn local(offset: Offset) -> Self {
        Self::new(0, 0, offset)
    }

    /// The root container; entries without a source belong to it.
    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    /// Fill in missing timestamp/medallion from the commit that carries this address.
    pub fn resolve(&self, info: &CommitInfo) -> Muid {
        if self.is_root() {
            return *self;
        }
        Muid {
            timestamp: if self.timestamp == 0 {
                info.timestamp
            } else {
                self.timestamp
            },
            medallion: if self.medallion == 0 {
                info.medallion
            } else {
                self.medallion
            },
            offset: self.offset,
        }
    }

    /// Big-endian encoding; byte order equals `Ord` order.
    pub fn to_bytes(&self) -> [u8; MUID_LEN] {
        let mut out = [0u8; MUID_LEN];
        out[0..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..16].copy_from_slice(&self.medallion.to_be_bytes());
        out[16..20].copy_from_slice(&self.offset.to_be_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Muid> {
        if data.len() != MUID_LEN {
            return None;
        }
        Some(Muid {
            timestamp: u64::from_be_bytes(data[0..8].try_into().ok()?),
            medallion: u64::from_be_bytes(data[8..16].try_into().ok()?),
            offset: u32::from_be_bytes(data[16..20].try_into().ok()?),
        })
    }
}

impl fmt::Display for Muid {
    /// `05D5EAC793E61F-1F8CB77AE1EAA-0000B` style rendering.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:014X}-{:013X}-{:05X}",
            self.timestamp % (1 << 56),
            self.medallion % (1 << 52),
            self.offset % (1 << 20)
        )
    }
}

impl From<&MuidProto> for Muid {
    fn from(proto: &MuidProto) -> Self {
        Muid::new(proto.timestamp, proto.medallion, proto.offset)
    }
}

impl From<Muid> for MuidProto {
    fn from(muid: Muid) -> Self {
        MuidProto {
            timestamp: muid.timestamp,
            medallion: muid.medallion,
            offset: muid.offset,
        }
    }
}

// ============================================================================
// Chains and commit metadata
// ============================================================================

/// Names a chain: the writer's medallion plus the chain's start time.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ChainKey {
    pub medallion: Medallion,
    pub chain_start: ChainStart,
}

impl ChainKey {
    pub const fn new(medallion: Medallion, chain_start: ChainStart) -> Self {
        Self {
            medallion,
            chain_start,
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.medallion.to_be_bytes());
        out[8..16].copy_from_slice(&self.chain_start.to_be_bytes());
        out
    }
}

/// Metadata of one commit, and (as the persisted chain head) of the latest
/// accepted commit on a chain.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommitInfo {
    pub timestamp: Timestamp,
    pub medallion: Medallion,
    pub chain_start: ChainStart,
    /// None for the commit that starts a chain
    pub prior_time: Option<Timestamp>,
    pub comment: Option<String>,
}

/// A chain head is the info of the newest commit accepted for that chain.
pub type ChainInfo = CommitInfo;

impl CommitInfo {
    pub fn chain(&self) -> ChainKey {
        ChainKey::new(self.medallion, self.chain_start)
    }

    pub fn is_chain_start(&self) -> bool {
        self.prior_time.is_none()
    }

    /// Extract the metadata from serialized commit bytes.
    pub fn from_commit_bytes(bytes: &[u8]) -> Result<CommitInfo, CwError> {
        let proto = CommitProto::decode(bytes)?;
        Ok(CommitInfo::from(&proto))
    }

    /// Header-only envelope, used to persist chain heads.
    pub fn to_header_bytes(&self) -> Vec<u8> {
        CommitProto {
            timestamp: self.timestamp,
            previous_timestamp: self.prior_time.unwrap_or(0),
            chain_start: self.chain_start,
            medallion: self.medallion,
            comment: self.comment.clone(),
            changes: Default::default(),
        }
        .encode_to_vec()
    }

    /// Structural checks that do not depend on store state.
    pub fn validate(&self) -> Result<(), CwError> {
        if self.medallion == 0 || self.timestamp == 0 || self.chain_start == 0 {
            return Err(CwError::MalformedCommit(format!(
                "zero medallion, timestamp or chain start in {:?}",
                self
            )));
        }
        if self.timestamp < self.chain_start {
            return Err(CwError::MalformedCommit(format!(
                "timestamp {} before chain start {}",
                self.timestamp, self.chain_start
            )));
        }
        if let Some(prior) = self.prior_time {
            if prior >= self.timestamp || prior < self.chain_start {
                return Err(CwError::MalformedCommit(format!(
                    "prior time {} outside [{}, {})",
                    prior, self.chain_start, self.timestamp
                )));
            }
        }
        if self.prior_time.is_none() && self.timestamp != self.chain_start {
            return Err(CwError::MalformedCommit(format!(
                "commit at {} has no prior but is not the chain start {}",
                self.timestamp, self.chain_start
            )));
        }
        Ok(())
    }
}

impl From<&CommitProto> for CommitInfo {
    fn from(proto: &CommitProto) -> Self {
        CommitInfo {
            timestamp: proto.timestamp,
            medallion: proto.medallion,
            chain_start: proto.chain_start,
            prior_time: (proto.previous_timestamp != 0).then_some(proto.previous_timestamp),
            comment: proto.comment.clone().filter(|c| !c.is_empty()),
        }
    }
}

// ============================================================================
// Keys, lookups and query results
// ============================================================================

/// Semantic key of an entry within its container.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Key {
    Number(i64),
    Text(String),
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Number(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<&Key> for KeyProto {
    fn from(key: &Key) -> Self {
        let kind = match key {
            Key::Number(n) => key_proto::Kind::Number(*n),
            Key::Text(s) => key_proto::Kind::Characters(s.clone()),
        };
        KeyProto { kind: Some(kind) }
    }
}

impl Key {
    /// A key message with no kind set is treated as "no key".
    pub fn from_proto(proto: &KeyProto) -> Option<Key> {
        match proto.kind.as_ref()? {
            key_proto::Kind::Number(n) => Some(Key::Number(*n)),
            key_proto::Kind::Characters(s) => Some(Key::Text(s.clone())),
        }
    }
}

/// How `CommitStore::get_entry` locates the entry within a container.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EntryLookup {
    /// Latest entry written without a semantic key
    Unkeyed,
    /// Latest entry for a semantic key
    Key(Key),
    /// Exact entry address (no scan)
    Address(Muid),
}

impl From<Key> for EntryLookup {
    fn from(key: Key) -> Self {
        EntryLookup::Key(key)
    }
}

impl From<Muid> for EntryLookup {
    fn from(address: Muid) -> Self {
        EntryLookup::Address(address)
    }
}

/// Point in time a query is evaluated at.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AsOf {
    #[default]
    Latest,
    /// Absolute microsecond timestamp, passed through unchanged
    Timestamp(Timestamp),
    /// Wall clock time, converted to microseconds
    Time(SystemTime),
    /// State just before the N-th most recent commit
    CommitsBack(u32),
}

impl From<i64> for AsOf {
    /// Negative numbers count commits back from the present, zero is the
    /// present, positive numbers are absolute timestamps.
    fn from(value: i64) -> Self {
        match value {
            0 => AsOf::Latest,
            v if v < 0 => AsOf::CommitsBack(v.unsigned_abs().min(u32::MAX as u64) as u32),
            v => AsOf::Timestamp(v as Timestamp),
        }
    }
}

impl From<SystemTime> for AsOf {
    fn from(time: SystemTime) -> Self {
        AsOf::Time(time)
    }
}

/// An entry returned by a store query: its resolved address, semantic key
/// and the raw entry record.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FoundEntry {
    pub address: Muid,
    pub key: Option<Key>,
    pub bytes: Vec<u8>,
}

impl FoundEntry {
    pub fn decode(&self) -> Result<EntryProto, CwError> {
        Ok(EntryProto::decode(self.bytes.as_slice())?)
    }
}

// ============================================================================
// Seams
// ============================================================================

/// Destination for sealed commits produced by a `ChainSequencer`.
///
/// `CommitStore` accepts commits directly; `SyncCoordinator` stores them and
/// also fans them out to peers and listeners.
pub trait CommitSink: Send + Sync {
    /// Returns `Ok(None)` when the commit was already known.
    fn accept(&self, bytes: &[u8]) -> Result<Option<CommitInfo>, CwError>;
}

/// Byte pipe to one connected peer. Framing and delivery are up to the
/// host application.
pub trait PeerTransport: Send + Sync {
    fn send(&self, message: &[u8]) -> Result<(), CwError>;

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_muid_bytes_sort_like_muids() {
        let a = Muid::new(5, 9, 1);
        let b = Muid::new(5, 10, 0);
        let c = Muid::new(6, 1, 1);
        assert!(a.to_bytes() < b.to_bytes());
        assert!(b.to_bytes() < c.to_bytes());
        assert_eq!(Muid::from_bytes(&c.to_bytes()), Some(c));
        assert_eq!(Muid::from_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn test_muid_display() {
        let muid = Muid::new(0x05D5EAC793E61F, 0x1F8CB77AE1EAA, 11);
        assert_eq!(muid.to_string(), "05D5EAC793E61F-1F8CB77AE1EAA-0000B");
    }

    #[test]
    fn test_resolve_fills_only_missing_parts() {
        let info = CommitInfo {
            timestamp: 100,
            medallion: 42,
            chain_start: 90,
            prior_time: Some(90),
            comment: None,
        };
        assert_eq!(Muid::local(3).resolve(&info), Muid::new(100, 42, 3));
        assert_eq!(Muid::new(50, 7, 1).resolve(&info), Muid::new(50, 7, 1));
        assert_eq!(Muid::ROOT.resolve(&info), Muid::ROOT);
    }

    #[test]
    fn test_validate_chain_start_rules() {
        let mut info = CommitInfo {
            timestamp: 100,
            medallion: 42,
            chain_start: 100,
            prior_time: None,
            comment: None,
        };
        assert!(info.validate().is_ok());

        info.timestamp = 101;
        assert!(matches!(info.validate(), Err(CwError::MalformedCommit(_))));

        info.prior_time = Some(100);
        assert!(info.validate().is_ok());

        info.prior_time = Some(101);
        assert!(matches!(info.validate(), Err(CwError::MalformedCommit(_))));

        info.prior_time = Some(100);
        info.timestamp = 99;
        assert!(matches!(info.validate(), Err(CwError::MalformedCommit(_))));
    }

    #[test]
    fn test_as_of_from_integer() {
        assert_eq!(AsOf::from(0), AsOf::Latest);
        assert_eq!(AsOf::from(-3), AsOf::CommitsBack(3));
        assert_eq!(
            AsOf::from(1_700_000_000_000_000),
            AsOf::Timestamp(1_700_000_000_000_000)
        );
    }
}
