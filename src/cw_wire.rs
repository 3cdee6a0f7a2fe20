//! Wire Format
//!
//! Protobuf messages for the commit envelope and the sync protocol. The
//! messages are declared with `prost` derives rather than generated from
//! `.proto` files; the tags below are the interoperability contract.
//!
//! ```text
//! CommitProto  { timestamp = 1, previous_timestamp = 2, chain_start = 3,
//!                medallion = 4, comment = 5, changes = 6 (map<uint32, Change>) }
//! ChangeProto  { oneof kind { container = 1, entry = 2, exit = 3 } }
//! EntryProto   { source = 1, key = 2, oneof value { scalar = 3, pointee = 4, deleting = 5 } }
//! ExitProto    { source = 1, key = 2, entry = 3 }
//! SyncMessage  { oneof body { commit = 1, greeting = 2 } }
//! ```

use std::collections::BTreeMap;

/// Global address of a stored item. Zero timestamp or medallion inside a
/// commit refers to that commit.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MuidProto {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,

    #[prost(uint64, tag = "2")]
    pub medallion: u64,

    #[prost(uint32, tag = "3")]
    pub offset: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyProto {
    #[prost(oneof = "key_proto::Kind", tags = "1, 2")]
    pub kind: Option<key_proto::Kind>,
}

pub mod key_proto {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(sint64, tag = "1")]
        Number(i64),

        #[prost(string, tag = "2")]
        Characters(String),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EntryProto {
    #[prost(message, optional, tag = "1")]
    pub source: Option<MuidProto>,

    #[prost(message, optional, tag = "2")]
    pub key: Option<KeyProto>,

    #[prost(oneof = "entry_proto::Value", tags = "3, 4, 5")]
    pub value: Option<entry_proto::Value>,
}

pub mod entry_proto {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        /// Encoded scalar, opaque to the store
        #[prost(bytes = "vec", tag = "3")]
        Scalar(Vec<u8>),

        /// Destination container
        #[prost(message, tag = "4")]
        Pointee(super::MuidProto),

        #[prost(bool, tag = "5")]
        Deleting(bool),
    }
}

/// Container kinds understood by the container layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Behavior {
    Unknown = 0,
    Directory = 1,
    List = 2,
    Box = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerProto {
    #[prost(enumeration = "Behavior", tag = "1")]
    pub behavior: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExitProto {
    #[prost(message, optional, tag = "1")]
    pub source: Option<MuidProto>,

    #[prost(message, optional, tag = "2")]
    pub key: Option<KeyProto>,

    #[prost(message, optional, tag = "3")]
    pub entry: Option<MuidProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChangeProto {
    #[prost(oneof = "change_proto::Kind", tags = "1, 2, 3")]
    pub kind: Option<change_proto::Kind>,
}

pub mod change_proto {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Container(super::ContainerProto),

        #[prost(message, tag = "2")]
        Entry(super::EntryProto),

        #[prost(message, tag = "3")]
        Exit(super::ExitProto),
    }
}

/// The commit envelope: persisted in the commit log and exchanged verbatim
/// between peers.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommitProto {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,

    /// 0 for the first commit on a chain
    #[prost(uint64, tag = "2")]
    pub previous_timestamp: u64,

    #[prost(uint64, tag = "3")]
    pub chain_start: u64,

    #[prost(uint64, tag = "4")]
    pub medallion: u64,

    #[prost(string, optional, tag = "5")]
    pub comment: Option<String>,

    #[prost(btree_map = "uint32, message", tag = "6")]
    pub changes: BTreeMap<u32, ChangeProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GreetingEntry {
    #[prost(uint64, tag = "1")]
    pub medallion: u64,

    #[prost(uint64, tag = "2")]
    pub chain_start: u64,

    #[prost(uint64, tag = "3")]
    pub seen_through: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Greeting {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<GreetingEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncMessage {
    #[prost(oneof = "sync_message::Body", tags = "1, 2")]
    pub body: Option<sync_message::Body>,
}

pub mod sync_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(bytes = "vec", tag = "1")]
        Commit(Vec<u8>),

        #[prost(message, tag = "2")]
        Greeting(super::Greeting),
    }
}

impl SyncMessage {
    pub fn commit(bytes: &[u8]) -> Self {
        Self {
            body: Some(sync_message::Body::Commit(bytes.to_vec())),
        }
    }

    pub fn greeting(greeting: Greeting) -> Self {
        Self {
            body: Some(sync_message::Body::Greeting(greeting)),
        }
    }
}
