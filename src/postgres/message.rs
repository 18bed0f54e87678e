use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A WAL position, rendered the way Postgres prints `pg_lsn` (`16/B374D848`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| Error::IllegalArgument(format!("invalid LSN: {s}")))?;
        let high = u32::from_str_radix(high, 16)
            .map_err(|_| Error::IllegalArgument(format!("invalid LSN: {s}")))?;
        let low = u32::from_str_radix(low, 16)
            .map_err(|_| Error::IllegalArgument(format!("invalid LSN: {s}")))?;
        Ok(Lsn(((high as u64) << 32) | low as u64))
    }
}

/// One row of `pg_logical_slot_peek_binary_changes`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub lsn: String,
    pub xid: u32,
    pub data: Bytes,
}

impl RawMessage {
    pub fn new(lsn: impl Into<String>, xid: u32, data: impl Into<Bytes>) -> Self {
        Self {
            lsn: lsn.into(),
            xid,
            data: data.into(),
        }
    }
}

/// A decoded message together with the slot row it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct WalMessage {
    pub lsn: String,
    pub xid: u32,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Begin(BeginMessage),
    Commit(CommitMessage),
    Relation(RelationMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    Truncate(TruncateMessage),
    Origin(OriginMessage),
    Type(TypeMessage),
    Custom(CustomMessage),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Begin(_) => "BEGIN",
            Message::Commit(_) => "COMMIT",
            Message::Relation(_) => "RELATION",
            Message::Insert(_) => "INSERT",
            Message::Update(_) => "UPDATE",
            Message::Delete(_) => "DELETE",
            Message::Truncate(_) => "TRUNCATE",
            Message::Origin(_) => "ORIGIN",
            Message::Type(_) => "TYPE",
            Message::Custom(_) => "MESSAGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginMessage {
    pub final_lsn: Lsn,
    /// Microseconds since 2000-01-01.
    pub commit_timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitMessage {
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    /// Microseconds since 2000-01-01.
    pub commit_timestamp: i64,
}

/// `REPLICA IDENTITY` setting announced with a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    Full,
    Index,
}

impl ReplicaIdentity {
    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'd' => Ok(ReplicaIdentity::Default),
            b'n' => Ok(ReplicaIdentity::Nothing),
            b'f' => Ok(ReplicaIdentity::Full),
            b'i' => Ok(ReplicaIdentity::Index),
            other => Err(Error::Protocol(format!(
                "unknown replica identity setting '{}'",
                other as char
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationColumn {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    pub part_of_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMessage {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<RelationColumn>,
}

impl RelationMessage {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

/// One column of a TupleData sub-message.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleColumn {
    Null,
    /// Unchanged TOASTed value; the server did not send it.
    Toasted,
    Text(Bytes),
    Binary(Bytes),
}

/// Which old-row image, if any, precedes the new tuple of an update or
/// identifies the row of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMarker {
    /// No old image: the key did not change (update only).
    None,
    /// `K`: only replica identity key columns are populated.
    Key,
    /// `O`: the full old row (`REPLICA IDENTITY FULL`).
    OldTuple,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub relation_oid: u32,
    pub columns: Vec<TupleColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    pub relation_oid: u32,
    pub marker: IdentityMarker,
    /// Empty when `marker` is [`IdentityMarker::None`].
    pub old_columns: Vec<TupleColumn>,
    pub new_columns: Vec<TupleColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
    pub relation_oid: u32,
    pub marker: IdentityMarker,
    pub columns: Vec<TupleColumn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TruncateOptions {
    pub cascade: bool,
    pub restart_identity: bool,
}

impl TruncateOptions {
    pub(crate) fn from_bits(bits: u8) -> Self {
        Self {
            cascade: bits & 1 != 0,
            restart_identity: bits & 2 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TruncateMessage {
    pub options: TruncateOptions,
    pub relation_oids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OriginMessage {
    pub commit_lsn: Lsn,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeMessage {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
}

/// A message written with `pg_logical_emit_message`.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMessage {
    pub transactional: bool,
    pub lsn: Lsn,
    pub prefix: String,
    pub content: Bytes,
}
