use tracing::{debug, trace};

use super::message::*;
use super::reader::Reader;
use crate::{Error, Result};

const BEGIN: u8 = b'B';
const COMMIT: u8 = b'C';
const RELATION: u8 = b'R';
const INSERT: u8 = b'I';
const UPDATE: u8 = b'U';
const DELETE: u8 = b'D';
const TRUNCATE: u8 = b'T';
const ORIGIN: u8 = b'O';
const TYPE: u8 = b'Y';
const LOGICAL_MESSAGE: u8 = b'M';

const NEW_TUPLE: u8 = b'N';
const KEY_TUPLE: u8 = b'K';
const OLD_TUPLE: u8 = b'O';

/// Decodes one pgoutput (protocol version 1) payload.
///
/// Returns `Ok(None)` for message kinds this decoder does not know, so newer
/// servers that add message types keep working.
pub fn decode(raw: &RawMessage) -> Result<Option<WalMessage>> {
    let Some(&tag) = raw.data.first() else {
        return Err(Error::Protocol(format!(
            "empty replication message at {}",
            raw.lsn
        )));
    };

    let data = &raw.data[..];
    let message = match tag {
        BEGIN => Message::Begin(BeginMessage::parse(data)?),
        COMMIT => Message::Commit(CommitMessage::parse(data)?),
        RELATION => Message::Relation(RelationMessage::parse(data)?),
        INSERT => Message::Insert(InsertMessage::parse(data)?),
        UPDATE => Message::Update(UpdateMessage::parse(data)?),
        DELETE => Message::Delete(DeleteMessage::parse(data)?),
        TRUNCATE => Message::Truncate(TruncateMessage::parse(data)?),
        ORIGIN => Message::Origin(OriginMessage::parse(data)?),
        TYPE => Message::Type(TypeMessage::parse(data)?),
        LOGICAL_MESSAGE => Message::Custom(CustomMessage::parse(data)?),
        other => {
            debug!("Ignoring unknown pgoutput message type: {}", other as char);
            return Ok(None);
        }
    };

    trace!(lsn = %raw.lsn, xid = raw.xid, "Decoded {}", message.name());

    Ok(Some(WalMessage {
        lsn: raw.lsn.clone(),
        xid: raw.xid,
        message,
    }))
}

impl BeginMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(BEGIN)?;
        Ok(Self {
            final_lsn: r.lsn("final LSN")?,
            commit_timestamp: r.i64("commit timestamp")?,
            xid: r.u32("xid")?,
        })
    }
}

impl CommitMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(COMMIT)?;
        let _flags = r.u8("commit flags")?;
        Ok(Self {
            commit_lsn: r.lsn("commit LSN")?,
            end_lsn: r.lsn("end LSN")?,
            commit_timestamp: r.i64("commit timestamp")?,
        })
    }
}

impl RelationMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(RELATION)?;

        let oid = r.u32("relation oid")?;
        let namespace = r.cstr("namespace")?;
        let name = r.cstr("relation name")?;
        let replica_identity = ReplicaIdentity::from_byte(r.u8("replica identity")?)?;
        let count = r.i16("column count")?;

        let mut columns = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let flags = r.u8("column flags")?;
            columns.push(RelationColumn {
                name: r.cstr("column name")?,
                type_oid: r.u32("column type oid")?,
                type_modifier: r.i32("column type modifier")?,
                part_of_key: flags & 1 != 0,
            });
        }

        Ok(Self {
            oid,
            namespace,
            name,
            replica_identity,
            columns,
        })
    }
}

impl InsertMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(INSERT)?;
        let relation_oid = r.u32("relation oid")?;
        expect_tuple_marker(&mut r, NEW_TUPLE)?;
        Ok(Self {
            relation_oid,
            columns: r.tuple_data()?,
        })
    }
}

impl UpdateMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(UPDATE)?;
        let relation_oid = r.u32("relation oid")?;

        let (marker, old_columns) = match r.u8("tuple marker")? {
            KEY_TUPLE => (IdentityMarker::Key, r.tuple_data()?),
            OLD_TUPLE => (IdentityMarker::OldTuple, r.tuple_data()?),
            NEW_TUPLE => {
                return Ok(Self {
                    relation_oid,
                    marker: IdentityMarker::None,
                    old_columns: Vec::new(),
                    new_columns: r.tuple_data()?,
                })
            }
            other => return Err(unexpected_marker("UPDATE", other)),
        };

        expect_tuple_marker(&mut r, NEW_TUPLE)?;

        Ok(Self {
            relation_oid,
            marker,
            old_columns,
            new_columns: r.tuple_data()?,
        })
    }
}

impl DeleteMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(DELETE)?;
        let relation_oid = r.u32("relation oid")?;

        let marker = match r.u8("tuple marker")? {
            KEY_TUPLE => IdentityMarker::Key,
            OLD_TUPLE => IdentityMarker::OldTuple,
            other => return Err(unexpected_marker("DELETE", other)),
        };

        Ok(Self {
            relation_oid,
            marker,
            columns: r.tuple_data()?,
        })
    }
}

impl TruncateMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(TRUNCATE)?;
        let count = r.i32("relation count")?;
        let options = TruncateOptions::from_bits(r.u8("truncate options")?);

        let mut relation_oids = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            relation_oids.push(r.u32("relation oid")?);
        }

        Ok(Self {
            options,
            relation_oids,
        })
    }
}

impl OriginMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(ORIGIN)?;
        Ok(Self {
            commit_lsn: r.lsn("origin commit LSN")?,
            name: r.cstr("origin name")?,
        })
    }
}

impl TypeMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(TYPE)?;
        Ok(Self {
            oid: r.u32("type oid")?,
            namespace: r.cstr("type namespace")?,
            name: r.cstr("type name")?,
        })
    }
}

impl CustomMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.tag(LOGICAL_MESSAGE)?;
        let flags = r.u8("message flags")?;
        let lsn = r.lsn("message LSN")?;
        let prefix = r.cstr("message prefix")?;
        let len = r.i32("message length")?;
        if len < 0 {
            return Err(Error::Protocol(format!("negative message length {}", len)));
        }

        Ok(Self {
            transactional: flags & 1 != 0,
            lsn,
            prefix,
            content: r.bytes(len as usize, "message content")?,
        })
    }
}

fn expect_tuple_marker(r: &mut Reader<'_>, expected: u8) -> Result<()> {
    let marker = r.u8("tuple marker")?;
    if marker != expected {
        return Err(Error::Protocol(format!(
            "expected tuple marker '{}', but was '{}'",
            expected as char, marker as char
        )));
    }
    Ok(())
}

fn unexpected_marker(kind: &str, marker: u8) -> Error {
    Error::Protocol(format!(
        "unexpected tuple marker '{}' in {}",
        marker as char, kind
    ))
}
