use bytes::{BufMut, Bytes, BytesMut};

use super::message::RawMessage;

/// Column value as written into a TupleData block.
#[derive(Debug, Clone, Copy)]
pub enum MockValue<'a> {
    Null,
    Toasted,
    Text(&'a str),
}

/// Builds pgoutput payloads the way the server lays them out, so tests can
/// feed the decoder and collector without a database.
pub struct MockMessageBuilder {
    lsn: u64,
    xid: u32,
    timestamp: i64,
}

impl MockMessageBuilder {
    pub fn new(xid: u32) -> Self {
        Self {
            lsn: 0x1000,
            xid,
            timestamp: 756_212_400_000_000, // 2023-12-18 11:00:00 UTC, pg epoch micros
        }
    }

    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    fn raw(&mut self, data: BytesMut) -> RawMessage {
        let lsn = self.lsn;
        self.lsn += 0x10;
        RawMessage::new(format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF), self.xid, data.freeze())
    }

    pub fn begin(&mut self) -> RawMessage {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn + 0x100);
        buf.put_i64(self.timestamp);
        buf.put_u32(self.xid);
        self.raw(buf)
    }

    pub fn commit(&mut self) -> RawMessage {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x8);
        buf.put_i64(self.timestamp);
        self.raw(buf)
    }

    /// Columns are `(name, type oid, part of key)`.
    pub fn relation(
        &mut self,
        oid: u32,
        namespace: &str,
        name: &str,
        identity: u8,
        columns: &[(&str, u32, bool)],
    ) -> RawMessage {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(oid);
        put_cstr(&mut buf, namespace);
        put_cstr(&mut buf, name);
        buf.put_u8(identity);
        buf.put_i16(columns.len() as i16);
        for (column, type_oid, key) in columns {
            buf.put_u8(u8::from(*key));
            put_cstr(&mut buf, column);
            buf.put_u32(*type_oid);
            buf.put_i32(-1);
        }
        self.raw(buf)
    }

    pub fn insert(&mut self, oid: u32, values: &[MockValue<'_>]) -> RawMessage {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(oid);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        self.raw(buf)
    }

    /// `old` is written behind `marker` (`K` or `O`) when present.
    pub fn update(
        &mut self,
        oid: u32,
        old: Option<(u8, &[MockValue<'_>])>,
        new: &[MockValue<'_>],
    ) -> RawMessage {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(oid);
        if let Some((marker, values)) = old {
            buf.put_u8(marker);
            put_tuple(&mut buf, values);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        self.raw(buf)
    }

    pub fn delete(&mut self, oid: u32, marker: u8, values: &[MockValue<'_>]) -> RawMessage {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(oid);
        buf.put_u8(marker);
        put_tuple(&mut buf, values);
        self.raw(buf)
    }

    pub fn logical_message(&mut self, prefix: &str, content: &str) -> RawMessage {
        let mut buf = BytesMut::new();
        buf.put_u8(b'M');
        buf.put_u8(1);
        buf.put_u64(self.lsn);
        put_cstr(&mut buf, prefix);
        buf.put_i32(content.len() as i32);
        buf.put(content.as_bytes());
        self.raw(buf)
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[MockValue<'_>]) {
    buf.put_i16(values.len() as i16);
    for value in values {
        match value {
            MockValue::Null => buf.put_u8(b'n'),
            MockValue::Toasted => buf.put_u8(b'u'),
            MockValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_i32(text.len() as i32);
                buf.put(text.as_bytes());
            }
        }
    }
}

/// Decodes a hex dump as printed by `encode(data, 'hex')`.
pub fn hex(s: &str) -> Bytes {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect::<Vec<u8>>()
        .into()
}
