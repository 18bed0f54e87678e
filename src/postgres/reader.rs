use bytes::{Buf, Bytes};

use super::message::{Lsn, TupleColumn};
use crate::{Error, Result};

/// Cursor over one pgoutput payload. Every read is bounds-checked; running
/// off the end is a protocol error rather than a panic.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(Error::Protocol(format!(
                "message truncated reading {}: need {} bytes, {} left",
                what,
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Consumes the leading message tag, failing unless it is `expected`.
    pub fn tag(&mut self, expected: u8) -> Result<()> {
        let actual = self.u8("message tag")?;
        if actual != expected {
            return Err(Error::Protocol(format!(
                "expected message to start with '{}', but was '{}'",
                expected as char, actual as char
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self, what: &str) -> Result<u8> {
        self.ensure(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub fn i16(&mut self, what: &str) -> Result<i16> {
        self.ensure(2, what)?;
        Ok(self.buf.get_i16())
    }

    pub fn i32(&mut self, what: &str) -> Result<i32> {
        self.ensure(4, what)?;
        Ok(self.buf.get_i32())
    }

    pub fn u32(&mut self, what: &str) -> Result<u32> {
        self.ensure(4, what)?;
        Ok(self.buf.get_u32())
    }

    pub fn i64(&mut self, what: &str) -> Result<i64> {
        self.ensure(8, what)?;
        Ok(self.buf.get_i64())
    }

    pub fn lsn(&mut self, what: &str) -> Result<Lsn> {
        self.ensure(8, what)?;
        Ok(Lsn(self.buf.get_u64()))
    }

    pub fn bytes(&mut self, len: usize, what: &str) -> Result<Bytes> {
        self.ensure(len, what)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    /// Null-terminated UTF-8 string.
    pub fn cstr(&mut self, what: &str) -> Result<String> {
        let end = self.buf.iter().position(|b| *b == 0).ok_or_else(|| {
            Error::Protocol(format!("unterminated string reading {}", what))
        })?;
        let value = std::str::from_utf8(&self.buf[..end])
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in {}: {}", what, e)))?
            .to_string();
        self.buf.advance(end + 1);
        Ok(value)
    }

    /// TupleData: Int16 column count, then per column a kind byte and, for
    /// text and binary values, an Int32 length and the value bytes.
    pub fn tuple_data(&mut self) -> Result<Vec<TupleColumn>> {
        let count = self.i16("tuple column count")?;
        if count < 0 {
            return Err(Error::Protocol(format!("negative tuple column count {}", count)));
        }

        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let column = match self.u8("tuple column kind")? {
                b'n' => TupleColumn::Null,
                b'u' => TupleColumn::Toasted,
                kind @ (b't' | b'b') => {
                    let len = self.i32("tuple column length")?;
                    if len < 0 {
                        return Err(Error::Protocol(format!("negative column length {}", len)));
                    }
                    let data = self.bytes(len as usize, "tuple column value")?;
                    if kind == b't' {
                        TupleColumn::Text(data)
                    } else {
                        TupleColumn::Binary(data)
                    }
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unknown tuple column kind '{}'",
                        other as char
                    )))
                }
            };
            columns.push(column);
        }
        Ok(columns)
    }
}
