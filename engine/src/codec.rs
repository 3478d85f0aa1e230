//! Versioned little-endian container for persisted symbol files.
//!
//! Layout: 4-byte magic, u16 major, u16 minor, then a sequence of records.
//! Each record is a 1-byte kind tag followed by a u32 length and the
//! payload. Minor-version extensions append trailing fields inside a
//! payload; readers must treat unread payload bytes as compatible extra
//! data. Unknown major versions are rejected.

use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{InsightError, Result};

pub const MAGIC: [u8; 4] = *b"ISYM";
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 1;

/// Record kinds of the symbol container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RecordKind {
    MemSpecs = 1,
    SystemMap = 2,
    TypeCount = 3,
    BaseType = 4,
    VariableCount = 5,
    Variable = 6,
    AltTypes = 7,
    End = 255,
}

pub struct RecordWriter<W: Write> {
    out: W,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(&MAGIC)?;
        out.write_u16::<LE>(VERSION_MAJOR)?;
        out.write_u16::<LE>(VERSION_MINOR)?;
        Ok(RecordWriter { out })
    }

    /// Writes one record; the payload is assembled by `build` into a
    /// scratch buffer so the length prefix can be emitted first.
    pub fn record<F>(&mut self, kind: RecordKind, build: F) -> Result<()>
    where
        F: FnOnce(&mut PayloadWriter) -> Result<()>,
    {
        let mut payload = PayloadWriter { buf: Vec::new() };
        build(&mut payload)?;
        self.out.write_u8(kind.into())?;
        self.out.write_u32::<LE>(payload.buf.len() as u32)?;
        self.out.write_all(&payload.buf)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.write_u8(RecordKind::End.into())?;
        self.out.write_u32::<LE>(0)?;
        self.out.flush()?;
        Ok(())
    }
}

pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed UTF-8 string, u16 length.
    pub fn str(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::MAX as usize);
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn opt_str(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                self.u8(1);
                self.str(s);
            }
            None => self.u8(0),
        }
    }
}

#[derive(Debug)]
pub struct RecordReader<R: Read> {
    input: R,
    pub major: u16,
    pub minor: u16,
}

impl<R: Read> RecordReader<R> {
    pub fn new(mut input: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(InsightError::SymbolParse(
                "bad magic, not a symbol file".into(),
            ));
        }
        let major = input.read_u16::<LE>()?;
        let minor = input.read_u16::<LE>()?;
        if major != VERSION_MAJOR {
            return Err(InsightError::SymbolVersionMismatch {
                required: VERSION_MAJOR,
                found: major,
            });
        }
        Ok(RecordReader { input, major, minor })
    }

    /// Next record, or `None` after the end marker.
    pub fn next_record(&mut self) -> Result<Option<(RecordKind, Payload)>> {
        let tag = self.input.read_u8()?;
        let len = self.input.read_u32::<LE>()? as usize;
        let kind = RecordKind::try_from(tag)
            .map_err(|_| InsightError::SymbolParse(format!("unknown record tag {tag:#x}")))?;
        if kind == RecordKind::End {
            return Ok(None);
        }
        let mut buf = vec![0u8; len];
        self.input.read_exact(&mut buf)?;
        Ok(Some((kind, Payload { buf, pos: 0 })))
    }
}

/// Cursor over one record payload. Running past the end is a parse error;
/// leaving bytes unread is fine (minor-version tolerance).
pub struct Payload {
    buf: Vec<u8>,
    pos: usize,
}

impl Payload {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.buf.len() {
            return Err(InsightError::SymbolParse("truncated record payload".into()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| InsightError::SymbolParse("invalid UTF-8 in record".into()))
    }

    pub fn opt_str(&mut self) -> Result<Option<String>> {
        if self.u8()? == 0 {
            Ok(None)
        } else {
            Ok(Some(self.str()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_round_trip() {
        let mut out = Vec::new();
        let mut w = RecordWriter::new(&mut out).unwrap();
        w.record(RecordKind::BaseType, |p| {
            p.i32(-7);
            p.u64(0xdead_beef);
            p.str("task_struct");
            p.opt_str(None);
            Ok(())
        })
        .unwrap();
        w.finish().unwrap();

        let mut r = RecordReader::new(&out[..]).unwrap();
        assert_eq!(r.major, VERSION_MAJOR);
        let (kind, mut p) = r.next_record().unwrap().unwrap();
        assert_eq!(kind, RecordKind::BaseType);
        assert_eq!(p.i32().unwrap(), -7);
        assert_eq!(p.u64().unwrap(), 0xdead_beef);
        assert_eq!(p.str().unwrap(), "task_struct");
        assert_eq!(p.opt_str().unwrap(), None);
        assert_eq!(p.remaining(), 0);
        assert!(r.next_record().unwrap().is_none());
    }

    #[test]
    fn unknown_major_rejected() {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&99u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        match RecordReader::new(&out[..]) {
            Err(InsightError::SymbolVersionMismatch { required, found }) => {
                assert_eq!(required, VERSION_MAJOR);
                assert_eq!(found, 99);
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn trailing_payload_bytes_are_tolerated() {
        let mut out = Vec::new();
        let mut w = RecordWriter::new(&mut out).unwrap();
        w.record(RecordKind::Variable, |p| {
            p.u32(42);
            p.u64(7); // a future minor-version extension
            Ok(())
        })
        .unwrap();
        w.finish().unwrap();

        let mut r = RecordReader::new(&out[..]).unwrap();
        let (_, mut p) = r.next_record().unwrap().unwrap();
        assert_eq!(p.u32().unwrap(), 42);
        assert!(p.remaining() > 0);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut out = Vec::new();
        let mut w = RecordWriter::new(&mut out).unwrap();
        w.record(RecordKind::Variable, |p| {
            p.u8(1);
            Ok(())
        })
        .unwrap();
        w.finish().unwrap();
        let mut r = RecordReader::new(&out[..]).unwrap();
        let (_, mut p) = r.next_record().unwrap().unwrap();
        assert!(p.u64().is_err());
    }
}
