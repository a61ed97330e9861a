//! Cursor over one reassembled payload.
//!
//! Reads return `None` when the payload is shorter than the layout
//! requires; callers turn that into a protocol error with [`need`].

use crate::protocol::{EofPacket, ErrPacket, OkPacket, malformed};
use mywire_core::Result;

/// A length-encoded integer, which may also be the NULL marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenEnc {
    Value(u64),
    /// 0xFB: SQL NULL in a text row
    Null,
}

/// A reader for MySQL protocol data.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    /// Read `N` bytes into a little-endian u64.
    fn read_le<const N: usize>(&mut self) -> Option<u64> {
        let bytes = self.read_bytes(N)?;
        let mut buf = [0u8; 8];
        buf[..N].copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_le::<2>().map(|v| v as u16)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        self.read_le::<3>().map(|v| v as u32)
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_le::<4>().map(|v| v as u32)
    }

    pub fn read_u48_le(&mut self) -> Option<u64> {
        self.read_le::<6>()
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_le::<8>()
    }

    /// Read a length-encoded integer, distinguishing the NULL marker.
    ///
    /// - 0x00-0xFA: the value itself
    /// - 0xFB: NULL
    /// - 0xFC / 0xFD / 0xFE: 2 / 3 / 8 byte value follows
    /// - 0xFF: never valid here, reported as `None`
    pub fn read_lenenc(&mut self) -> Option<LenEnc> {
        let first = self.peek()?;
        let value = match first {
            0x00..=0xFA => {
                self.pos += 1;
                u64::from(first)
            }
            0xFB => {
                self.pos += 1;
                return Some(LenEnc::Null);
            }
            0xFF => return None,
            _ => {
                let save = self.pos;
                self.pos += 1;
                let value = match first {
                    0xFC => self.read_le::<2>(),
                    0xFD => self.read_le::<3>(),
                    _ => self.read_le::<8>(),
                };
                if value.is_none() {
                    self.pos = save;
                }
                value?
            }
        };
        Some(LenEnc::Value(value))
    }

    /// Read a length-encoded integer; NULL and malformed both yield `None`.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        match self.read_lenenc()? {
            LenEnc::Value(v) => Some(v),
            LenEnc::Null => None,
        }
    }

    /// Read a length-encoded byte string. `Some(None)` is SQL NULL.
    pub fn read_lenenc_nullable(&mut self) -> Option<Option<&'a [u8]>> {
        match self.read_lenenc()? {
            LenEnc::Null => Some(None),
            LenEnc::Value(len) => {
                let len = usize::try_from(len).ok()?;
                self.read_bytes(len).map(Some)
            }
        }
    }

    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read up to the next NUL, consuming the terminator if present.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        self.pos += end;
        if self.pos < self.data.len() {
            self.pos += 1;
        }
        &rest[..end]
    }

    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Skip one length-encoded string without copying it.
    pub fn skip_lenenc(&mut self) -> Option<()> {
        match self.read_lenenc()? {
            LenEnc::Null => Some(()),
            LenEnc::Value(len) => {
                let len = usize::try_from(len).ok()?;
                self.skip(len).then_some(())
            }
        }
    }

    /// OK packet (protocol 4.1):
    /// header, affected rows, last insert id, status, warnings, info.
    /// The header may be 0x00 or, as a row terminator, 0xFE.
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }

        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let info = self.read_rest_string();

        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// ERR packet: 0xFF, code, optional `#` + 5-char SQLSTATE, message.
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };
        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// EOF packet: 0xFE, warnings, status.
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

/// Turn a short read into a protocol error naming the layout.
pub fn need<T>(value: Option<T>, what: &str, payload: &[u8]) -> Result<T> {
    value.ok_or_else(|| malformed(what, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;

    #[test]
    fn test_read_fixed_widths() {
        let mut reader = PacketReader::new(&[0x42, 0x34, 0x12, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_u8(), Some(0x42));
        assert_eq!(reader.read_u16_le(), Some(0x1234));
        assert_eq!(reader.read_u24_le(), Some(0x0012_3456));
        assert_eq!(reader.read_u8(), None);

        let mut reader = PacketReader::new(&[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_u32_le(), Some(0x1234_5678));

        let mut reader = PacketReader::new(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(reader.read_u48_le(), Some(0x0605_0403_0201));

        let mut reader = PacketReader::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reader.read_u64_le(), Some(0x0807_0605_0403_0201));
    }

    #[test]
    fn test_lenenc_boundaries_roundtrip() {
        for value in [
            0_u64,
            250,
            251,
            65_535,
            65_536,
            16_777_215,
            16_777_216,
            (1 << 63) - 1,
        ] {
            let mut writer = PacketWriter::new();
            writer.write_lenenc_int(value);
            let bytes = writer.into_bytes();
            assert_ne!(bytes[0], 0xFB, "{value} must not encode as NULL");
            let mut reader = PacketReader::new(&bytes);
            assert_eq!(reader.read_lenenc(), Some(LenEnc::Value(value)));
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_lenenc_null_and_reserved() {
        let mut reader = PacketReader::new(&[0xFB]);
        assert_eq!(reader.read_lenenc(), Some(LenEnc::Null));

        let mut reader = PacketReader::new(&[0xFB]);
        assert_eq!(reader.read_lenenc_nullable(), Some(None));

        let mut reader = PacketReader::new(&[0xFF, 0x00]);
        assert_eq!(reader.read_lenenc(), None);
        assert_eq!(reader.position(), 0);

        // Truncated 2-byte form leaves the cursor untouched.
        let mut reader = PacketReader::new(&[0xFC, 0x01]);
        assert_eq!(reader.read_lenenc(), None);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_strings() {
        let mut reader = PacketReader::new(b"hello\0world\0tail");
        assert_eq!(reader.read_null_string(), "hello");
        assert_eq!(reader.read_null_string(), "world");
        assert_eq!(reader.read_null_string(), "tail");
        assert!(reader.is_empty());

        let mut reader = PacketReader::new(&[0x05, b'h', b'e', b'l', b'l', b'o', b'!']);
        assert_eq!(reader.read_lenenc_string(), Some("hello".to_string()));
        assert_eq!(reader.read_rest_string(), "!");

        let mut reader = PacketReader::new(&[0x02, b'a', b'b', 0x01, b'c']);
        assert_eq!(reader.skip_lenenc(), Some(()));
        assert_eq!(reader.read_lenenc_nullable(), Some(Some(&b"c"[..])));
    }

    #[test]
    fn test_parse_ok_packet() {
        let data = [0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 0);
        assert_eq!(ok.info, "");

        // 0xFE-headed OK terminator with an info string.
        let mut data = vec![0xFE, 0x00, 0x00, 0x22, 0x00, 0x01, 0x00];
        data.extend_from_slice(b"Rows matched: 1");
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.status_flags, 0x22);
        assert_eq!(ok.warnings, 1);
        assert_eq!(ok.info, "Rows matched: 1");
    }

    #[test]
    fn test_parse_err_and_eof() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000Access denied");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");

        let eof = PacketReader::new(&[0xFE, 0x00, 0x00, 0x02, 0x00])
            .parse_eof_packet()
            .unwrap();
        assert_eq!(eof.warnings, 0);
        assert_eq!(eof.status_flags, 2);
    }

    #[test]
    fn test_need_maps_to_protocol_error() {
        let err = need::<u8>(None, "column count", &[0xFF]).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("column count"));
    }
}
