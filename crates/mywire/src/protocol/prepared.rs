//! Prepared statement (binary protocol) packets.
//!
//! # Protocol flow
//!
//! 1. `COM_STMT_PREPARE` with the SQL text. The server answers with
//!    `PREPARE_OK` followed by parameter and result column definitions.
//! 2. Optional `COM_STMT_SEND_LONG_DATA` frames for large parameters. The
//!    server never answers these.
//! 3. `COM_STMT_EXECUTE` with binary parameter values. The response is an
//!    OK packet or a binary result set.
//! 4. `COM_STMT_FETCH` when the execute opened a cursor.
//! 5. `COM_STMT_CLOSE` (no response) or `COM_STMT_RESET`.

use super::reader::{PacketReader, need};
use super::{Command, PacketWriter};
use crate::types::{ColumnDef, FieldType};
use mywire_core::error::DataErrorKind;
use mywire_core::{Error, Result, Value};
use std::sync::Arc;

/// `COM_STMT_EXECUTE` cursor flags.
pub mod cursor_type {
    pub const NO_CURSOR: u8 = 0x00;
    pub const READ_ONLY: u8 = 0x01;
}

/// Header preceding the data of a `COM_STMT_SEND_LONG_DATA` payload:
/// command, statement id, parameter index.
pub const LONG_DATA_HEADER_LEN: usize = 1 + 4 + 2;

/// Response from COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    /// Result columns (0 for statements without a result set)
    pub num_columns: u16,
    /// Placeholders in the SQL
    pub num_params: u16,
    pub warnings: u16,
}

impl StmtPrepareOk {
    /// status 0x00, id (4), columns (2), params (2), filler (1), warnings (2)
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        if r.read_u8() != Some(0x00) {
            return Err(super::malformed("PREPARE_OK", payload));
        }
        let statement_id = need(r.read_u32_le(), "PREPARE_OK statement id", payload)?;
        let num_columns = need(r.read_u16_le(), "PREPARE_OK column count", payload)?;
        let num_params = need(r.read_u16_le(), "PREPARE_OK param count", payload)?;
        r.skip(1);
        let warnings = r.read_u16_le().unwrap_or(0);
        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

/// A statement prepared on the server, with its metadata.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub statement_id: u32,
    pub sql: String,
    pub params: Arc<[ColumnDef]>,
    pub columns: Arc<[ColumnDef]>,
    pub warnings: u16,
}

impl PreparedStatement {
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// One parameter slot of a `COM_STMT_EXECUTE`.
#[derive(Debug, Clone, Copy)]
pub enum ExecuteParam<'a> {
    /// Inline binary value
    Value(&'a Value),
    /// Data already streamed with long data; only the type is declared
    LongData(FieldType),
}

/// Wire type and unsigned flag declared for a parameter value.
pub fn param_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) => (FieldType::Tiny, false),
        Value::Int(_) => (FieldType::LongLong, false),
        Value::UInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) => (FieldType::VarString, false),
        Value::Bytes(_) | Value::Spilled(_) => (FieldType::Blob, false),
        Value::Json(_) => (FieldType::Json, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::DateTime(_) => (FieldType::DateTime, false),
        Value::Time(_) => (FieldType::Time, false),
    }
}

/// Build the `COM_STMT_EXECUTE` payload (command byte included).
pub fn execute_payload(statement_id: u32, cursor_flags: u8, params: &[ExecuteParam<'_>]) -> Result<Vec<u8>> {
    let mut w = PacketWriter::with_capacity(16 + params.len() * 16);
    w.write_u8(Command::StmtExecute as u8);
    w.write_u32_le(statement_id);
    w.write_u8(cursor_flags);
    // Iteration count, always 1.
    w.write_u32_le(1);

    if params.is_empty() {
        return Ok(w.into_bytes());
    }

    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, param) in params.iter().enumerate() {
        if matches!(param, ExecuteParam::Value(Value::Null)) {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    w.write_bytes(&null_bitmap);

    // new-params-bound: types follow
    w.write_u8(1);
    for param in params {
        let (ty, unsigned) = match param {
            ExecuteParam::Value(value) => param_type(value),
            ExecuteParam::LongData(ty) => (*ty, false),
        };
        w.write_u8(ty as u8);
        w.write_u8(if unsigned { 0x80 } else { 0x00 });
    }

    for param in params {
        if let ExecuteParam::Value(value) = param {
            encode_binary_param(&mut w, value)?;
        }
    }

    Ok(w.into_bytes())
}

fn encode_binary_param(w: &mut PacketWriter, value: &Value) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(b) => w.write_u8(u8::from(*b)),
        Value::Int(i) => w.write_u64_le(*i as u64),
        Value::UInt(u) => w.write_u64_le(*u),
        Value::Float(f) => w.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => w.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => w.write_lenenc_string(s),
        Value::Bytes(b) => w.write_lenenc_bytes(b),
        Value::Json(j) => w.write_lenenc_string(&j.to_string()),
        Value::Date(d) => {
            if d.is_zero() {
                w.write_u8(0);
            } else {
                w.write_u8(4);
                w.write_u16_le(d.year);
                w.write_u8(d.month);
                w.write_u8(d.day);
            }
        }
        Value::DateTime(dt) => {
            if dt.is_zero() && dt.hour == 0 && dt.minute == 0 && dt.second == 0 && dt.micros == 0 {
                w.write_u8(0);
                return Ok(());
            }
            let len = if dt.micros != 0 {
                11
            } else if dt.hour != 0 || dt.minute != 0 || dt.second != 0 {
                7
            } else {
                4
            };
            w.write_u8(len);
            w.write_u16_le(dt.date.year);
            w.write_u8(dt.date.month);
            w.write_u8(dt.date.day);
            if len >= 7 {
                w.write_u8(dt.hour);
                w.write_u8(dt.minute);
                w.write_u8(dt.second);
            }
            if len == 11 {
                w.write_u32_le(dt.micros);
            }
        }
        Value::Time(t) => {
            if t.as_micros() == 0 {
                w.write_u8(0);
                return Ok(());
            }
            let len = if t.micros != 0 { 12 } else { 8 };
            w.write_u8(len);
            w.write_u8(u8::from(t.negative));
            w.write_u32_le(t.days);
            w.write_u8(t.hours);
            w.write_u8(t.minutes);
            w.write_u8(t.seconds);
            if len == 12 {
                w.write_u32_le(t.micros);
            }
        }
        Value::Spilled(col) => {
            return Err(Error::data(
                DataErrorKind::LongData,
                format!(
                    "spilled column {} must be sent as long data",
                    col.path().display()
                ),
            ));
        }
    }
    Ok(())
}

fn statement_payload(command: Command, statement_id: u32, extra: &[u8]) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(5 + extra.len());
    w.write_u8(command as u8);
    w.write_u32_le(statement_id);
    w.write_bytes(extra);
    w.into_bytes()
}

/// `COM_STMT_PREPARE` payload.
pub fn prepare_payload(sql: &str) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(1 + sql.len());
    w.write_u8(Command::StmtPrepare as u8);
    w.write_bytes(sql.as_bytes());
    w.into_bytes()
}

/// `COM_STMT_SEND_LONG_DATA` payload. Each one is sent as a fresh command.
pub fn long_data_payload(statement_id: u32, param_index: u16, chunk: &[u8]) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(LONG_DATA_HEADER_LEN + chunk.len());
    w.write_u8(Command::StmtSendLongData as u8);
    w.write_u32_le(statement_id);
    w.write_u16_le(param_index);
    w.write_bytes(chunk);
    w.into_bytes()
}

/// `COM_STMT_FETCH` payload asking for `rows` more rows from an open cursor.
pub fn fetch_payload(statement_id: u32, rows: u32) -> Vec<u8> {
    statement_payload(Command::StmtFetch, statement_id, &rows.to_le_bytes())
}

/// `COM_STMT_CLOSE` payload. The server does not answer.
pub fn close_payload(statement_id: u32) -> Vec<u8> {
    statement_payload(Command::StmtClose, statement_id, &[])
}

/// `COM_STMT_RESET` payload, discarding accumulated long data.
pub fn reset_payload(statement_id: u32) -> Vec<u8> {
    statement_payload(Command::StmtReset, statement_id, &[])
}

/// Length of a binary row's null bitmap (two reserved bits first).
pub const fn binary_null_bitmap_len(columns: usize) -> usize {
    (columns + 7 + 2) / 8
}

/// Is column `index` NULL in a binary row bitmap?
pub fn binary_row_is_null(bitmap: &[u8], index: usize) -> bool {
    let bit = index + 2;
    bitmap
        .get(bit / 8)
        .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketReader;
    use mywire_core::{Date, DateTime, Time};

    #[test]
    fn test_parse_prepare_ok() {
        let payload = [0x00, 0x07, 0, 0, 0, 0x02, 0x00, 0x03, 0x00, 0x00, 0x01, 0x00];
        let ok = StmtPrepareOk::parse(&payload).unwrap();
        assert_eq!(ok.statement_id, 7);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 3);
        assert_eq!(ok.warnings, 1);

        assert!(StmtPrepareOk::parse(&[0x00, 0x01]).is_err());
        assert!(StmtPrepareOk::parse(&[0xFF; 12]).is_err());
    }

    #[test]
    fn test_execute_layout() {
        let a = Value::Int(-2);
        let b = Value::Null;
        let c = Value::Text("hi".into());
        let params = [
            ExecuteParam::Value(&a),
            ExecuteParam::Value(&b),
            ExecuteParam::LongData(FieldType::Blob),
            ExecuteParam::Value(&c),
        ];
        let payload = execute_payload(9, cursor_type::READ_ONLY, &params).unwrap();
        let mut r = PacketReader::new(&payload);
        assert_eq!(r.read_u8(), Some(Command::StmtExecute as u8));
        assert_eq!(r.read_u32_le(), Some(9));
        assert_eq!(r.read_u8(), Some(cursor_type::READ_ONLY));
        assert_eq!(r.read_u32_le(), Some(1));
        assert_eq!(r.read_u8(), Some(0b0000_0010));
        assert_eq!(r.read_u8(), Some(1));
        assert_eq!(r.read_bytes(8), Some(&[0x08, 0, 0x06, 0, 0xFC, 0, 0xFD, 0][..]));
        assert_eq!(r.read_u64_le(), Some((-2_i64) as u64));
        // long-data parameter contributes no value bytes
        assert_eq!(r.read_lenenc_string(), Some("hi".to_string()));
        assert!(r.is_empty());
    }

    #[test]
    fn test_execute_without_params() {
        let payload = execute_payload(1, cursor_type::NO_CURSOR, &[]).unwrap();
        assert_eq!(payload, vec![0x17, 1, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_unsigned_flag() {
        let v = Value::UInt(u64::MAX);
        let payload = execute_payload(1, 0, &[ExecuteParam::Value(&v)]).unwrap();
        // bitmap, bound flag, then type pair
        assert_eq!(&payload[10..14], &[0x00, 0x01, 0x08, 0x80]);
    }

    #[test]
    fn test_temporal_params() {
        let date = Value::Date(Date::new(2024, 3, 9));
        let dt = Value::DateTime(DateTime::new(Date::new(2024, 3, 9), 1, 2, 3, 0));
        let time = Value::Time(Time {
            negative: true,
            days: 1,
            hours: 2,
            minutes: 3,
            seconds: 4,
            micros: 5,
        });
        let params = [
            ExecuteParam::Value(&date),
            ExecuteParam::Value(&dt),
            ExecuteParam::Value(&time),
        ];
        let payload = execute_payload(1, 0, &params).unwrap();
        let values = &payload[10 + 1 + 1 + 6..];
        assert_eq!(&values[..5], &[4, 0xE8, 0x07, 3, 9]);
        assert_eq!(&values[5..13], &[7, 0xE8, 0x07, 3, 9, 1, 2, 3]);
        assert_eq!(&values[13..], &[12, 1, 1, 0, 0, 0, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn test_statement_payloads() {
        assert_eq!(prepare_payload("SELECT ?")[0], Command::StmtPrepare as u8);
        assert_eq!(fetch_payload(2, 100), vec![0x1c, 2, 0, 0, 0, 100, 0, 0, 0]);
        assert_eq!(close_payload(3), vec![0x19, 3, 0, 0, 0]);
        assert_eq!(reset_payload(3), vec![0x1a, 3, 0, 0, 0]);
        assert_eq!(
            long_data_payload(0x0102_0304, 5, b"xy"),
            vec![0x18, 0x04, 0x03, 0x02, 0x01, 0x05, 0x00, b'x', b'y']
        );
        assert_eq!(long_data_payload(1, 0, &[]).len(), LONG_DATA_HEADER_LEN);
    }

    #[test]
    fn test_binary_null_bitmap_uses_division() {
        assert_eq!(binary_null_bitmap_len(1), 1);
        assert_eq!(binary_null_bitmap_len(6), 1);
        assert_eq!(binary_null_bitmap_len(7), 2);
        // column 6 lives in bit 0 of byte 1
        let bitmap = [0b0000_0100, 0b0000_0001];
        assert!(binary_row_is_null(&bitmap, 0));
        assert!(!binary_row_is_null(&bitmap, 1));
        assert!(binary_row_is_null(&bitmap, 6));
        assert!(!binary_row_is_null(&bitmap, 5));
        assert!(!binary_row_is_null(&bitmap, 40));
    }
}
