//! Column metadata and value decoding.
//!
//! Text rows carry every value as a length-encoded string; binary rows use
//! fixed layouts for numeric and temporal types. Both paths funnel through
//! [`ValueDecoder`], which applies the configured zero-date policy.

use crate::config::ZeroDatePolicy;
use crate::protocol::collation;
use crate::protocol::reader::{PacketReader, need};
use mywire_core::error::DataErrorKind;
use mywire_core::{Date, DateTime, Error, Result, Time, Value};

/// Wire type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Unknown codes are treated as strings.
    pub fn from_u8(value: u8) -> Self {
        use FieldType as F;
        match value {
            0x00 => F::Decimal,
            0x01 => F::Tiny,
            0x02 => F::Short,
            0x03 => F::Long,
            0x04 => F::Float,
            0x05 => F::Double,
            0x06 => F::Null,
            0x07 => F::Timestamp,
            0x08 => F::LongLong,
            0x09 => F::Int24,
            0x0A => F::Date,
            0x0B => F::Time,
            0x0C => F::DateTime,
            0x0D => F::Year,
            0x0E => F::NewDate,
            0x0F => F::VarChar,
            0x10 => F::Bit,
            0x11 => F::Timestamp2,
            0x12 => F::DateTime2,
            0x13 => F::Time2,
            0xF5 => F::Json,
            0xF6 => F::NewDecimal,
            0xF7 => F::Enum,
            0xF8 => F::Set,
            0xF9 => F::TinyBlob,
            0xFA => F::MediumBlob,
            0xFB => F::LongBlob,
            0xFC => F::Blob,
            0xFD => F::VarString,
            0xFF => F::Geometry,
            _ => F::String,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    pub const fn is_date(self) -> bool {
        matches!(self, FieldType::Date | FieldType::NewDate)
    }

    pub const fn is_datetime(self) -> bool {
        matches!(
            self,
            FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::DateTime2
                | FieldType::Timestamp2
        )
    }

    pub const fn is_time(self) -> bool {
        matches!(self, FieldType::Time | FieldType::Time2)
    }

    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    /// Binary protocol: is the value a length-encoded string?
    pub const fn is_length_encoded_in_binary(self) -> bool {
        !(self.is_integer()
            || self.is_date()
            || self.is_datetime()
            || self.is_time()
            || matches!(self, FieldType::Float | FieldType::Double | FieldType::Null))
    }

    /// Bytes a fixed-layout binary value occupies, given the bytes buffered
    /// from its start. `None` until a temporal value's length byte is in.
    pub fn binary_fixed_len(self, head: &[u8]) -> Option<usize> {
        match self {
            FieldType::Tiny => Some(1),
            FieldType::Short | FieldType::Year => Some(2),
            FieldType::Long | FieldType::Int24 | FieldType::Float => Some(4),
            FieldType::LongLong | FieldType::Double => Some(8),
            ty if ty.is_date() || ty.is_datetime() || ty.is_time() => {
                head.first().map(|len| 1 + usize::from(*len))
            }
            _ => Some(0),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column definition flags.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NUM: u16 = 32768;
}

/// One column definition packet (protocol 4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Always "def"
    pub catalog: String,
    pub schema: String,
    /// Table alias
    pub table: String,
    pub org_table: String,
    /// Column label (alias)
    pub name: String,
    pub org_name: String,
    pub collation: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        let text = |what: &str, r: &mut PacketReader<'_>| {
            need(r.read_lenenc_string(), what, payload)
        };

        let catalog = text("column catalog", &mut r)?;
        let schema = text("column schema", &mut r)?;
        let table = text("column table", &mut r)?;
        let org_table = text("column org_table", &mut r)?;
        let name = text("column name", &mut r)?;
        let org_name = text("column org_name", &mut r)?;

        // Length of the fixed-size block, always 0x0c.
        need(r.read_lenenc_int(), "column fixed length", payload)?;
        let collation = need(r.read_u16_le(), "column collation", payload)?;
        let column_length = need(r.read_u32_le(), "column length", payload)?;
        let column_type = FieldType::from_u8(need(r.read_u8(), "column type", payload)?);
        let flags = need(r.read_u16_le(), "column flags", payload)?;
        let decimals = need(r.read_u8(), "column decimals", payload)?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            collation,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    /// Label shown to callers.
    pub fn label(&self) -> &str {
        &self.name
    }

    pub const fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    pub const fn is_unique_key(&self) -> bool {
        self.flags & column_flags::UNIQUE_KEY != 0
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    pub const fn is_zerofill(&self) -> bool {
        self.flags & column_flags::ZEROFILL != 0
    }

    /// Bytes rather than text: the binary collation, or BIT/GEOMETRY.
    pub fn is_binary(&self) -> bool {
        self.collation == u16::from(collation::BINARY)
            || matches!(self.column_type, FieldType::Bit | FieldType::Geometry)
    }
}

/// Decodes column values and tracks zero-date violations for one result.
#[derive(Debug)]
pub struct ValueDecoder {
    policy: ZeroDatePolicy,
    zero_date_error: Option<Error>,
}

impl ValueDecoder {
    pub fn new(policy: ZeroDatePolicy) -> Self {
        Self {
            policy,
            zero_date_error: None,
        }
    }

    /// The zero-date error recorded under the `Exception` policy, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.zero_date_error.take()
    }

    /// Decode one non-NULL text-protocol value.
    pub fn text(&mut self, col: &ColumnDef, data: &[u8]) -> Value {
        let ty = col.column_type;
        if ty.is_integer() {
            let text = String::from_utf8_lossy(data);
            return if col.is_unsigned() {
                text.parse::<u64>().map_or_else(|_| Value::Text(text.into_owned()), Value::UInt)
            } else {
                text.parse::<i64>().map_or_else(|_| Value::Text(text.into_owned()), Value::Int)
            };
        }
        match ty {
            FieldType::Float => parse_or_text(data, Value::Float),
            FieldType::Double => parse_or_text(data, Value::Double),
            FieldType::Decimal | FieldType::NewDecimal => {
                Value::Decimal(String::from_utf8_lossy(data).into_owned())
            }
            FieldType::Null => Value::Null,
            FieldType::Json => decode_json(data),
            _ if ty.is_date() => match parse_date(data) {
                Some(date) => self.zero_date(col, Value::Date(date)),
                None => Value::Text(String::from_utf8_lossy(data).into_owned()),
            },
            _ if ty.is_datetime() => match parse_datetime(data) {
                Some(dt) => self.zero_date(col, Value::DateTime(dt)),
                None => Value::Text(String::from_utf8_lossy(data).into_owned()),
            },
            _ if ty.is_time() => parse_time(data).map_or_else(
                || Value::Text(String::from_utf8_lossy(data).into_owned()),
                Value::Time,
            ),
            _ => self.bytes_or_text(col, data),
        }
    }

    /// Decode one non-NULL binary-protocol value with a fixed layout.
    ///
    /// Length-encoded columns go through [`ValueDecoder::binary_bytes`].
    pub fn binary_fixed(&mut self, col: &ColumnDef, r: &mut PacketReader<'_>, payload: &[u8]) -> Result<Value> {
        let unsigned = col.is_unsigned();
        let value = match col.column_type {
            FieldType::Tiny => {
                let v = need(r.read_u8(), "binary TINY", payload)?;
                if unsigned { Value::UInt(u64::from(v)) } else { Value::Int(i64::from(v as i8)) }
            }
            FieldType::Short | FieldType::Year => {
                let v = need(r.read_u16_le(), "binary SHORT", payload)?;
                if unsigned || col.column_type == FieldType::Year {
                    Value::UInt(u64::from(v))
                } else {
                    Value::Int(i64::from(v as i16))
                }
            }
            FieldType::Long | FieldType::Int24 => {
                let v = need(r.read_u32_le(), "binary LONG", payload)?;
                if unsigned { Value::UInt(u64::from(v)) } else { Value::Int(i64::from(v as i32)) }
            }
            FieldType::LongLong => {
                let v = need(r.read_u64_le(), "binary LONGLONG", payload)?;
                if unsigned { Value::UInt(v) } else { Value::Int(v as i64) }
            }
            FieldType::Float => {
                let v = need(r.read_u32_le(), "binary FLOAT", payload)?;
                Value::Float(f32::from_bits(v))
            }
            FieldType::Double => {
                let v = need(r.read_u64_le(), "binary DOUBLE", payload)?;
                Value::Double(f64::from_bits(v))
            }
            FieldType::Null => Value::Null,
            ty if ty.is_date() || ty.is_datetime() => {
                let len = usize::from(need(r.read_u8(), "binary temporal length", payload)?);
                let body = need(r.read_bytes(len), "binary temporal", payload)?;
                let dt = decode_binary_datetime(body)
                    .ok_or_else(|| crate::protocol::malformed("binary DATETIME", payload))?;
                if ty.is_date() {
                    self.zero_date(col, Value::Date(dt.date))
                } else {
                    self.zero_date(col, Value::DateTime(dt))
                }
            }
            ty if ty.is_time() => {
                let len = usize::from(need(r.read_u8(), "binary time length", payload)?);
                let body = need(r.read_bytes(len), "binary TIME", payload)?;
                Value::Time(
                    decode_binary_time(body)
                        .ok_or_else(|| crate::protocol::malformed("binary TIME", payload))?,
                )
            }
            _ => {
                return Err(Error::protocol(format!(
                    "column type {} has no fixed binary layout",
                    col.column_type.name()
                )));
            }
        };
        Ok(value)
    }

    /// Decode a length-encoded binary-protocol value.
    pub fn binary_bytes(&mut self, col: &ColumnDef, data: &[u8]) -> Value {
        match col.column_type {
            FieldType::Decimal | FieldType::NewDecimal => {
                Value::Decimal(String::from_utf8_lossy(data).into_owned())
            }
            FieldType::Json => decode_json(data),
            _ => self.bytes_or_text(col, data),
        }
    }

    fn bytes_or_text(&mut self, col: &ColumnDef, data: &[u8]) -> Value {
        if col.is_binary() {
            Value::Bytes(data.to_vec())
        } else {
            match std::str::from_utf8(data) {
                Ok(s) => Value::Text(s.to_string()),
                Err(_) => Value::Bytes(data.to_vec()),
            }
        }
    }

    /// Apply the zero-date policy to a decoded DATE or DATETIME.
    fn zero_date(&mut self, col: &ColumnDef, value: Value) -> Value {
        let is_zero = match &value {
            Value::Date(d) => d.is_zero(),
            Value::DateTime(dt) => dt.is_zero(),
            _ => false,
        };
        if !is_zero {
            return value;
        }
        match self.policy {
            ZeroDatePolicy::ConvertToNull => Value::Null,
            ZeroDatePolicy::Round => match value {
                Value::DateTime(dt) => Value::DateTime(DateTime { date: Date::MIN, ..dt }),
                _ => Value::Date(Date::MIN),
            },
            ZeroDatePolicy::Exception => {
                tracing::warn!(column = %col.name, "zero date in result");
                if self.zero_date_error.is_none() {
                    self.zero_date_error = Some(Error::data(
                        DataErrorKind::ZeroDate,
                        format!(
                            "column '{}' holds the zero date 0000-00-00, which has no valid representation",
                            col.name
                        ),
                    ));
                }
                Value::Null
            }
        }
    }
}

fn parse_or_text<T: std::str::FromStr>(data: &[u8], wrap: fn(T) -> Value) -> Value {
    let text = String::from_utf8_lossy(data);
    text.trim()
        .parse::<T>()
        .map_or_else(|_| Value::Text(text.into_owned()), wrap)
}

fn decode_json(data: &[u8]) -> Value {
    serde_json::from_slice(data).map_or_else(
        |_| Value::Text(String::from_utf8_lossy(data).into_owned()),
        Value::Json,
    )
}

fn digits<T: std::str::FromStr>(s: &str, len: usize) -> Option<T> {
    if s.len() != len || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Fractional seconds text (1 to 6 digits) as microseconds.
fn parse_micros(frac: &str) -> Option<u32> {
    if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u32 = frac.parse().ok()?;
    Some(value * 10u32.pow(6 - frac.len() as u32))
}

/// `YYYY-MM-DD`
pub fn parse_date(data: &[u8]) -> Option<Date> {
    let s = std::str::from_utf8(data).ok()?;
    let mut parts = s.split('-');
    let year = digits(parts.next()?, 4)?;
    let month = digits(parts.next()?, 2)?;
    let day = digits(parts.next()?, 2)?;
    if parts.next().is_some() {
        return None;
    }
    Some(Date::new(year, month, day))
}

/// `YYYY-MM-DD hh:mm:ss[.ffffff]`
pub fn parse_datetime(data: &[u8]) -> Option<DateTime> {
    let s = std::str::from_utf8(data).ok()?;
    let (date, time) = s.split_once(' ').unwrap_or((s, "00:00:00"));
    let date = parse_date(date.as_bytes())?;
    let (hms, frac) = match time.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (time, None),
    };
    let mut parts = hms.split(':');
    let hour = digits(parts.next()?, 2)?;
    let minute = digits(parts.next()?, 2)?;
    let second = digits(parts.next()?, 2)?;
    if parts.next().is_some() {
        return None;
    }
    let micros = match frac {
        Some(f) => parse_micros(f)?,
        None => 0,
    };
    Some(DateTime::new(date, hour, minute, second, micros))
}

/// `[-]h..h:mm:ss[.ffffff]`, hours possibly above 24
pub fn parse_time(data: &[u8]) -> Option<Time> {
    let s = std::str::from_utf8(data).ok()?;
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (hms, frac) = match s.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (s, None),
    };
    let mut parts = hms.split(':');
    let hours_text = parts.next()?;
    if hours_text.is_empty() || !hours_text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let total_hours: u32 = hours_text.parse().ok()?;
    let minutes = digits(parts.next()?, 2)?;
    let seconds = digits(parts.next()?, 2)?;
    if parts.next().is_some() {
        return None;
    }
    let micros = match frac {
        Some(f) => parse_micros(f)?,
        None => 0,
    };
    Some(Time {
        negative,
        days: total_hours / 24,
        hours: (total_hours % 24) as u8,
        minutes,
        seconds,
        micros,
    })
}

/// Binary DATE/DATETIME/TIMESTAMP body keyed by its length:
/// 0 = zero date, 4 = date, 7 = date + time, 11 = + microseconds.
pub fn decode_binary_datetime(body: &[u8]) -> Option<DateTime> {
    let zero = DateTime::new(Date::new(0, 0, 0), 0, 0, 0, 0);
    match body.len() {
        0 => Some(zero),
        4 | 7 | 11 => {
            let date = Date::new(u16::from_le_bytes([body[0], body[1]]), body[2], body[3]);
            let mut dt = DateTime { date, ..zero };
            if body.len() >= 7 {
                dt.hour = body[4];
                dt.minute = body[5];
                dt.second = body[6];
            }
            if body.len() == 11 {
                dt.micros = u32::from_le_bytes([body[7], body[8], body[9], body[10]]);
            }
            Some(dt)
        }
        _ => None,
    }
}

/// Binary TIME body: 0, 8 or 12 bytes.
pub fn decode_binary_time(body: &[u8]) -> Option<Time> {
    match body.len() {
        0 => Some(Time::default()),
        8 | 12 => Some(Time {
            negative: body[0] != 0,
            days: u32::from_le_bytes([body[1], body[2], body[3], body[4]]),
            hours: body[5],
            minutes: body[6],
            seconds: body[7],
            micros: if body.len() == 12 {
                u32::from_le_bytes([body[8], body[9], body[10], body[11]])
            } else {
                0
            },
        }),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::PacketWriter;

    /// Build a column definition payload.
    pub(crate) fn column_payload(name: &str, ty: FieldType, flags: u16, collation: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("def");
        w.write_lenenc_string("test");
        w.write_lenenc_string("t");
        w.write_lenenc_string("t");
        w.write_lenenc_string(name);
        w.write_lenenc_string(name);
        w.write_lenenc_int(0x0c);
        w.write_u16_le(collation);
        w.write_u32_le(255);
        w.write_u8(ty as u8);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    pub(crate) fn column(name: &str, ty: FieldType, flags: u16) -> ColumnDef {
        ColumnDef::parse(&column_payload(name, ty, flags, 45)).unwrap()
    }

    #[test]
    fn test_field_type_from_u8() {
        assert_eq!(FieldType::from_u8(0x01), FieldType::Tiny);
        assert_eq!(FieldType::from_u8(0xF5), FieldType::Json);
        assert_eq!(FieldType::from_u8(0x42), FieldType::String);
        assert!(FieldType::LongLong.is_integer());
        assert!(FieldType::Blob.is_length_encoded_in_binary());
        assert!(FieldType::NewDecimal.is_length_encoded_in_binary());
        assert!(!FieldType::DateTime.is_length_encoded_in_binary());
        assert!(!FieldType::Double.is_length_encoded_in_binary());
        assert_eq!(FieldType::Int24.binary_fixed_len(&[]), Some(4));
        assert_eq!(FieldType::DateTime.binary_fixed_len(&[]), None);
        assert_eq!(FieldType::DateTime.binary_fixed_len(&[7, 0]), Some(8));
        assert_eq!(FieldType::Time.binary_fixed_len(&[0]), Some(1));
    }

    #[test]
    fn test_parse_column_def() {
        let payload = column_payload(
            "id",
            FieldType::LongLong,
            column_flags::NOT_NULL | column_flags::PRIMARY_KEY | column_flags::UNSIGNED,
            63,
        );
        let col = ColumnDef::parse(&payload).unwrap();
        assert_eq!(col.catalog, "def");
        assert_eq!(col.schema, "test");
        assert_eq!(col.label(), "id");
        assert_eq!(col.column_type, FieldType::LongLong);
        assert!(!col.is_nullable());
        assert!(col.is_primary_key());
        assert!(col.is_unsigned());
        assert!(col.is_binary());
        assert!(!col.is_auto_increment());

        assert!(ColumnDef::parse(&payload[..10]).unwrap_err().is_fatal());
    }

    #[test]
    fn test_text_numbers() {
        let mut d = ValueDecoder::new(ZeroDatePolicy::Exception);
        assert_eq!(d.text(&column("a", FieldType::Long, 0), b"-42"), Value::Int(-42));
        assert_eq!(
            d.text(
                &column("a", FieldType::LongLong, column_flags::UNSIGNED),
                b"18446744073709551615"
            ),
            Value::UInt(u64::MAX)
        );
        assert_eq!(d.text(&column("a", FieldType::Double, 0), b"1.5"), Value::Double(1.5));
        assert_eq!(
            d.text(&column("a", FieldType::NewDecimal, 0), b"10.50"),
            Value::Decimal("10.50".into())
        );
        assert_eq!(
            d.text(&column("a", FieldType::VarString, 0), b"hello"),
            Value::Text("hello".into())
        );
        assert_eq!(
            d.text(&column("a", FieldType::Json, 0), br#"{"a":1}"#),
            Value::Json(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn test_text_temporal() {
        let mut d = ValueDecoder::new(ZeroDatePolicy::Exception);
        assert_eq!(
            d.text(&column("d", FieldType::Date, 0), b"2024-02-29"),
            Value::Date(Date::new(2024, 2, 29))
        );
        assert_eq!(
            d.text(&column("d", FieldType::DateTime, 0), b"2024-02-29 23:59:58.5"),
            Value::DateTime(DateTime::new(Date::new(2024, 2, 29), 23, 59, 58, 500_000))
        );
        let Value::Time(t) = d.text(&column("t", FieldType::Time, 0), b"-838:59:59") else {
            panic!("expected time");
        };
        assert!(t.negative);
        assert_eq!(t.total_hours(), 838);
        assert_eq!(t.to_string(), "-838:59:59");
        assert!(d.take_error().is_none());
    }

    #[test]
    fn test_zero_date_policies() {
        let date_col = column("d", FieldType::Date, 0);
        let dt_col = column("dt", FieldType::DateTime, 0);

        let mut d = ValueDecoder::new(ZeroDatePolicy::ConvertToNull);
        assert_eq!(d.text(&date_col, b"0000-00-00"), Value::Null);
        assert!(d.take_error().is_none());

        let mut d = ValueDecoder::new(ZeroDatePolicy::Round);
        assert_eq!(d.text(&date_col, b"0000-00-00"), Value::Date(Date::MIN));
        assert_eq!(
            d.text(&dt_col, b"0000-00-00 10:11:12"),
            Value::DateTime(DateTime::new(Date::MIN, 10, 11, 12, 0))
        );

        let mut d = ValueDecoder::new(ZeroDatePolicy::Exception);
        assert_eq!(d.text(&date_col, b"0000-00-00"), Value::Null);
        assert_eq!(d.text(&dt_col, b"0000-00-00 00:00:00"), Value::Null);
        let err = d.take_error().unwrap();
        assert_eq!(err.data_kind(), Some(DataErrorKind::ZeroDate));
        assert!(d.take_error().is_none());
    }

    #[test]
    fn test_binary_fixed_layouts() {
        let mut d = ValueDecoder::new(ZeroDatePolicy::Round);
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u32_le(0xFFFF_FFFE);
        w.write_u64_le(2.5_f64.to_bits());
        w.write_u8(11);
        w.write_u16_le(2023);
        w.write_bytes(&[12, 31, 23, 59, 59]);
        w.write_u32_le(999_999);
        w.write_u8(0);
        w.write_u8(8);
        w.write_bytes(&[1, 1, 0, 0, 0, 2, 3, 4]);
        let payload = w.into_bytes();
        let mut r = PacketReader::new(&payload);

        let tiny = column("a", FieldType::Tiny, 0);
        let long = column("b", FieldType::Long, column_flags::UNSIGNED);
        let dbl = column("c", FieldType::Double, 0);
        let dt = column("d", FieldType::DateTime, 0);
        let date = column("e", FieldType::Date, 0);
        let time = column("f", FieldType::Time, 0);

        assert_eq!(d.binary_fixed(&tiny, &mut r, &payload).unwrap(), Value::Int(-1));
        assert_eq!(
            d.binary_fixed(&long, &mut r, &payload).unwrap(),
            Value::UInt(0xFFFF_FFFE)
        );
        assert_eq!(d.binary_fixed(&dbl, &mut r, &payload).unwrap(), Value::Double(2.5));
        assert_eq!(
            d.binary_fixed(&dt, &mut r, &payload).unwrap(),
            Value::DateTime(DateTime::new(Date::new(2023, 12, 31), 23, 59, 59, 999_999))
        );
        // Zero-length date under Round.
        assert_eq!(
            d.binary_fixed(&date, &mut r, &payload).unwrap(),
            Value::Date(Date::MIN)
        );
        let Value::Time(t) = d.binary_fixed(&time, &mut r, &payload).unwrap() else {
            panic!("expected time");
        };
        assert!(t.negative);
        assert_eq!(t.to_string(), "-26:03:04");
        assert!(r.is_empty());
    }

    #[test]
    fn test_binary_temporal_lengths() {
        assert!(decode_binary_datetime(&[]).unwrap().is_zero());
        assert_eq!(
            decode_binary_datetime(&[0xE8, 0x07, 1, 2]).unwrap(),
            DateTime::new(Date::new(2024, 1, 2), 0, 0, 0, 0)
        );
        assert!(decode_binary_datetime(&[0; 5]).is_none());
        assert_eq!(decode_binary_time(&[]).unwrap(), Time::default());
        assert!(decode_binary_time(&[0; 9]).is_none());
    }

    #[test]
    fn test_binary_collation_yields_bytes() {
        let mut d = ValueDecoder::new(ZeroDatePolicy::Exception);
        let blob = ColumnDef::parse(&column_payload("b", FieldType::Blob, 0, 63)).unwrap();
        assert_eq!(d.binary_bytes(&blob, b"\x00\x01"), Value::Bytes(vec![0, 1]));
        let text = column("t", FieldType::Blob, 0);
        assert_eq!(d.binary_bytes(&text, b"abc"), Value::Text("abc".into()));
    }
}
