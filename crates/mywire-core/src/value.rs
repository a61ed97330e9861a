//! Dynamic MySQL values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A dynamically-typed MySQL value.
///
/// Used both for decoded column values and for prepared statement
/// parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean parameter (sent as TINYINT)
    Bool(bool),

    /// Signed integer of any width
    Int(i64),

    /// Unsigned integer of any width
    UInt(u64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (kept as text)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// DATE
    Date(Date),

    /// TIME (signed duration, may exceed 24 hours)
    Time(Time),

    /// DATETIME / TIMESTAMP
    DateTime(DateTime),

    /// JSON document
    Json(serde_json::Value),

    /// Column too large to buffer, streamed to a temp file
    #[serde(skip)]
    Spilled(SpilledColumn),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "BIGINT",
            Value::UInt(_) => "BIGINT UNSIGNED",
            Value::Float(_) => "FLOAT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::DateTime(_) => "DATETIME",
            Value::Json(_) => "JSON",
            Value::Spilled(_) => "SPILLED",
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to convert this value to a u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Get the spill reference if this column was written to disk.
    pub fn as_spilled(&self) -> Option<&SpilledColumn> {
        match self {
            Value::Spilled(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(u64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Date> for Value {
    fn from(v: Date) -> Self {
        Value::Date(v)
    }
}

impl From<DateTime> for Value {
    fn from(v: DateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<Time> for Value {
    fn from(v: Time) -> Self {
        Value::Time(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// A calendar date as MySQL stores it (no validation beyond field widths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl Date {
    /// The smallest date MySQL considers valid.
    pub const MIN: Date = Date {
        year: 1,
        month: 1,
        day: 1,
    };

    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    /// `0000-00-00`, the MySQL "zero date".
    pub const fn is_zero(&self) -> bool {
        self.year == 0 && self.month == 0 && self.day == 0
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// A DATETIME or TIMESTAMP value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateTime {
    pub date: Date,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub micros: u32,
}

impl DateTime {
    pub const fn new(date: Date, hour: u8, minute: u8, second: u8, micros: u32) -> Self {
        Self {
            date,
            hour,
            minute,
            second,
            micros,
        }
    }

    /// Zero date part, regardless of the time part.
    pub const fn is_zero(&self) -> bool {
        self.date.is_zero()
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}:{:02}",
            self.date, self.hour, self.minute, self.second
        )?;
        if self.micros > 0 {
            write!(f, ".{:06}", self.micros)?;
        }
        Ok(())
    }
}

/// A TIME value: a signed duration up to 838:59:59.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Time {
    pub negative: bool,
    pub days: u32,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub micros: u32,
}

impl Time {
    /// Total hours including the day component.
    pub fn total_hours(&self) -> u64 {
        u64::from(self.days) * 24 + u64::from(self.hours)
    }

    /// Signed total microseconds.
    pub fn as_micros(&self) -> i64 {
        let secs = self.total_hours() as i64 * 3600
            + i64::from(self.minutes) * 60
            + i64::from(self.seconds);
        let total = secs * 1_000_000 + i64::from(self.micros);
        if self.negative { -total } else { total }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.negative { "-" } else { "" };
        write!(
            f,
            "{}{:02}:{:02}:{:02}",
            sign,
            self.total_hours(),
            self.minutes,
            self.seconds
        )?;
        if self.micros > 0 {
            write!(f, ".{:06}", self.micros)?;
        }
        Ok(())
    }
}

/// A column value that was streamed to a temp file instead of memory.
///
/// Clones share the same file. The file is removed when the last clone is
/// dropped unless [`SpilledColumn::keep`] was called first.
#[derive(Debug, Clone)]
pub struct SpilledColumn {
    inner: Arc<SpillInner>,
}

#[derive(Debug)]
struct SpillInner {
    path: PathBuf,
    len: u64,
    keep: AtomicBool,
}

impl SpilledColumn {
    /// Take ownership of a fully written spill file.
    pub fn new(path: PathBuf, len: u64) -> Self {
        Self {
            inner: Arc::new(SpillInner {
                path,
                len,
                keep: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Column length in bytes.
    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Open a read handle on the spilled bytes.
    pub fn open(&self) -> io::Result<File> {
        File::open(&self.inner.path)
    }

    /// Read the whole column back into memory.
    pub fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(usize::try_from(self.inner.len).unwrap_or(0));
        self.open()?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Leave the file on disk after the last handle is dropped.
    pub fn keep(&self) -> &Path {
        self.inner.keep.store(true, Ordering::Release);
        &self.inner.path
    }

    /// Delete the file now.
    pub fn remove(&self) -> io::Result<()> {
        self.inner.keep.store(true, Ordering::Release);
        std::fs::remove_file(&self.inner.path)
    }
}

impl PartialEq for SpilledColumn {
    fn eq(&self, other: &Self) -> bool {
        self.inner.path == other.inner.path && self.inner.len == other.inner.len
    }
}

impl Drop for SpillInner {
    fn drop(&mut self) {
        if self.keep.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove spilled column file"
                );
            }
        }
    }
}
