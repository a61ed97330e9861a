//! Result set reading and delivery.
//!
//! A [`ResultSetReader`] consumes one result set payload by payload:
//! column count, column definitions, optional EOF, rows, terminator. Rows
//! are decoded into a reusable [`CurrentRow`]; a [`ResultSink`] that wants
//! to keep one calls [`CurrentRow::snapshot`].

use crate::config::{MySqlConfig, ZeroDatePolicy};
use crate::protocol::prepared::{binary_null_bitmap_len, binary_row_is_null};
use crate::protocol::reader::need;
use crate::protocol::server_status::{
    SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_CURSOR_EXISTS, SERVER_STATUS_IN_TRANS,
    SERVER_STATUS_LAST_ROW_SENT,
};
use crate::protocol::{
    EofPacket, LenEnc, MAX_PACKET_SIZE, OkPacket, PacketReader, PacketType, malformed,
    server_error,
};
use crate::scheduler::{Piece, Responder};
use crate::spill::{SpillWriter, TempFileProvider};
use crate::types::{ColumnDef, ValueDecoder};
use futures_channel::{mpsc, oneshot};
use mywire_core::{ColumnInfo, Error, Result, Row, Value};
use std::sync::Arc;

/// Terminator state of one result or OK response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultState {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub status_flags: u16,
    pub info: String,
}

impl ResultState {
    pub fn from_ok(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            status_flags: ok.status_flags,
            info: ok.info,
        }
    }

    pub fn from_eof(eof: EofPacket) -> Self {
        Self {
            warnings: eof.warnings,
            status_flags: eof.status_flags,
            ..Self::default()
        }
    }

    /// Another result set follows in this command.
    pub fn more_results(&self) -> bool {
        self.status_flags & SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn cursor_exists(&self) -> bool {
        self.status_flags & SERVER_STATUS_CURSOR_EXISTS != 0
    }

    pub fn last_row_sent(&self) -> bool {
        self.status_flags & SERVER_STATUS_LAST_ROW_SENT != 0
    }

    /// An open cursor still holds rows for `COM_STMT_FETCH`.
    pub fn more_fetch(&self) -> bool {
        self.cursor_exists() && !self.last_row_sent()
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & SERVER_STATUS_IN_TRANS != 0
    }
}

/// The row being decoded, overwritten in place for every row.
#[derive(Debug, Clone)]
pub struct CurrentRow {
    columns: Arc<ColumnInfo>,
    values: Vec<Value>,
    big: bool,
}

impl CurrentRow {
    fn new(columns: Arc<ColumnInfo>) -> Self {
        let width = columns.len();
        Self {
            columns,
            values: Vec::with_capacity(width),
            big: false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Any column of this row lives in a spill file.
    pub fn is_big_row(&self) -> bool {
        self.big
    }

    /// Copy the row out; spill files are shared with the copy.
    pub fn snapshot(&self) -> Row {
        Row::with_columns(Arc::clone(&self.columns), self.values.clone())
    }

    fn clear(&mut self) {
        self.values.clear();
        self.big = false;
    }

    fn push(&mut self, value: Value) {
        self.big |= matches!(value, Value::Spilled(_));
        self.values.push(value);
    }
}

/// Consumer of one command's results, in wire order.
pub trait ResultSink: Send {
    fn metadata(&mut self, columns: &Arc<[ColumnDef]>);

    fn row(&mut self, row: &CurrentRow);

    /// End of one result set, or an OK response.
    fn terminator(&mut self, state: &ResultState);

    /// The command finished successfully. Nothing follows.
    fn done(&mut self);

    /// The command failed. Nothing follows.
    fn error(&mut self, error: Error);
}

/// Items of a result stream.
#[derive(Debug, Clone)]
pub enum ResultEvent {
    Metadata(Arc<[ColumnDef]>),
    Row(Row),
    Terminator(ResultState),
    Done,
    Error(Error),
}

/// Sink forwarding every event into an unbounded channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ResultEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResultEvent>) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx)
    }

    fn push(&mut self, event: ResultEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.unbounded_send(event);
    }
}

impl ResultSink for ChannelSink {
    fn metadata(&mut self, columns: &Arc<[ColumnDef]>) {
        self.push(ResultEvent::Metadata(Arc::clone(columns)));
    }

    fn row(&mut self, row: &CurrentRow) {
        self.push(ResultEvent::Row(row.snapshot()));
    }

    fn terminator(&mut self, state: &ResultState) {
        self.push(ResultEvent::Terminator(state.clone()));
    }

    fn done(&mut self) {
        self.push(ResultEvent::Done);
    }

    fn error(&mut self, error: Error) {
        self.push(ResultEvent::Error(error));
    }
}

/// One result of a command, held in memory.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// `None` for an OK response
    pub columns: Option<Arc<[ColumnDef]>>,
    pub rows: Vec<Row>,
    pub state: ResultState,
}

/// Sink that buffers every result and answers once the command ends.
#[derive(Debug)]
pub struct CollectSink {
    results: Vec<QueryResult>,
    current: QueryResult,
    responder: Responder<Vec<QueryResult>>,
}

impl CollectSink {
    pub fn new() -> (Self, oneshot::Receiver<Result<Vec<QueryResult>>>) {
        let (responder, rx) = Responder::new();
        let sink = Self {
            results: Vec::new(),
            current: QueryResult::default(),
            responder,
        };
        (sink, rx)
    }
}

impl ResultSink for CollectSink {
    fn metadata(&mut self, columns: &Arc<[ColumnDef]>) {
        self.current.columns = Some(Arc::clone(columns));
    }

    fn row(&mut self, row: &CurrentRow) {
        self.current.rows.push(row.snapshot());
    }

    fn terminator(&mut self, state: &ResultState) {
        let mut result = std::mem::take(&mut self.current);
        result.state = state.clone();
        self.results.push(result);
    }

    fn done(&mut self) {
        self.responder.send(Ok(std::mem::take(&mut self.results)));
    }

    fn error(&mut self, error: Error) {
        self.responder.send(Err(error));
    }
}

/// Row encoding of a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// COM_QUERY: every value a length-encoded string
    Text,
    /// COM_STMT_EXECUTE: null bitmap plus typed values
    Binary,
}

/// Settings a reader takes from the connection.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub deprecate_eof: bool,
    pub zero_date_policy: ZeroDatePolicy,
    pub spill_threshold: Option<u64>,
    pub temp_files: Arc<dyn TempFileProvider>,
}

impl ReaderOptions {
    pub fn new(config: &MySqlConfig, deprecate_eof: bool, temp_files: Arc<dyn TempFileProvider>) -> Self {
        Self {
            deprecate_eof,
            zero_date_policy: config.zero_date_policy,
            spill_threshold: config.spill_threshold,
            temp_files,
        }
    }
}

/// Reads `count` column definitions and, without `DEPRECATE_EOF`, the EOF
/// after them.
#[derive(Debug)]
pub struct ColumnBlock {
    expected: usize,
    columns: Vec<ColumnDef>,
    expect_eof: bool,
    eof: Option<EofPacket>,
}

impl ColumnBlock {
    pub fn new(expected: usize, deprecate_eof: bool) -> Self {
        Self {
            expected,
            columns: Vec::with_capacity(expected),
            expect_eof: !deprecate_eof,
            eof: None,
        }
    }

    /// Feed one payload; returns the columns once the block is complete.
    pub fn feed(&mut self, payload: &[u8]) -> Result<Option<Arc<[ColumnDef]>>> {
        if self.columns.len() < self.expected {
            self.columns.push(ColumnDef::parse(payload)?);
            if self.columns.len() < self.expected || self.expect_eof {
                return Ok(None);
            }
        } else if self.expect_eof {
            if PacketType::of(payload) != PacketType::Eof {
                return Err(malformed("EOF after column definitions", payload));
            }
            self.eof = PacketReader::new(payload).parse_eof_packet();
            self.expect_eof = false;
        } else {
            return Err(malformed("unexpected payload after column definitions", payload));
        }
        Ok(Some(Arc::from(std::mem::take(&mut self.columns))))
    }

    /// The EOF that closed the block, if one was read.
    pub fn eof(&self) -> Option<EofPacket> {
        self.eof
    }
}

/// What one payload amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A column definition; the metadata is not complete yet
    Pending,
    /// All column definitions are in
    Metadata(Arc<[ColumnDef]>),
    /// The current row was decoded
    Row,
    /// A row was consumed without decoding
    Skipped,
    /// End of the result set
    Terminator(ResultState),
}

#[derive(Debug)]
enum Phase {
    Metadata(ColumnBlock),
    Rows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceMode {
    /// Decode values as their bytes arrive
    Row,
    /// Error or terminator: collect it and decode it whole
    Whole,
    /// Consumed without decoding
    Skip,
}

/// Destination of a value too long to buffer.
#[derive(Debug)]
enum ColumnSink {
    Spill { writer: SpillWriter, remaining: u64 },
    /// Spilling failed; the rest of the value is dropped
    Discard { remaining: u64 },
}

impl ColumnSink {
    fn remaining(&self) -> u64 {
        match self {
            ColumnSink::Spill { remaining, .. } | ColumnSink::Discard { remaining } => *remaining,
        }
    }
}

/// A row payload that is still arriving.
#[derive(Debug)]
struct PartialRow {
    mode: PieceMode,
    /// Received, not yet decoded
    buf: Vec<u8>,
    /// Binary rows only, once read
    bitmap: Option<Vec<u8>>,
    column: usize,
    sink: Option<ColumnSink>,
}

/// Decoder for one result set.
#[derive(Debug)]
pub struct ResultSetReader {
    format: RowFormat,
    options: ReaderOptions,
    phase: Phase,
    columns: Arc<[ColumnDef]>,
    current: CurrentRow,
    decoder: ValueDecoder,
    skipping: bool,
    /// Status from the EOF closing the metadata
    metadata_status: Option<ResultState>,
    deferred: Option<Error>,
    rows: u64,
    partial: Option<PartialRow>,
}

impl ResultSetReader {
    /// Start after the column count payload.
    pub fn new(column_count: usize, format: RowFormat, options: ReaderOptions) -> Self {
        let block = ColumnBlock::new(column_count, options.deprecate_eof);
        let decoder = ValueDecoder::new(options.zero_date_policy);
        Self {
            format,
            options,
            phase: Phase::Metadata(block),
            columns: Arc::from(Vec::new()),
            current: CurrentRow::new(Arc::new(ColumnInfo::default())),
            decoder,
            skipping: false,
            metadata_status: None,
            deferred: None,
            rows: 0,
            partial: None,
        }
    }

    /// Parse a column count payload and start a reader.
    pub fn from_column_count(payload: &[u8], format: RowFormat, options: ReaderOptions) -> Result<Self> {
        let count = need(
            PacketReader::new(payload).read_lenenc_int(),
            "column count",
            payload,
        )?;
        let count = usize::try_from(count).map_err(|_| malformed("column count", payload))?;
        if count == 0 {
            return Err(malformed("column count", payload));
        }
        Ok(Self::new(count, format, options))
    }

    pub fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    pub fn current_row(&self) -> &CurrentRow {
        &self.current
    }

    pub fn rows_read(&self) -> u64 {
        self.rows
    }

    /// Stop decoding; remaining rows are only consumed.
    pub fn skip_remaining(&mut self) {
        self.skipping = true;
    }

    pub fn is_skipping(&self) -> bool {
        self.skipping
    }

    /// Status of the EOF that followed the metadata (no `DEPRECATE_EOF`).
    pub fn metadata_status(&self) -> Option<&ResultState> {
        self.metadata_status.as_ref()
    }

    /// First zero-date or spill error met so far.
    pub fn take_error(&mut self) -> Option<Error> {
        self.deferred.take()
    }

    pub fn feed(&mut self, payload: &[u8]) -> Result<ReadOutcome> {
        match &mut self.phase {
            Phase::Metadata(block) => {
                let Some(columns) = block.feed(payload)? else {
                    return Ok(ReadOutcome::Pending);
                };
                self.metadata_status = block.eof().map(ResultState::from_eof);
                let names = columns.iter().map(|c| c.label().to_string()).collect();
                self.current = CurrentRow::new(Arc::new(ColumnInfo::new(names)));
                self.columns = Arc::clone(&columns);
                self.phase = Phase::Rows;
                tracing::trace!(columns = columns.len(), "result metadata");
                Ok(ReadOutcome::Metadata(columns))
            }
            Phase::Rows => self.feed_row(payload),
        }
    }

    /// Row payloads whose first frame is longer than this should come
    /// through [`feed_piece`](Self::feed_piece).
    pub fn piece_threshold(&self) -> Option<usize> {
        match self.phase {
            Phase::Rows => self
                .options
                .spill_threshold
                .map(|limit| usize::try_from(limit).unwrap_or(usize::MAX)),
            Phase::Metadata(_) => None,
        }
    }

    /// Like [`feed`](Self::feed) for a row payload handed over as it
    /// arrives. Returns `None` until the last piece is in.
    ///
    /// A value over the spill threshold goes to its temp file piece by
    /// piece and is never held in memory. Smaller values are buffered only
    /// until they are complete.
    pub fn feed_piece(&mut self, piece: Piece<'_>) -> Result<Option<ReadOutcome>> {
        if !matches!(self.phase, Phase::Rows) {
            return Err(Error::protocol("partial payload before result metadata"));
        }
        let mut partial = if piece.first {
            self.begin_partial(piece)
        } else {
            self.partial
                .take()
                .ok_or_else(|| Error::protocol("partial payload without its start"))?
        };
        self.absorb(&mut partial, piece.bytes)?;
        if !piece.last {
            self.partial = Some(partial);
            return Ok(None);
        }
        self.finish_partial(partial).map(Some)
    }

    fn begin_partial(&mut self, piece: Piece<'_>) -> PartialRow {
        let whole = match piece.bytes.first() {
            Some(0xFF) => true,
            Some(0xFE) if self.options.deprecate_eof => piece.frame_len < MAX_PACKET_SIZE,
            Some(0xFE) => piece.frame_len < 9,
            _ => false,
        };
        let mode = if whole {
            PieceMode::Whole
        } else if self.skipping {
            PieceMode::Skip
        } else {
            self.current.clear();
            PieceMode::Row
        };
        PartialRow {
            mode,
            buf: Vec::new(),
            bitmap: None,
            column: 0,
            sink: None,
        }
    }

    fn absorb(&mut self, partial: &mut PartialRow, mut bytes: &[u8]) -> Result<()> {
        match partial.mode {
            PieceMode::Skip => return Ok(()),
            PieceMode::Whole => {
                partial.buf.extend_from_slice(bytes);
                return Ok(());
            }
            PieceMode::Row => {}
        }
        while !bytes.is_empty() {
            if partial.sink.is_some() {
                let used = self.stream_column(partial, bytes);
                bytes = &bytes[used..];
            } else {
                partial.buf.extend_from_slice(bytes);
                bytes = &[];
                self.decode_buffered(partial)?;
            }
        }
        Ok(())
    }

    /// Decode every value whose bytes are all buffered.
    fn decode_buffered(&mut self, partial: &mut PartialRow) -> Result<()> {
        let buf = std::mem::take(&mut partial.buf);
        let mut pos = 0;
        let result = loop {
            if partial.sink.is_some() {
                pos += self.stream_column(partial, &buf[pos..]);
                if partial.sink.is_some() {
                    break Ok(());
                }
                continue;
            }
            match self.next_value(partial, &buf[pos..]) {
                Ok(Some(used)) => pos += used,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        partial.buf = buf;
        partial.buf.drain(..pos);
        result
    }

    /// Decode the value at the start of `avail`. Returns the bytes used,
    /// or `None` when more must arrive first.
    fn next_value(&mut self, partial: &mut PartialRow, avail: &[u8]) -> Result<Option<usize>> {
        let binary = self.format == RowFormat::Binary;
        if binary && partial.bitmap.is_none() {
            let len = 1 + binary_null_bitmap_len(self.columns.len());
            let Some(head) = avail.get(..len) else {
                return Ok(None);
            };
            if head[0] != 0x00 {
                return Err(malformed("binary row header", avail));
            }
            partial.bitmap = Some(head[1..].to_vec());
            return Ok(Some(len));
        }

        let columns = Arc::clone(&self.columns);
        let Some(col) = columns.get(partial.column) else {
            return Ok(None);
        };
        let is_null = partial
            .bitmap
            .as_deref()
            .is_some_and(|bitmap| binary_row_is_null(bitmap, partial.column));
        if is_null {
            self.current.push(Value::Null);
            partial.column += 1;
            return Ok(Some(0));
        }

        if binary && !col.column_type.is_length_encoded_in_binary() {
            let Some(body) = col
                .column_type
                .binary_fixed_len(avail)
                .and_then(|len| avail.get(..len))
            else {
                return Ok(None);
            };
            let value = self.decoder.binary_fixed(col, &mut PacketReader::new(body), body)?;
            self.current.push(value);
            partial.column += 1;
            return Ok(Some(body.len()));
        }

        let mut r = PacketReader::new(avail);
        let len = match r.read_lenenc() {
            Some(LenEnc::Value(len)) => len,
            Some(LenEnc::Null) => {
                self.current.push(Value::Null);
                partial.column += 1;
                return Ok(Some(1));
            }
            None if avail.len() >= 9 || avail.first() == Some(&0xFF) => {
                return Err(malformed("row value length", avail));
            }
            None => return Ok(None),
        };
        let head = r.position();
        if self.should_spill(len) {
            partial.sink = Some(self.open_sink(len));
            return Ok(Some(head));
        }
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| head.checked_add(len))
            .ok_or_else(|| malformed("row value length", avail))?;
        let Some(bytes) = avail.get(head..end) else {
            return Ok(None);
        };
        let value = match self.format {
            RowFormat::Text => self.decoder.text(col, bytes),
            RowFormat::Binary => self.decoder.binary_bytes(col, bytes),
        };
        self.current.push(value);
        partial.column += 1;
        Ok(Some(end))
    }

    fn open_sink(&mut self, len: u64) -> ColumnSink {
        match SpillWriter::create(self.options.temp_files.as_ref(), len) {
            Ok(writer) => ColumnSink::Spill {
                writer,
                remaining: len,
            },
            Err(err) => {
                self.spill_failed(err);
                ColumnSink::Discard { remaining: len }
            }
        }
    }

    /// Pass bytes to the value being spilled; returns how many it took.
    fn stream_column(&mut self, partial: &mut PartialRow, bytes: &[u8]) -> usize {
        let Some(sink) = partial.sink.take() else {
            return 0;
        };
        let used = usize::try_from(sink.remaining()).map_or(bytes.len(), |left| left.min(bytes.len()));
        let sink = match sink {
            ColumnSink::Spill { mut writer, remaining } => {
                let remaining = remaining - used as u64;
                match writer.write(&bytes[..used]) {
                    Ok(()) => ColumnSink::Spill { writer, remaining },
                    Err(err) => {
                        self.spill_failed(err);
                        ColumnSink::Discard { remaining }
                    }
                }
            }
            ColumnSink::Discard { remaining } => ColumnSink::Discard {
                remaining: remaining - used as u64,
            },
        };
        if sink.remaining() > 0 {
            partial.sink = Some(sink);
            return used;
        }

        let value = match sink {
            ColumnSink::Spill { writer, .. } => match writer.finish() {
                Ok(column) => Value::Spilled(column),
                Err(err) => {
                    self.spill_failed(err);
                    Value::Null
                }
            },
            ColumnSink::Discard { .. } => Value::Null,
        };
        self.current.push(value);
        partial.column += 1;
        used
    }

    fn finish_partial(&mut self, mut partial: PartialRow) -> Result<ReadOutcome> {
        match partial.mode {
            PieceMode::Whole => return self.feed_row(&partial.buf),
            PieceMode::Skip => {
                self.rows += 1;
                return Ok(ReadOutcome::Skipped);
            }
            PieceMode::Row => {}
        }
        // trailing NULLs of a binary row take no bytes
        self.decode_buffered(&mut partial)?;
        if partial.sink.is_some() || partial.column < self.columns.len() {
            return Err(malformed("row (payload ended inside a value)", &partial.buf));
        }
        if !partial.buf.is_empty() {
            return Err(malformed("row (more values than columns)", &partial.buf));
        }
        self.rows += 1;
        if let Some(err) = self.decoder.take_error() {
            self.defer(err);
        }
        Ok(ReadOutcome::Row)
    }

    fn feed_row(&mut self, payload: &[u8]) -> Result<ReadOutcome> {
        match payload.first() {
            Some(0xFF) => return Err(server_error(payload)),
            Some(0xFE) if self.is_terminator(payload) => {
                let state = if self.options.deprecate_eof {
                    ResultState::from_ok(need(
                        PacketReader::new(payload).parse_ok_packet(),
                        "result terminator",
                        payload,
                    )?)
                } else {
                    ResultState::from_eof(need(
                        PacketReader::new(payload).parse_eof_packet(),
                        "result terminator",
                        payload,
                    )?)
                };
                tracing::trace!(rows = self.rows, status = state.status_flags, "result terminator");
                return Ok(ReadOutcome::Terminator(state));
            }
            _ => {}
        }

        self.rows += 1;
        if self.skipping {
            return Ok(ReadOutcome::Skipped);
        }
        match self.format {
            RowFormat::Text => self.decode_text_row(payload)?,
            RowFormat::Binary => self.decode_binary_row(payload)?,
        }
        if let Some(err) = self.decoder.take_error() {
            self.defer(err);
        }
        Ok(ReadOutcome::Row)
    }

    /// OK/EOF terminators start with 0xFE; a row can only start with 0xFE
    /// when its first value needs an 8-byte length, which makes the
    /// payload at least a full frame.
    fn is_terminator(&self, payload: &[u8]) -> bool {
        if self.options.deprecate_eof {
            payload.len() < MAX_PACKET_SIZE
        } else {
            payload.len() < 9
        }
    }

    fn defer(&mut self, err: Error) {
        if self.deferred.is_none() {
            self.deferred = Some(err);
        }
    }

    fn decode_text_row(&mut self, payload: &[u8]) -> Result<()> {
        self.current.clear();
        let mut r = PacketReader::new(payload);
        for i in 0..self.columns.len() {
            let len = match need(r.read_lenenc(), "text row value", payload)? {
                LenEnc::Null => {
                    self.current.push(Value::Null);
                    continue;
                }
                LenEnc::Value(len) => len,
            };
            let bytes = need(
                usize::try_from(len).ok().and_then(|len| r.read_bytes(len)),
                "text row value",
                payload,
            )?;
            let value = if self.should_spill(len) {
                self.spill(bytes)
            } else {
                self.decoder.text(&self.columns[i], bytes)
            };
            self.current.push(value);
        }
        if !r.is_empty() {
            return Err(malformed("text row (more values than columns)", payload));
        }
        Ok(())
    }

    fn decode_binary_row(&mut self, payload: &[u8]) -> Result<()> {
        self.current.clear();
        let mut r = PacketReader::new(payload);
        if r.read_u8() != Some(0x00) {
            return Err(malformed("binary row header", payload));
        }
        let bitmap = need(
            r.read_bytes(binary_null_bitmap_len(self.columns.len())),
            "binary row null bitmap",
            payload,
        )?;
        for i in 0..self.columns.len() {
            if binary_row_is_null(bitmap, i) {
                self.current.push(Value::Null);
                continue;
            }
            let col = &self.columns[i];
            let value = if col.column_type.is_length_encoded_in_binary() {
                let len = need(r.read_lenenc_int(), "binary row value", payload)?;
                let bytes = need(
                    usize::try_from(len).ok().and_then(|len| r.read_bytes(len)),
                    "binary row value",
                    payload,
                )?;
                if self.should_spill(len) {
                    self.spill(bytes)
                } else {
                    self.decoder.binary_bytes(col, bytes)
                }
            } else {
                self.decoder.binary_fixed(col, &mut r, payload)?
            };
            self.current.push(value);
        }
        if !r.is_empty() {
            return Err(malformed("binary row (more values than columns)", payload));
        }
        Ok(())
    }

    fn should_spill(&self, len: u64) -> bool {
        self.options.spill_threshold.is_some_and(|limit| len > limit)
    }

    /// Stream one column to a temp file. Failures null the value and are
    /// reported once the result ends.
    fn spill(&mut self, bytes: &[u8]) -> Value {
        let result = SpillWriter::create(self.options.temp_files.as_ref(), bytes.len() as u64)
            .and_then(|mut writer| {
                for piece in bytes.chunks(MAX_PACKET_SIZE) {
                    writer.write(piece)?;
                }
                writer.finish()
            });
        match result {
            Ok(column) => Value::Spilled(column),
            Err(err) => {
                self.spill_failed(err);
                Value::Null
            }
        }
    }

    fn spill_failed(&mut self, err: Error) {
        tracing::warn!(error = %err, "column spill failed");
        self.defer(err);
    }
}
