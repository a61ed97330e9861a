//! Text-protocol commands and the shared response state machine.
//!
//! [`ResponseReader`] classifies the first frame after a command and walks
//! OK packets, result sets, LOCAL INFILE requests, multi-result chains and
//! cursor fetches until the command's last terminator. Query and execute
//! tasks embed one.

use crate::infile::InfileTransfer;
use crate::long_data::PumpState;
use crate::protocol::capabilities::{CLIENT_DEPRECATE_EOF, CLIENT_OPTIONAL_RESULTSET_METADATA};
use crate::protocol::prepared::{close_payload, fetch_payload, reset_payload};
use crate::protocol::{Command, PacketReader, PacketType, malformed, server_error};
use crate::result_set::{
    ChannelSink, CollectSink, QueryResult, ReadOutcome, ReaderOptions, ResultEvent, ResultSetReader,
    ResultSink, ResultState, RowFormat,
};
use crate::scheduler::{Piece, Responder, Step, Task, TaskContext, TaskEvent};
use futures_channel::{mpsc, oneshot};
use mywire_core::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation, observed between rows.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Open cursor to page through with `COM_STMT_FETCH`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CursorFetch {
    pub(crate) statement_id: u32,
    pub(crate) rows: u32,
}

enum Phase {
    Classify,
    Rows(Box<ResultSetReader>),
    Infile(InfileTransfer),
}

/// Progress of one command's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Continue,
    /// The last terminator has been read
    Complete,
}

/// Response side of query and execute tasks.
pub(crate) struct ResponseReader {
    format: RowFormat,
    phase: Phase,
    sink: Box<dyn ResultSink>,
    cancel: Option<CancelToken>,
    cancelled: bool,
    cursor: Option<CursorFetch>,
    deferred: Option<Error>,
}

impl fmt::Debug for ResponseReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match &self.phase {
            Phase::Classify => "classify",
            Phase::Rows(_) => "rows",
            Phase::Infile(_) => "infile",
        };
        f.debug_struct("ResponseReader")
            .field("format", &self.format)
            .field("phase", &phase)
            .field("cancelled", &self.cancelled)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl ResponseReader {
    pub(crate) fn new(format: RowFormat, sink: Box<dyn ResultSink>) -> Self {
        Self {
            format,
            phase: Phase::Classify,
            sink,
            cancel: None,
            cancelled: false,
            cursor: None,
            deferred: None,
        }
    }

    pub(crate) fn set_cancel(&mut self, token: CancelToken) {
        self.cancel = Some(token);
    }

    pub(crate) fn set_cursor(&mut self, cursor: CursorFetch) {
        self.cursor = Some(cursor);
    }

    /// Expect the response to a freshly sent command.
    pub(crate) fn restart(&mut self) {
        self.phase = Phase::Classify;
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub(crate) fn decode(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Progress> {
        if let Phase::Infile(transfer) = &mut self.phase {
            // This payload is the server's verdict on the uploaded file.
            if let Some(err) = transfer.take_error() {
                self.defer(err);
            }
            self.phase = Phase::Classify;
        }
        match self.phase {
            Phase::Rows(_) => self.rows(payload, ctx),
            Phase::Classify | Phase::Infile(_) => self.classify(payload, ctx),
        }
    }

    pub(crate) fn on_event(&mut self, event: TaskEvent, ctx: &mut TaskContext<'_>) -> Result<Progress> {
        match (&mut self.phase, event) {
            (Phase::Infile(transfer), TaskEvent::Chunk(read)) => {
                transfer.resume(read, ctx)?;
                Ok(Progress::Continue)
            }
            (_, event) => Err(Error::protocol(format!("unexpected {event:?} while reading a response"))),
        }
    }

    /// End of the whole command: report success, cancellation or the
    /// first deferred data error.
    pub(crate) fn finish(&mut self) -> Result<Step> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        self.sink.done();
        Ok(Step::Done)
    }

    pub(crate) fn fail(&mut self, error: Error) {
        self.sink.error(error);
    }

    fn defer(&mut self, err: Error) {
        if self.deferred.is_none() {
            self.deferred = Some(err);
        }
    }

    fn check_cancel(&mut self) -> bool {
        if !self.cancelled && self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            tracing::debug!("cancellation observed, draining response");
            self.cancelled = true;
        }
        self.cancelled
    }

    fn classify(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Progress> {
        // With optional metadata a short 0x00-headed payload is a column
        // count; an OK packet is at least 7 bytes.
        let optional_metadata = ctx.session().has_capability(CLIENT_OPTIONAL_RESULTSET_METADATA);
        match PacketType::of(payload) {
            PacketType::Ok if !optional_metadata || payload.len() >= 7 => {
                let ok = PacketReader::new(payload)
                    .parse_ok_packet()
                    .ok_or_else(|| malformed("OK packet", payload))?;
                let state = ResultState::from_ok(ok);
                self.terminator(state, ctx)
            }
            PacketType::Error => Err(server_error(payload)),
            PacketType::LocalInfile => {
                let (transfer, state) = InfileTransfer::start(payload, ctx)?;
                tracing::debug!(file = %transfer.file_name(), waiting = matches!(state, PumpState::Waiting), "streaming local infile");
                self.phase = Phase::Infile(transfer);
                Ok(Progress::Continue)
            }
            PacketType::Ok | PacketType::Eof | PacketType::Data => {
                let options = ReaderOptions::new(
                    ctx.config(),
                    ctx.session().has_capability(CLIENT_DEPRECATE_EOF),
                    ctx.temp_files(),
                );
                let mut reader = ResultSetReader::from_column_count(payload, self.format, options)?;
                if self.check_cancel() {
                    reader.skip_remaining();
                }
                self.phase = Phase::Rows(Box::new(reader));
                Ok(Progress::Continue)
            }
        }
    }

    /// Row payloads longer than this are handed over in pieces.
    pub(crate) fn piece_threshold(&self) -> Option<usize> {
        match &self.phase {
            Phase::Rows(reader) => reader.piece_threshold(),
            Phase::Classify | Phase::Infile(_) => None,
        }
    }

    pub(crate) fn decode_piece(&mut self, piece: Piece<'_>, ctx: &mut TaskContext<'_>) -> Result<Progress> {
        let cancelled = self.check_cancel();
        let Phase::Rows(reader) = &mut self.phase else {
            return Err(Error::protocol("partial payload outside a result set"));
        };
        if cancelled {
            reader.skip_remaining();
        }
        match reader.feed_piece(piece)? {
            Some(outcome) => self.outcome(outcome, ctx),
            None => Ok(Progress::Continue),
        }
    }

    fn rows(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Progress> {
        // A cancelled reader must not decode or spill another row.
        let cancelled = self.check_cancel();
        let Phase::Rows(reader) = &mut self.phase else {
            return Err(Error::protocol("row outside a result set"));
        };
        if cancelled {
            reader.skip_remaining();
        }
        let outcome = reader.feed(payload)?;
        self.outcome(outcome, ctx)
    }

    fn outcome(&mut self, outcome: ReadOutcome, ctx: &mut TaskContext<'_>) -> Result<Progress> {
        let Phase::Rows(reader) = &mut self.phase else {
            return Err(Error::protocol("row outside a result set"));
        };
        match outcome {
            ReadOutcome::Pending | ReadOutcome::Skipped => Ok(Progress::Continue),
            ReadOutcome::Metadata(columns) => {
                if !self.cancelled {
                    self.sink.metadata(&columns);
                }
                // Without DEPRECATE_EOF the cursor is announced on the EOF
                // that closes the metadata, and no rows follow until fetched.
                let opened = reader.metadata_status().is_some_and(ResultState::cursor_exists);
                if opened {
                    return Ok(self.fetch_or_finish(ctx));
                }
                Ok(Progress::Continue)
            }
            ReadOutcome::Row => {
                if !self.check_cancel() {
                    self.sink.row(reader_row(&self.phase)?);
                }
                Ok(Progress::Continue)
            }
            ReadOutcome::Terminator(state) => {
                if let Some(err) = reader.take_error() {
                    self.defer(err);
                }
                if state.more_fetch() && self.cursor.is_some() {
                    ctx.session_mut().status_flags = state.status_flags;
                    return Ok(self.fetch_or_finish(ctx));
                }
                self.terminator(state, ctx)
            }
        }
    }

    /// Ask for the next cursor page; after cancellation the command ends
    /// here instead.
    fn fetch_or_finish(&mut self, ctx: &mut TaskContext<'_>) -> Progress {
        let Some(cursor) = self.cursor else {
            return Progress::Continue;
        };
        if self.check_cancel() {
            return Progress::Complete;
        }
        tracing::trace!(statement_id = cursor.statement_id, rows = cursor.rows, "cursor fetch");
        ctx.send_command(&fetch_payload(cursor.statement_id, cursor.rows));
        Progress::Continue
    }

    fn terminator(&mut self, state: ResultState, ctx: &mut TaskContext<'_>) -> Result<Progress> {
        ctx.session_mut().status_flags = state.status_flags;
        if !self.cancelled {
            self.sink.terminator(&state);
        }
        if state.more_results() {
            self.phase = Phase::Classify;
            return Ok(Progress::Continue);
        }
        Ok(Progress::Complete)
    }
}

fn reader_row(phase: &Phase) -> Result<&crate::result_set::CurrentRow> {
    match phase {
        Phase::Rows(reader) => Ok(reader.current_row()),
        _ => Err(Error::protocol("row outside a result set")),
    }
}

fn command_payload(command: Command, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.push(command as u8);
    payload.extend_from_slice(body);
    payload
}

/// `COM_QUERY` for one statement, or a batch of statement groups sent one
/// after another.
#[derive(Debug)]
pub struct QueryTask {
    pending: VecDeque<String>,
    response: ResponseReader,
}

impl QueryTask {
    pub fn new(sql: impl Into<String>, sink: Box<dyn ResultSink>) -> Self {
        Self::batch(vec![sql.into()], sink)
    }

    /// Each group is its own `COM_QUERY`; the next is sent once the
    /// previous one's results are complete.
    pub fn batch(groups: Vec<String>, sink: Box<dyn ResultSink>) -> Self {
        Self {
            pending: groups.into(),
            response: ResponseReader::new(RowFormat::Text, sink),
        }
    }

    /// Query whose results arrive as [`ResultEvent`]s.
    pub fn stream(sql: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ResultEvent>) {
        let (sink, rx) = ChannelSink::new();
        (Self::new(sql, Box::new(sink)), rx)
    }

    /// Query whose results are collected in memory.
    pub fn collect(sql: impl Into<String>) -> (Self, oneshot::Receiver<Result<Vec<QueryResult>>>) {
        let (sink, rx) = CollectSink::new();
        (Self::new(sql, Box::new(sink)), rx)
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.response.set_cancel(token);
        self
    }

    fn send_next(&mut self, ctx: &mut TaskContext<'_>) -> Result<Step> {
        let Some(sql) = self.pending.pop_front() else {
            return self.response.finish();
        };
        tracing::debug!(task = ctx.task_id(), len = sql.len(), "query");
        ctx.send_command(&command_payload(Command::Query, sql.as_bytes()));
        self.response.restart();
        Ok(Step::Continue)
    }
}

impl Task for QueryTask {
    fn name(&self) -> &'static str {
        "query"
    }

    fn start(&mut self, ctx: &mut TaskContext<'_>) -> Result<Step> {
        if self.pending.is_empty() {
            return Err(Error::Custom("empty query batch".to_string()));
        }
        self.send_next(ctx)
    }

    fn decode(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Step> {
        match self.response.decode(payload, ctx)? {
            Progress::Continue => Ok(Step::Continue),
            Progress::Complete if self.response.is_cancelled() => self.response.finish(),
            Progress::Complete => self.send_next(ctx),
        }
    }

    fn piece_threshold(&self) -> Option<usize> {
        self.response.piece_threshold()
    }

    fn decode_piece(&mut self, piece: Piece<'_>, ctx: &mut TaskContext<'_>) -> Result<Step> {
        match self.response.decode_piece(piece, ctx)? {
            Progress::Continue => Ok(Step::Continue),
            Progress::Complete if self.response.is_cancelled() => self.response.finish(),
            Progress::Complete => self.send_next(ctx),
        }
    }

    fn on_event(&mut self, event: TaskEvent, ctx: &mut TaskContext<'_>) -> Result<Step> {
        self.response.on_event(event, ctx)?;
        Ok(Step::Continue)
    }

    fn on_error(&mut self, error: Error) {
        self.response.fail(error);
    }
}

/// Commands answered by a single OK or ERR, or by nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimpleCommand {
    Ping,
    /// No response; the connection closes afterwards
    Quit,
    InitDb(String),
    ResetConnection,
    /// No response
    StmtClose(u32),
    StmtReset(u32),
}

impl SimpleCommand {
    fn command(&self) -> Command {
        match self {
            SimpleCommand::Ping => Command::Ping,
            SimpleCommand::Quit => Command::Quit,
            SimpleCommand::InitDb(_) => Command::InitDb,
            SimpleCommand::ResetConnection => Command::ResetConnection,
            SimpleCommand::StmtClose(_) => Command::StmtClose,
            SimpleCommand::StmtReset(_) => Command::StmtReset,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            SimpleCommand::InitDb(schema) => command_payload(Command::InitDb, schema.as_bytes()),
            SimpleCommand::StmtClose(id) => close_payload(*id),
            SimpleCommand::StmtReset(id) => reset_payload(*id),
            SimpleCommand::Ping | SimpleCommand::Quit | SimpleCommand::ResetConnection => {
                command_payload(self.command(), &[])
            }
        }
    }
}

#[derive(Debug)]
pub struct SimpleCommandTask {
    command: SimpleCommand,
    responder: Responder<ResultState>,
}

impl SimpleCommandTask {
    pub fn new(command: SimpleCommand) -> (Self, oneshot::Receiver<Result<ResultState>>) {
        let (responder, rx) = Responder::new();
        (Self { command, responder }, rx)
    }
}

impl Task for SimpleCommandTask {
    fn name(&self) -> &'static str {
        match self.command {
            SimpleCommand::Ping => "ping",
            SimpleCommand::Quit => "quit",
            SimpleCommand::InitDb(_) => "init_db",
            SimpleCommand::ResetConnection => "reset_connection",
            SimpleCommand::StmtClose(_) => "stmt_close",
            SimpleCommand::StmtReset(_) => "stmt_reset",
        }
    }

    fn start(&mut self, ctx: &mut TaskContext<'_>) -> Result<Step> {
        ctx.send_command(&self.command.payload());
        if self.command.command().expects_response() {
            return Ok(Step::Continue);
        }
        if self.command == SimpleCommand::Quit {
            ctx.close();
        }
        self.responder.send(Ok(ResultState::default()));
        Ok(Step::Done)
    }

    fn decode(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Step> {
        match PacketType::of(payload) {
            PacketType::Ok => {
                let ok = PacketReader::new(payload)
                    .parse_ok_packet()
                    .ok_or_else(|| malformed("OK packet", payload))?;
                let state = ResultState::from_ok(ok);
                ctx.session_mut().status_flags = state.status_flags;
                self.responder.send(Ok(state));
                Ok(Step::Done)
            }
            PacketType::Error => Err(server_error(payload)),
            _ => Err(malformed("reply to simple command", payload)),
        }
    }

    fn on_error(&mut self, error: Error) {
        self.responder.send(Err(error));
    }
}
