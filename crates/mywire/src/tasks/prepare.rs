//! Prepared statements: `COM_STMT_PREPARE` and `COM_STMT_EXECUTE`.

use super::command::{CancelToken, CursorFetch, Progress, ResponseReader};
use crate::long_data::{ChunkPump, ChunkRead, ChunkSource, FileSource, PumpState};
use crate::protocol::capabilities::CLIENT_DEPRECATE_EOF;
use crate::protocol::prepared::{
    ExecuteParam, PreparedStatement, StmtPrepareOk, cursor_type, execute_payload, prepare_payload,
    reset_payload,
};
use crate::protocol::{PacketType, malformed, server_error};
use crate::result_set::{
    ChannelSink, CollectSink, ColumnBlock, QueryResult, ResultEvent, ResultSink, RowFormat,
};
use crate::scheduler::{Piece, Responder, Step, Task, TaskContext, TaskEvent};
use crate::types::{ColumnDef, FieldType};
use futures_channel::{mpsc, oneshot};
use mywire_core::{Error, Result, Value};
use std::collections::VecDeque;
use std::sync::Arc;

fn no_columns() -> Arc<[ColumnDef]> {
    Arc::from(Vec::new())
}

/// Prepare one statement and read its parameter and column metadata.
#[derive(Debug)]
pub struct PrepareTask {
    sql: String,
    responder: Responder<PreparedStatement>,
    header: Option<StmtPrepareOk>,
    params: Option<Arc<[ColumnDef]>>,
    block: Option<ColumnBlock>,
}

impl PrepareTask {
    pub fn new(sql: impl Into<String>) -> (Self, oneshot::Receiver<Result<PreparedStatement>>) {
        let (responder, rx) = Responder::new();
        let task = Self {
            sql: sql.into(),
            responder,
            header: None,
            params: None,
            block: None,
        };
        (task, rx)
    }

    fn read_columns(&mut self, header: StmtPrepareOk, deprecate_eof: bool) -> Step {
        if header.num_columns == 0 {
            return self.complete(header, no_columns());
        }
        self.block = Some(ColumnBlock::new(usize::from(header.num_columns), deprecate_eof));
        Step::Continue
    }

    fn complete(&mut self, header: StmtPrepareOk, columns: Arc<[ColumnDef]>) -> Step {
        self.block = None;
        let statement = PreparedStatement {
            statement_id: header.statement_id,
            sql: std::mem::take(&mut self.sql),
            params: self.params.take().unwrap_or_else(no_columns),
            columns,
            warnings: header.warnings,
        };
        tracing::debug!(
            statement_id = statement.statement_id,
            params = statement.param_count(),
            columns = statement.column_count(),
            "statement prepared"
        );
        self.responder.send(Ok(statement));
        Step::Done
    }
}

impl Task for PrepareTask {
    fn name(&self) -> &'static str {
        "prepare"
    }

    fn start(&mut self, ctx: &mut TaskContext<'_>) -> Result<Step> {
        ctx.send_command(&prepare_payload(&self.sql));
        Ok(Step::Continue)
    }

    fn decode(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Step> {
        let deprecate_eof = ctx.session().has_capability(CLIENT_DEPRECATE_EOF);
        let Some(header) = self.header else {
            if PacketType::of(payload) == PacketType::Error {
                return Err(server_error(payload));
            }
            let header = StmtPrepareOk::parse(payload)?;
            self.header = Some(header);
            if header.num_params == 0 {
                self.params = Some(no_columns());
                return Ok(self.read_columns(header, deprecate_eof));
            }
            self.block = Some(ColumnBlock::new(usize::from(header.num_params), deprecate_eof));
            return Ok(Step::Continue);
        };

        let Some(block) = self.block.as_mut() else {
            return Err(malformed("payload after statement metadata", payload));
        };
        let Some(defs) = block.feed(payload)? else {
            return Ok(Step::Continue);
        };
        if self.params.is_none() {
            self.params = Some(defs);
            return Ok(self.read_columns(header, deprecate_eof));
        }
        Ok(self.complete(header, defs))
    }

    fn on_error(&mut self, error: Error) {
        self.responder.send(Err(error));
    }
}

/// One execute parameter.
#[derive(Debug)]
pub enum Param {
    Value(Value),
    /// Streamed with `COM_STMT_SEND_LONG_DATA` before the execute
    Long {
        source: Box<dyn ChunkSource>,
        field_type: FieldType,
    },
}

impl Param {
    /// Binary long data from any source.
    pub fn long(source: impl ChunkSource + 'static) -> Self {
        Param::Long {
            source: Box::new(source),
            field_type: FieldType::Blob,
        }
    }
}

impl From<Value> for Param {
    /// Spilled columns are sent back as long data straight from their file.
    fn from(value: Value) -> Self {
        match value {
            Value::Spilled(column) => Param::long(FileSource::from_spilled(column)),
            value => Param::Value(value),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Value(Value),
    Long(FieldType),
}

#[derive(Debug)]
enum ExecState {
    /// Long data going out; the execute follows
    Streaming,
    /// `COM_STMT_RESET` sent after a failed long-data parameter
    AwaitReset(Option<Error>),
    Response,
}

/// Execute a prepared statement, streaming long parameters first.
#[derive(Debug)]
pub struct ExecuteTask {
    statement_id: u32,
    param_count: usize,
    column_count: usize,
    params: Vec<Param>,
    long: VecDeque<(u16, Box<dyn ChunkSource>)>,
    pump: Option<ChunkPump>,
    execute: Vec<u8>,
    use_cursor: bool,
    state: ExecState,
    response: ResponseReader,
}

impl ExecuteTask {
    pub fn new(statement: &PreparedStatement, params: Vec<Param>, sink: Box<dyn ResultSink>) -> Self {
        Self {
            statement_id: statement.statement_id,
            param_count: statement.param_count(),
            column_count: statement.column_count(),
            params,
            long: VecDeque::new(),
            pump: None,
            execute: Vec::new(),
            use_cursor: false,
            state: ExecState::Streaming,
            response: ResponseReader::new(RowFormat::Binary, sink),
        }
    }

    /// Execute whose results arrive as [`ResultEvent`]s.
    pub fn stream(
        statement: &PreparedStatement,
        params: Vec<Param>,
    ) -> (Self, mpsc::UnboundedReceiver<ResultEvent>) {
        let (sink, rx) = ChannelSink::new();
        (Self::new(statement, params, Box::new(sink)), rx)
    }

    /// Execute whose results are collected in memory.
    pub fn collect(
        statement: &PreparedStatement,
        params: Vec<Param>,
    ) -> (Self, oneshot::Receiver<Result<Vec<QueryResult>>>) {
        let (sink, rx) = CollectSink::new();
        (Self::new(statement, params, Box::new(sink)), rx)
    }

    /// Open a read-only cursor and page through it with `COM_STMT_FETCH`.
    pub fn cursor(mut self) -> Self {
        self.use_cursor = true;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.response.set_cancel(token);
        self
    }

    /// Queue long sources and encode the execute payload before anything
    /// is sent.
    fn prepare_params(&mut self, ctx: &TaskContext<'_>) -> Result<()> {
        let mut slots = Vec::with_capacity(self.params.len());
        for (index, param) in std::mem::take(&mut self.params).into_iter().enumerate() {
            match param {
                Param::Value(value) => slots.push(Slot::Value(value)),
                Param::Long { source, field_type } => {
                    let index = u16::try_from(index)
                        .map_err(|_| Error::Custom(format!("parameter index {index} out of range")))?;
                    self.long.push_back((index, source));
                    slots.push(Slot::Long(field_type));
                }
            }
        }

        let wire: Vec<ExecuteParam<'_>> = slots
            .iter()
            .map(|slot| match slot {
                Slot::Value(value) => ExecuteParam::Value(value),
                Slot::Long(field_type) => ExecuteParam::LongData(*field_type),
            })
            .collect();
        let flags = if self.use_cursor && self.column_count > 0 {
            self.response.set_cursor(CursorFetch {
                statement_id: self.statement_id,
                rows: ctx.config().fetch_size.max(1),
            });
            cursor_type::READ_ONLY
        } else {
            cursor_type::NO_CURSOR
        };
        self.execute = execute_payload(self.statement_id, flags, &wire)?;
        Ok(())
    }

    /// Run pumps until one waits on a blocking read or all are done, then
    /// send the execute.
    fn advance(&mut self, mut resumed: Option<ChunkRead>, ctx: &mut TaskContext<'_>) -> Result<Step> {
        loop {
            if self.pump.is_none() {
                let Some((index, source)) = self.long.pop_front() else {
                    return Ok(self.send_execute(ctx));
                };
                self.pump = Some(ChunkPump::long_data(self.statement_id, index, source, ctx.config()));
            }
            let Some(pump) = self.pump.as_mut() else {
                continue;
            };
            let result = match resumed.take() {
                Some(read) => pump.resume(read, ctx),
                None => pump.run(ctx),
            };
            match result {
                Ok(PumpState::Waiting) => return Ok(Step::Continue),
                Ok(PumpState::Finished) => {
                    tracing::trace!(
                        statement_id = self.statement_id,
                        bytes = pump.bytes_sent(),
                        frames = pump.frames_sent(),
                        "long data sent"
                    );
                    self.pump = None;
                }
                Err(err) => return Ok(self.abort(err, ctx)),
            }
        }
    }

    fn send_execute(&mut self, ctx: &mut TaskContext<'_>) -> Step {
        tracing::debug!(task = ctx.task_id(), statement_id = self.statement_id, "execute");
        ctx.send_command(&std::mem::take(&mut self.execute));
        self.state = ExecState::Response;
        Step::Continue
    }

    /// Discard the long data the server holds so far and fail once it
    /// confirms.
    fn abort(&mut self, err: Error, ctx: &mut TaskContext<'_>) -> Step {
        tracing::warn!(statement_id = self.statement_id, error = %err, "long data failed, resetting statement");
        self.pump = None;
        self.long.clear();
        ctx.send_command(&reset_payload(self.statement_id));
        self.state = ExecState::AwaitReset(Some(err));
        Step::Continue
    }
}

impl Task for ExecuteTask {
    fn name(&self) -> &'static str {
        "execute"
    }

    fn start(&mut self, ctx: &mut TaskContext<'_>) -> Result<Step> {
        if self.params.len() != self.param_count {
            return Err(Error::Custom(format!(
                "statement {} expects {} parameters, got {}",
                self.statement_id,
                self.param_count,
                self.params.len()
            )));
        }
        self.prepare_params(ctx)?;
        self.advance(None, ctx)
    }

    fn decode(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Step> {
        match &mut self.state {
            ExecState::Streaming => Err(malformed("reply during long data", payload)),
            ExecState::AwaitReset(pending) => {
                let err = pending
                    .take()
                    .unwrap_or_else(|| Error::protocol("statement reset without a cause"));
                match PacketType::of(payload) {
                    PacketType::Ok => Err(err),
                    PacketType::Error => {
                        tracing::debug!(reset_error = %server_error(payload), "statement reset refused");
                        Err(err)
                    }
                    _ => Err(malformed("reply to COM_STMT_RESET", payload)),
                }
            }
            ExecState::Response => match self.response.decode(payload, ctx)? {
                Progress::Continue => Ok(Step::Continue),
                Progress::Complete => self.response.finish(),
            },
        }
    }

    fn piece_threshold(&self) -> Option<usize> {
        match self.state {
            ExecState::Response => self.response.piece_threshold(),
            ExecState::Streaming | ExecState::AwaitReset(_) => None,
        }
    }

    fn decode_piece(&mut self, piece: Piece<'_>, ctx: &mut TaskContext<'_>) -> Result<Step> {
        match self.response.decode_piece(piece, ctx)? {
            Progress::Continue => Ok(Step::Continue),
            Progress::Complete => self.response.finish(),
        }
    }

    fn on_event(&mut self, event: TaskEvent, ctx: &mut TaskContext<'_>) -> Result<Step> {
        match event {
            TaskEvent::Chunk(read) if matches!(self.state, ExecState::Streaming) => {
                self.advance(Some(read), ctx)
            }
            event => {
                self.response.on_event(event, ctx)?;
                Ok(Step::Continue)
            }
        }
    }

    fn on_error(&mut self, error: Error) {
        self.response.fail(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MySqlConfig;
    use crate::long_data::BytesSource;
    use crate::protocol::Command;
    use crate::protocol::capabilities::DEFAULT_CLIENT_FLAGS;
    use crate::protocol::prepared::LONG_DATA_HEADER_LEN;
    use crate::tasks::command::tests::{frame, ok, ready, sent, terminator};
    use crate::types::tests::column_payload;
    use mywire_core::error::DataErrorKind;

    fn prepare_ok(id: u32, columns: u16, params: u16) -> Vec<u8> {
        let mut p = vec![0x00];
        p.extend_from_slice(&id.to_le_bytes());
        p.extend_from_slice(&columns.to_le_bytes());
        p.extend_from_slice(&params.to_le_bytes());
        p.extend_from_slice(&[0x00, 0x00, 0x00]);
        p
    }

    fn statement(id: u32, params: usize, columns: usize) -> PreparedStatement {
        let def = |name: &str| {
            ColumnDef::parse(&column_payload(name, FieldType::LongLong, 0, 63)).unwrap()
        };
        PreparedStatement {
            statement_id: id,
            sql: String::new(),
            params: (0..params).map(|_| def("?")).collect(),
            columns: (0..columns).map(|i| def(&format!("c{i}"))).collect(),
            warnings: 0,
        }
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<ResultEvent>) -> Vec<ResultEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_prepare_reads_metadata() {
        let mut s = ready(MySqlConfig::default(), DEFAULT_CLIENT_FLAGS);
        let (task, mut rx) = PrepareTask::new("SELECT a FROM t WHERE b = ? AND c = ?");
        s.submit(Box::new(task));
        let out = sent(&mut s);
        assert_eq!(out[0].1[0], Command::StmtPrepare as u8);

        s.on_bytes_received(&frame(1, &prepare_ok(7, 1, 2)));
        s.on_bytes_received(&frame(2, &column_payload("?", FieldType::LongLong, 0, 63)));
        s.on_bytes_received(&frame(3, &column_payload("?", FieldType::VarString, 0, 45)));
        s.on_bytes_received(&frame(4, &column_payload("a", FieldType::Long, 0, 63)));

        let stmt = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(stmt.statement_id, 7);
        assert_eq!(stmt.param_count(), 2);
        assert_eq!(stmt.column_count(), 1);
        assert!(s.is_idle());
    }

    #[test]
    fn test_prepare_with_eof_blocks() {
        let caps = DEFAULT_CLIENT_FLAGS & !CLIENT_DEPRECATE_EOF;
        let mut s = ready(MySqlConfig::default(), caps);
        let (task, mut rx) = PrepareTask::new("SELECT ?, ?");
        s.submit(Box::new(task));
        sent(&mut s);

        let eof = [0xFE, 0x00, 0x00, 0x02, 0x00];
        s.on_bytes_received(&frame(1, &prepare_ok(3, 2, 1)));
        s.on_bytes_received(&frame(2, &column_payload("?", FieldType::LongLong, 0, 63)));
        s.on_bytes_received(&frame(3, &eof));
        s.on_bytes_received(&frame(4, &column_payload("x", FieldType::LongLong, 0, 63)));
        s.on_bytes_received(&frame(5, &column_payload("y", FieldType::LongLong, 0, 63)));
        assert!(rx.try_recv().unwrap().is_none());
        s.on_bytes_received(&frame(6, &eof));

        let stmt = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(stmt.param_count(), 1);
        assert_eq!(stmt.column_count(), 2);
    }

    #[test]
    fn test_prepare_without_metadata() {
        let mut s = ready(MySqlConfig::default(), DEFAULT_CLIENT_FLAGS);
        let (task, mut rx) = PrepareTask::new("DO 1");
        s.submit(Box::new(task));
        sent(&mut s);
        s.on_bytes_received(&frame(1, &prepare_ok(1, 0, 0)));
        let stmt = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(stmt.param_count(), 0);
        assert!(s.is_idle());
    }

    #[test]
    fn test_prepare_server_error() {
        let mut s = ready(MySqlConfig::default(), DEFAULT_CLIENT_FLAGS);
        let (task, mut rx) = PrepareTask::new("SELEC");
        s.submit(Box::new(task));
        sent(&mut s);
        let mut err = vec![0xFF, 0x28, 0x04, b'#'];
        err.extend_from_slice(b"42000bad");
        s.on_bytes_received(&frame(1, &err));
        let err = rx.try_recv().unwrap().unwrap().unwrap_err();
        assert_eq!(err.code(), Some(1064));
        assert!(s.poisoned().is_none());
    }

    #[test]
    fn test_param_count_mismatch() {
        let mut s = ready(MySqlConfig::default(), DEFAULT_CLIENT_FLAGS);
        let (task, mut rx) = ExecuteTask::stream(&statement(4, 2, 0), vec![Param::Value(Value::Int(1))]);
        s.submit(Box::new(task));
        assert!(sent(&mut s).is_empty());
        assert!(matches!(events(&mut rx).as_slice(), [ResultEvent::Error(Error::Custom(_))]));
        assert!(s.is_idle());
    }

    #[test]
    fn test_long_data_precedes_execute() {
        let config = MySqlConfig::new().long_data_chunk_size(1024);
        let mut s = ready(config, DEFAULT_CLIENT_FLAGS);
        let params = vec![
            Param::Value(Value::Int(5)),
            Param::long(BytesSource::new(vec![9u8; 2048])),
        ];
        let (task, mut rx) = ExecuteTask::stream(&statement(11, 2, 0), params);
        s.submit(Box::new(task));

        let out = sent(&mut s);
        assert_eq!(out.len(), 4);
        for (seq, payload) in &out[..3] {
            assert_eq!(*seq, 0);
            assert_eq!(payload[0], Command::StmtSendLongData as u8);
            assert_eq!(&payload[5..7], &1u16.to_le_bytes());
        }
        assert_eq!(out[2].1.len(), LONG_DATA_HEADER_LEN);
        assert_eq!(out[3].0, 0);
        assert_eq!(out[3].1[0], Command::StmtExecute as u8);

        s.on_bytes_received(&frame(1, &ok(0x0002, 1)));
        let ev = events(&mut rx);
        assert!(matches!(&ev[0], ResultEvent::Terminator(st) if st.affected_rows == 1));
        assert!(matches!(ev[1], ResultEvent::Done));
    }

    #[test]
    fn test_oversized_long_data_resets_statement() {
        let config = MySqlConfig::new()
            .long_data_chunk_size(1024)
            .max_allowed_packet(1500);
        let mut s = ready(config, DEFAULT_CLIENT_FLAGS);
        let params = vec![Param::long(BytesSource::new(vec![1u8; 4096]))];
        let (task, mut rx) = ExecuteTask::stream(&statement(2, 1, 0), params);
        s.submit(Box::new(task));

        let out = sent(&mut s);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1[0], Command::StmtSendLongData as u8);
        assert_eq!(out[1], (0, reset_payload(2)));

        s.on_bytes_received(&frame(1, &ok(0x0002, 0)));
        let ev = events(&mut rx);
        assert!(matches!(
            ev.as_slice(),
            [ResultEvent::Error(e)] if e.data_kind() == Some(DataErrorKind::PacketTooLarge)
        ));
        assert!(s.poisoned().is_none());
        assert!(s.is_idle());
    }

    #[test]
    fn test_binary_result() {
        let mut s = ready(MySqlConfig::default(), DEFAULT_CLIENT_FLAGS);
        let (task, mut rx) = ExecuteTask::stream(&statement(8, 0, 1), Vec::new());
        s.submit(Box::new(task));
        let out = sent(&mut s);
        assert_eq!(out[0].1[0], Command::StmtExecute as u8);

        s.on_bytes_received(&frame(1, &[0x01]));
        s.on_bytes_received(&frame(2, &column_payload("n", FieldType::Long, 0, 63)));
        s.on_bytes_received(&frame(3, &[0x00, 0x00, 42, 0, 0, 0]));
        s.on_bytes_received(&frame(4, &terminator(0x0002)));

        let ev = events(&mut rx);
        assert_eq!(ev.len(), 4);
        assert!(matches!(&ev[1], ResultEvent::Row(row) if row.get(0) == Some(&Value::Int(42))));
        assert!(matches!(ev[3], ResultEvent::Done));
    }

    #[test]
    fn test_cursor_flag_only_with_columns() {
        let mut s = ready(MySqlConfig::default(), DEFAULT_CLIENT_FLAGS);
        let (task, _rx) = ExecuteTask::stream(&statement(8, 0, 0), Vec::new());
        s.submit(Box::new(task.cursor()));
        let out = sent(&mut s);
        assert_eq!(out[0].1[5], cursor_type::NO_CURSOR);

        let mut s = ready(MySqlConfig::default(), DEFAULT_CLIENT_FLAGS);
        let (task, _rx) = ExecuteTask::stream(&statement(8, 0, 1), Vec::new());
        s.submit(Box::new(task.cursor()));
        let out = sent(&mut s);
        assert_eq!(out[0].1[5], cursor_type::READ_ONLY);
    }
}
