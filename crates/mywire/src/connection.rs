//! Async driver.
//!
//! [`MySqlConnection`] owns a transport and a [`Scheduler`] and moves bytes
//! between them: queued frames are written, blocking jobs run on
//! asupersync's blocking pool, TLS upgrades go through the configured
//! [`TlsUpgrade`], and whatever the server sends is fed back in. Each public
//! operation submits a task and drives the loop until that task has
//! answered.

use crate::config::MySqlConfig;
use crate::infile::InfileHandler;
use crate::protocol::prepared::PreparedStatement;
use crate::result_set::{ChannelSink, QueryResult, ResultEvent, ResultState};
use crate::scheduler::{Outbound, Scheduler, Session, Task};
use crate::spill::TempFileProvider;
use crate::tasks::{
    CancelToken, ExecuteTask, HandshakeTask, Param, PrepareTask, QueryTask, SimpleCommand,
    SimpleCommandTask,
};
use crate::tls::{TlsUpgrade, Transport, tls_error};
use asupersync::io::{AsyncReadExt, AsyncWriteExt};
use asupersync::{Cx, Outcome};
use futures_channel::mpsc::{self, TryRecvError};
use futures_channel::oneshot;
use mywire_core::{Error, Result};
use std::fmt;
use std::io;
use std::sync::Arc;

const READ_CHUNK: usize = 16 * 1024;

/// Collaborators the driver hands to the engine.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub tls: Option<Arc<dyn TlsUpgrade>>,
    pub infile: Option<Arc<dyn InfileHandler>>,
    pub temp_files: Option<Arc<dyn TempFileProvider>>,
}

/// A MySQL connection over any [`Transport`].
pub struct MySqlConnection {
    transport: Option<Box<dyn Transport>>,
    scheduler: Scheduler,
    tls: Option<Arc<dyn TlsUpgrade>>,
    read_buf: Vec<u8>,
    closed: bool,
}

impl fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("scheduler", &self.scheduler)
            .field("tls", &self.tls.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Run the handshake and authentication over `transport`.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(host = %config.host, port = config.port, user = %config.user)
    )]
    pub async fn connect(
        cx: &Cx,
        transport: Box<dyn Transport>,
        config: MySqlConfig,
        options: ConnectOptions,
    ) -> Outcome<Self, Error> {
        let mut scheduler = Scheduler::new(Arc::new(config));
        if let Some(provider) = options.temp_files {
            scheduler = scheduler.with_temp_files(provider);
        }
        if let Some(handler) = options.infile {
            scheduler = scheduler.with_infile_handler(handler);
        }
        let mut conn = Self {
            transport: Some(transport),
            scheduler,
            tls: options.tls,
            read_buf: vec![0; READ_CHUNK],
            closed: false,
        };

        let (task, rx) = HandshakeTask::new();
        match conn.run(cx, Box::new(task), rx).await {
            Outcome::Ok(session) => {
                tracing::debug!(
                    connection_id = session.connection_id,
                    server_version = %session.server_version,
                    secure = session.secure,
                    "connected"
                );
                Outcome::Ok(conn)
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub fn session(&self) -> &Session {
        self.scheduler.session()
    }

    pub fn connection_id(&self) -> u32 {
        self.session().connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.session().server_version
    }

    pub fn is_secure(&self) -> bool {
        self.session().secure
    }

    /// False once a fatal error or `close` ended the connection.
    pub fn is_usable(&self) -> bool {
        !self.closed && self.scheduler.poisoned().is_none()
    }

    /// Run a text query and collect every result.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn query(&mut self, cx: &Cx, sql: &str) -> Outcome<Vec<QueryResult>, Error> {
        let (task, rx) = QueryTask::collect(sql);
        self.run(cx, Box::new(task), rx).await
    }

    /// Run a text query and stream its events.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn query_stream(&mut self, sql: &str) -> ResultStream<'_> {
        let cancel = CancelToken::new();
        let (sink, rx) = ChannelSink::new();
        let task = QueryTask::new(sql, Box::new(sink)).with_cancel(cancel.clone());
        self.stream(Box::new(task), rx, cancel)
    }

    /// Run a statement for its effect; returns the last result's state.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn execute(&mut self, cx: &Cx, sql: &str) -> Outcome<ResultState, Error> {
        match self.query(cx, sql).await {
            Outcome::Ok(mut results) => Outcome::Ok(results.pop().map(|r| r.state).unwrap_or_default()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn prepare(&mut self, cx: &Cx, sql: &str) -> Outcome<PreparedStatement, Error> {
        let (task, rx) = PrepareTask::new(sql);
        self.run(cx, Box::new(task), rx).await
    }

    /// Execute a prepared statement and collect every result.
    #[tracing::instrument(level = "debug", skip(self, cx, statement, params), fields(statement_id = statement.statement_id))]
    pub async fn execute_prepared(
        &mut self,
        cx: &Cx,
        statement: &PreparedStatement,
        params: Vec<Param>,
    ) -> Outcome<Vec<QueryResult>, Error> {
        let (task, rx) = ExecuteTask::collect(statement, params);
        self.run(cx, Box::new(task), rx).await
    }

    /// Execute a prepared statement and stream its events, optionally
    /// through a read-only cursor fetched `fetch_size` rows at a time.
    #[tracing::instrument(level = "debug", skip(self, statement, params), fields(statement_id = statement.statement_id))]
    pub fn execute_prepared_stream(
        &mut self,
        statement: &PreparedStatement,
        params: Vec<Param>,
        use_cursor: bool,
    ) -> ResultStream<'_> {
        let cancel = CancelToken::new();
        let (sink, rx) = ChannelSink::new();
        let mut task = ExecuteTask::new(statement, params, Box::new(sink)).with_cancel(cancel.clone());
        if use_cursor {
            task = task.cursor();
        }
        self.stream(Box::new(task), rx, cancel)
    }

    pub async fn ping(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.simple(cx, SimpleCommand::Ping).await
    }

    /// `COM_RESET_CONNECTION`: drop session state, keep the login.
    pub async fn reset(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.simple(cx, SimpleCommand::ResetConnection).await
    }

    pub async fn select_db(&mut self, cx: &Cx, schema: &str) -> Outcome<(), Error> {
        self.simple(cx, SimpleCommand::InitDb(schema.to_string())).await
    }

    /// `COM_STMT_RESET`: discard long data and cursor of a statement.
    pub async fn reset_statement(&mut self, cx: &Cx, statement: &PreparedStatement) -> Outcome<(), Error> {
        self.simple(cx, SimpleCommand::StmtReset(statement.statement_id)).await
    }

    pub async fn close_statement(&mut self, cx: &Cx, statement: PreparedStatement) -> Outcome<(), Error> {
        self.simple(cx, SimpleCommand::StmtClose(statement.statement_id)).await
    }

    /// Send `COM_QUIT` and shut the transport down.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.is_usable() {
            return Outcome::Ok(());
        }
        self.simple(cx, SimpleCommand::Quit).await
    }

    async fn simple(&mut self, cx: &Cx, command: SimpleCommand) -> Outcome<(), Error> {
        let (task, rx) = SimpleCommandTask::new(command);
        match self.run(cx, Box::new(task), rx).await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn stream(
        &mut self,
        task: Box<dyn Task>,
        rx: mpsc::UnboundedReceiver<ResultEvent>,
        cancel: CancelToken,
    ) -> ResultStream<'_> {
        self.scheduler.submit(task);
        ResultStream {
            conn: self,
            rx,
            cancel,
            finished: false,
        }
    }

    /// Submit `task` and drive until it answers on `rx`.
    async fn run<T>(
        &mut self,
        cx: &Cx,
        task: Box<dyn Task>,
        mut rx: oneshot::Receiver<Result<T>>,
    ) -> Outcome<T, Error> {
        self.scheduler.submit(task);
        self.drive(cx, || match rx.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(_) => Some(Err(Error::Custom("task ended without an answer".to_string()))),
        })
        .await
    }

    /// Alternate between writing the scheduler's output and reading the
    /// transport until `ready` yields.
    async fn drive<T, F>(&mut self, cx: &Cx, mut ready: F) -> Outcome<T, Error>
    where
        F: FnMut() -> Option<Result<T>>,
    {
        loop {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.flush_outbound().await;
            match ready() {
                Some(Ok(value)) => return Outcome::Ok(value),
                Some(Err(e)) => return Outcome::Err(e),
                None => {}
            }
            if self.scheduler.is_idle() {
                return Outcome::Err(self.scheduler.poisoned().cloned().unwrap_or_else(|| {
                    Error::Custom("connection idle while a result was awaited".to_string())
                }));
            }
            self.read_once().await;
        }
    }

    async fn flush_outbound(&mut self) {
        while let Some(item) = self.scheduler.take_outbound() {
            match item {
                Outbound::Frames(bytes) => {
                    if let Err(e) = self.write_all(&bytes).await {
                        self.scheduler.on_transport_error(e);
                    }
                }
                Outbound::UpgradeTls { server_name } => self.upgrade(server_name).await,
                Outbound::Blocking(job) => {
                    let event = asupersync::runtime::spawn_blocking(job).await;
                    self.scheduler.post_event(event);
                }
                Outbound::Close => self.shutdown().await,
            }
        }
    }

    async fn upgrade(&mut self, server_name: String) {
        let Some(upgrader) = self.tls.clone() else {
            self.scheduler
                .poison(tls_error("server accepted TLS but no TlsUpgrade is configured"));
            return;
        };
        let Some(stream) = self.transport.take() else {
            self.scheduler.on_closed();
            return;
        };
        let mode = self.scheduler.config().ssl_mode;
        tracing::debug!(server_name = %server_name, ?mode, "upgrading transport to TLS");
        match upgrader.upgrade(stream, server_name, mode).await {
            Ok(stream) => {
                self.transport = Some(stream);
                self.scheduler.tls_established();
            }
            Err(e) => self.scheduler.poison(tls_error(format!("TLS handshake failed: {e}"))),
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self
            .transport
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is gone"))?;
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    async fn read_once(&mut self) {
        let Some(stream) = self.transport.as_mut() else {
            self.scheduler.on_closed();
            return;
        };
        match stream.read(&mut self.read_buf).await {
            Ok(0) => self.scheduler.on_closed(),
            Ok(n) => self.scheduler.on_bytes_received(&self.read_buf[..n]),
            Err(e) => self.scheduler.on_transport_error(e),
        }
    }

    async fn shutdown(&mut self) {
        self.closed = true;
        if let Some(mut stream) = self.transport.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(error = %e, "transport shutdown failed");
            }
        }
    }
}

/// Events of one streamed command, pulled by driving the connection.
///
/// Dropping the stream early does not abandon the command: the connection
/// finishes reading it, discarding the events, before running the next one.
pub struct ResultStream<'a> {
    conn: &'a mut MySqlConnection,
    rx: mpsc::UnboundedReceiver<ResultEvent>,
    cancel: CancelToken,
    finished: bool,
}

impl fmt::Debug for ResultStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ResultStream<'_> {
    /// Next event; `None` after [`ResultEvent::Done`] or [`ResultEvent::Error`].
    pub async fn next(&mut self, cx: &Cx) -> Outcome<Option<ResultEvent>, Error> {
        if self.finished {
            return Outcome::Ok(None);
        }
        let rx = &mut self.rx;
        let outcome = self
            .conn
            .drive(cx, || match rx.try_recv() {
                Ok(event) => Some(Ok(Some(event))),
                Err(TryRecvError::Closed) => Some(Ok(None)),
                Err(TryRecvError::Empty) => None,
            })
            .await;
        if let Outcome::Ok(None | Some(ResultEvent::Done | ResultEvent::Error(_))) = &outcome {
            self.finished = true;
        }
        outcome
    }

    /// Stop delivering rows; the rest of the response is read and dropped
    /// and the stream ends with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}
