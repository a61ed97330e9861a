//! Single-connection task scheduler.
//!
//! The scheduler owns everything that must not be shared: the cumulative
//! receive buffer, the sequence counter, the FIFO task queue and the
//! negotiated session. It performs no I/O. The driver feeds it received
//! bytes and drains [`Outbound`] work from it.
//!
//! ```text
//!  submit ──► queue ──► active ──start──► Outbound::Frames ──► transport
//!                         ▲                                     │
//!                         └──decode◄── FrameDecoder ◄── bytes ◄─┘
//! ```
//!
//! Exactly one task is active. Tasks never see the scheduler itself; each
//! call receives a [`TaskContext`] holding just the capabilities a task may
//! use.

use crate::config::MySqlConfig;
use crate::infile::InfileHandler;
use crate::long_data::ChunkRead;
use crate::protocol::frame::{self, sequence_error};
use crate::protocol::{FrameDecoder, MAX_PACKET_SIZE};
use crate::spill::{TempDirProvider, TempFileProvider};
use futures_channel::oneshot;
use mywire_core::error::{ConnectionError, ConnectionErrorKind};
use mywire_core::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Identifier handed out by [`Scheduler::submit`].
pub type TaskId = u64;

/// What a task reports after each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Waiting for more frames or events
    Continue,
    /// Finished; the next queued task may start
    Done,
}

/// Work run off the connection context. Its result comes back through
/// [`Scheduler::post_event`].
pub type BlockingJob = Box<dyn FnOnce() -> TaskEvent + Send>;

/// Something the driver has to do on behalf of the scheduler.
pub enum Outbound {
    /// Wire bytes, already framed
    Frames(Vec<u8>),
    /// Replace the transport with a TLS one, then call
    /// [`Scheduler::tls_established`]
    UpgradeTls { server_name: String },
    /// Run the job on a blocking thread, then post its event
    Blocking(BlockingJob),
    /// The connection is finished; close the transport
    Close,
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::Frames(bytes) => f.debug_tuple("Frames").field(&bytes.len()).finish(),
            Outbound::UpgradeTls { server_name } => f
                .debug_struct("UpgradeTls")
                .field("server_name", server_name)
                .finish(),
            Outbound::Blocking(_) => f.write_str("Blocking"),
            Outbound::Close => f.write_str("Close"),
        }
    }
}

/// Non-frame input delivered to the active task.
#[derive(Debug)]
pub enum TaskEvent {
    /// The transport now runs over TLS
    TlsEstablished,
    /// A blocking chunk read finished
    Chunk(ChunkRead),
}

/// Connection facts shared by all tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Client ∩ server capabilities
    pub capabilities: u32,
    pub server_capabilities: u32,
    pub collation: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub status_flags: u16,
    /// The transport is TLS-protected
    pub secure: bool,
    pub authenticated: bool,
}

impl Session {
    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }
}

/// Bytes of one payload handed over before the whole payload is buffered.
#[derive(Debug, Clone, Copy)]
pub struct Piece<'a> {
    pub bytes: &'a [u8],
    /// Declared length of the frame these bytes belong to
    pub frame_len: usize,
    /// The payload starts with these bytes
    pub first: bool,
    /// The payload ends with these bytes
    pub last: bool,
}

/// One exchange with the server.
///
/// `decode` is only called with complete, sequence-checked payloads, unless
/// the task asks for pieces through [`Task::piece_threshold`]. A task
/// that returns `Err` has ended; for a non-fatal error it must only do so
/// once the server has nothing more to send for it.
pub trait Task: Send {
    fn name(&self) -> &'static str;

    /// Produce the first outbound frames.
    fn start(&mut self, ctx: &mut TaskContext<'_>) -> Result<Step>;

    /// Handle one logical payload from the server.
    fn decode(&mut self, payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<Step>;

    /// Payloads whose first frame is longer than this are delivered through
    /// [`Task::decode_piece`] as their bytes arrive.
    fn piece_threshold(&self) -> Option<usize> {
        None
    }

    /// Handle part of a payload. Only called while
    /// [`Task::piece_threshold`] returned a limit the payload exceeds.
    fn decode_piece(&mut self, _piece: Piece<'_>, _ctx: &mut TaskContext<'_>) -> Result<Step> {
        Err(Error::protocol(format!(
            "{} does not accept partial payloads",
            self.name()
        )))
    }

    /// Handle a TLS or blocking-job event.
    fn on_event(&mut self, event: TaskEvent, _ctx: &mut TaskContext<'_>) -> Result<Step> {
        Err(Error::protocol(format!(
            "{} does not accept event {event:?}",
            self.name()
        )))
    }

    /// The task ended with `error`; report it to whoever waits.
    fn on_error(&mut self, error: Error);
}

/// Capabilities handed to a task for the duration of one call.
pub struct TaskContext<'a> {
    id: TaskId,
    seq: &'a mut u8,
    outbound: &'a mut VecDeque<Outbound>,
    session: &'a mut Session,
    config: &'a MySqlConfig,
    temp_files: &'a Arc<dyn TempFileProvider>,
    infile: Option<&'a Arc<dyn InfileHandler>>,
}

impl TaskContext<'_> {
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Send `payload` as a new command: the sequence restarts at 0.
    pub fn send_command(&mut self, payload: &[u8]) {
        *self.seq = 0;
        self.send(payload);
    }

    /// Send `payload` continuing the current exchange's sequence.
    pub fn send(&mut self, payload: &[u8]) {
        let mut out = Vec::with_capacity(payload.len() + 4);
        let first = *self.seq;
        *self.seq = frame::write_frames(&mut out, first, payload);
        tracing::trace!(task = self.id, seq = first, len = payload.len(), "queue frame");
        self.outbound.push_back(Outbound::Frames(out));
    }

    /// Ask the driver to upgrade the transport to TLS.
    pub fn request_tls(&mut self, server_name: impl Into<String>) {
        self.outbound.push_back(Outbound::UpgradeTls {
            server_name: server_name.into(),
        });
    }

    /// Run `job` off the connection context.
    pub fn spawn_blocking(&mut self, job: BlockingJob) {
        self.outbound.push_back(Outbound::Blocking(job));
    }

    /// Ask the driver to close the transport once queued frames are out.
    pub fn close(&mut self) {
        self.outbound.push_back(Outbound::Close);
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        self.session
    }

    pub fn temp_files(&self) -> Arc<dyn TempFileProvider> {
        Arc::clone(self.temp_files)
    }

    pub fn infile_handler(&self) -> Option<Arc<dyn InfileHandler>> {
        self.infile.cloned()
    }
}

impl<'a> TaskContext<'a> {
    /// Connection configuration; outlives the call so tasks may hold it
    /// while sending.
    pub fn config(&self) -> &'a MySqlConfig {
        self.config
    }
}

/// Completion slot for tasks that produce a single value.
#[derive(Debug)]
pub struct Responder<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Responder<T> {
    pub fn new() -> (Self, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver the outcome. Later calls are ignored.
    pub fn send(&mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        }
    }
}

/// A payload being handed to a task piece by piece.
#[derive(Debug, Clone, Copy)]
struct InPieces {
    task: TaskId,
    /// Declared length of the current frame
    frame_len: usize,
    /// Body bytes of the current frame not yet delivered
    remaining: usize,
    first: bool,
}

/// The connection's execution context.
pub struct Scheduler {
    config: Arc<MySqlConfig>,
    temp_files: Arc<dyn TempFileProvider>,
    infile: Option<Arc<dyn InfileHandler>>,
    session: Session,
    decoder: FrameDecoder,
    /// Next sequence id to send or expect
    seq: u8,
    next_id: TaskId,
    active: Option<(TaskId, Box<dyn Task>)>,
    queue: VecDeque<(TaskId, Box<dyn Task>)>,
    outbound: VecDeque<Outbound>,
    poisoned: Option<Error>,
    pieces: Option<InPieces>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("session", &self.session)
            .field("seq", &self.seq)
            .field("active", &self.active.as_ref().map(|(id, t)| (*id, t.name())))
            .field("queued", &self.queue.len())
            .field("outbound", &self.outbound.len())
            .field("poisoned", &self.poisoned.is_some())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(config: Arc<MySqlConfig>) -> Self {
        Self {
            config,
            temp_files: Arc::new(TempDirProvider::default()),
            infile: None,
            session: Session::default(),
            decoder: FrameDecoder::new(),
            seq: 0,
            next_id: 1,
            active: None,
            queue: VecDeque::new(),
            outbound: VecDeque::new(),
            poisoned: None,
            pieces: None,
        }
    }

    /// Where spilled columns are written.
    pub fn with_temp_files(mut self, provider: Arc<dyn TempFileProvider>) -> Self {
        self.temp_files = provider;
        self
    }

    /// Source of LOCAL INFILE content.
    pub fn with_infile_handler(mut self, handler: Arc<dyn InfileHandler>) -> Self {
        self.infile = Some(handler);
        self
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The error that broke the connection, if any.
    pub fn poisoned(&self) -> Option<&Error> {
        self.poisoned.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    pub fn has_active_task(&self) -> bool {
        self.active.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Received bytes not yet handed to a task.
    pub fn buffered(&self) -> usize {
        self.decoder.buffered()
    }

    /// Enqueue a task; it starts at once if nothing else is running.
    pub fn submit(&mut self, mut task: Box<dyn Task>) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;

        if let Some(err) = &self.poisoned {
            tracing::debug!(task = id, name = task.name(), "rejecting task on broken connection");
            task.on_error(err.clone());
            return id;
        }

        tracing::debug!(task = id, name = task.name(), "submit");
        self.queue.push_back((id, task));
        if self.active.is_none() {
            self.promote();
            // A read may have delivered this task's reply along with the
            // previous one.
            if self.active.is_some() && self.has_input() {
                self.on_bytes_received(&[]);
            }
        }
        id
    }

    /// Next piece of work for the driver.
    pub fn take_outbound(&mut self) -> Option<Outbound> {
        self.outbound.pop_front()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Feed bytes read from the transport.
    pub fn on_bytes_received(&mut self, bytes: &[u8]) {
        if self.poisoned.is_some() {
            return;
        }
        self.decoder.extend(bytes);

        while self.active.is_some() {
            let progressed = if self.pieces.is_some() {
                self.next_piece()
            } else if self.wants_pieces() {
                self.begin_pieces()
            } else {
                self.next_joined()
            };
            match progressed {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.poison(e);
                    return;
                }
            }
        }
    }

    fn has_input(&self) -> bool {
        self.decoder.has_complete_frame() || (self.pieces.is_some() && self.decoder.buffered() > 0)
    }

    /// Deliver the next fully buffered payload.
    fn next_joined(&mut self) -> Result<bool> {
        let Some(joined) = self.decoder.next_payload()? else {
            return Ok(false);
        };
        if joined.first_seq != self.seq {
            return Err(sequence_error(self.seq, joined.first_seq));
        }
        self.seq = joined.last_seq.wrapping_add(1);

        let result = self.with_active(|task, ctx| task.decode(&joined.payload, ctx));
        self.settle(result);
        Ok(true)
    }

    /// The next frame is too long for the active task to wait for.
    fn wants_pieces(&self) -> bool {
        let Some(header) = self.decoder.peek_header() else {
            return false;
        };
        let Some(threshold) = self.active.as_ref().and_then(|(_, t)| t.piece_threshold()) else {
            return false;
        };
        let len = header.payload_length as usize;
        len == MAX_PACKET_SIZE || len > threshold
    }

    fn begin_pieces(&mut self) -> Result<bool> {
        let (Some(header), Some((task, _))) = (self.decoder.take_header(), self.active.as_ref())
        else {
            return Ok(false);
        };
        if header.sequence_id != self.seq {
            return Err(sequence_error(self.seq, header.sequence_id));
        }
        self.seq = self.seq.wrapping_add(1);
        let len = header.payload_length as usize;
        tracing::trace!(task = *task, seq = header.sequence_id, len, "streaming payload");
        self.pieces = Some(InPieces {
            task: *task,
            frame_len: len,
            remaining: len,
            first: true,
        });
        Ok(true)
    }

    /// Hand over whatever part of the streamed payload has arrived.
    fn next_piece(&mut self) -> Result<bool> {
        let Some(mut p) = self.pieces else {
            return Ok(false);
        };
        if p.remaining == 0 {
            // Full frame done; the chain continues.
            let Some(header) = self.decoder.take_header() else {
                return Ok(false);
            };
            if header.sequence_id != self.seq {
                return Err(sequence_error(self.seq, header.sequence_id));
            }
            self.seq = self.seq.wrapping_add(1);
            p.frame_len = header.payload_length as usize;
            p.remaining = p.frame_len;
        }

        let bytes = self.decoder.take_body(p.remaining).to_vec();
        if bytes.is_empty() && p.remaining > 0 {
            self.pieces = Some(p);
            return Ok(false);
        }
        p.remaining -= bytes.len();
        let last = p.remaining == 0 && p.frame_len < MAX_PACKET_SIZE;
        let piece = Piece {
            bytes: &bytes,
            frame_len: p.frame_len,
            first: p.first,
            last,
        };
        p.first = false;
        self.pieces = if last { None } else { Some(p) };

        if self.active.as_ref().is_some_and(|(id, _)| *id == p.task) {
            let result = self.with_active(|task, ctx| task.decode_piece(piece, ctx));
            self.settle(result);
        }
        Ok(true)
    }

    /// Deliver a TLS or blocking-job event to the active task.
    pub fn post_event(&mut self, event: TaskEvent) {
        if self.poisoned.is_some() {
            return;
        }
        if self.active.is_none() {
            tracing::debug!(?event, "dropping event: no active task");
            return;
        }
        let result = self.with_active(|task, ctx| task.on_event(event, ctx));
        self.settle(result);
        // Frames may already be buffered for the next task.
        if self.active.is_some() && self.has_input() {
            self.on_bytes_received(&[]);
        }
    }

    /// The driver finished the TLS upgrade.
    pub fn tls_established(&mut self) {
        self.session.secure = true;
        self.post_event(TaskEvent::TlsEstablished);
    }

    /// The peer closed the transport.
    pub fn on_closed(&mut self) {
        self.poison(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "connection closed by server".to_string(),
            source: None,
        }));
    }

    /// Reading or writing the transport failed.
    pub fn on_transport_error(&mut self, err: std::io::Error) {
        self.poison(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: format!("transport error: {err}"),
            source: Some(Arc::new(err)),
        }));
    }

    /// Fail every task with `error` and refuse further work.
    pub fn poison(&mut self, error: Error) {
        if self.poisoned.is_some() {
            return;
        }
        tracing::debug!(error = %error, queued = self.queue.len(), "connection poisoned");
        self.poisoned = Some(error.clone());
        if let Some((_, mut task)) = self.active.take() {
            task.on_error(error.clone());
        }
        for (_, mut task) in self.queue.drain(..) {
            task.on_error(error.clone());
        }
        self.decoder.clear();
        self.pieces = None;
        self.outbound
            .retain(|item| matches!(item, Outbound::Close));
    }

    fn with_active<F>(&mut self, f: F) -> Result<Step>
    where
        F: FnOnce(&mut dyn Task, &mut TaskContext<'_>) -> Result<Step>,
    {
        let Some((id, task)) = self.active.as_mut() else {
            return Ok(Step::Done);
        };
        let mut ctx = TaskContext {
            id: *id,
            seq: &mut self.seq,
            outbound: &mut self.outbound,
            session: &mut self.session,
            config: &self.config,
            temp_files: &self.temp_files,
            infile: self.infile.as_ref(),
        };
        f(task.as_mut(), &mut ctx)
    }

    /// Apply the outcome of a call on the active task.
    fn settle(&mut self, result: Result<Step>) {
        match result {
            Ok(Step::Continue) => {}
            Ok(Step::Done) => {
                if let Some((id, task)) = self.active.take() {
                    tracing::debug!(task = id, name = task.name(), "task done");
                }
                self.promote();
            }
            Err(e) if e.is_fatal() => self.poison(e),
            Err(e) => {
                if let Some((id, mut task)) = self.active.take() {
                    tracing::debug!(task = id, name = task.name(), error = %e, "task failed");
                    task.on_error(e);
                }
                self.promote();
            }
        }
    }

    /// Start queued tasks until one stays active.
    fn promote(&mut self) {
        while self.active.is_none() && self.poisoned.is_none() {
            let Some(entry) = self.queue.pop_front() else {
                return;
            };
            tracing::debug!(task = entry.0, name = entry.1.name(), "start");
            self.active = Some(entry);
            self.seq = 0;
            let result = self.with_active(|task, ctx| task.start(ctx));
            self.settle(result);
        }
    }
}
