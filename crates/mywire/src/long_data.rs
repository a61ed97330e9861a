//! Chunked parameter and file streaming.
//!
//! Prepared-statement long data and LOCAL INFILE content share one
//! [`ChunkPump`]: it pulls bounded chunks from a [`ChunkSource`], frames
//! them for its target, and enforces the cumulative size limit. Sources
//! that may block are read inside a [`BlockingJob`](crate::scheduler::BlockingJob)
//! and resumed through [`ChunkPump::resume`].

use crate::config::{MIN_LONG_DATA_CHUNK, MySqlConfig};
use crate::protocol::MAX_PACKET_SIZE;
use crate::protocol::prepared::{LONG_DATA_HEADER_LEN, long_data_payload};
use crate::scheduler::{TaskContext, TaskEvent};
use mywire_core::error::DataErrorKind;
use mywire_core::{Error, Result, SpilledColumn};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

/// A producer of parameter or file bytes.
pub trait ChunkSource: Send + fmt::Debug {
    /// Read up to `max` bytes. A result shorter than `max` means the data
    /// ends with it; an empty result means there was nothing left.
    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>>;

    /// Reads may block the calling thread.
    fn is_blocking(&self) -> bool {
        false
    }

    /// Total length, when known up front.
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

/// In-memory bytes.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Vec<u8>,
    pos: usize,
}

impl BytesSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }

    /// Text, sent as UTF-8.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(text.into().into_bytes())
    }
}

impl ChunkSource for BytesSource {
    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let end = self.data.len().min(self.pos.saturating_add(max));
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(chunk)
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Fill `buf` from `reader` until it is full or the reader is exhausted.
fn fill_from<R: Read + ?Sized>(reader: &mut R, max: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max];
    let mut filled = 0;
    while filled < max {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Any [`Read`], read on a blocking thread.
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R> fmt::Debug for ReaderSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderSource").finish_non_exhaustive()
    }
}

impl<R: Read + Send> ChunkSource for ReaderSource<R> {
    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        fill_from(&mut self.reader, max)
    }

    fn is_blocking(&self) -> bool {
        true
    }
}

/// A file, opened on first read.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    len: Option<u64>,
    /// Keeps a spill file alive until it has been sent
    spilled: Option<SpilledColumn>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            len: None,
            spilled: None,
        }
    }

    /// Send a column that was spilled by an earlier result.
    pub fn from_spilled(column: SpilledColumn) -> Self {
        Self {
            path: column.path().to_path_buf(),
            file: None,
            len: Some(column.len()),
            spilled: Some(column),
        }
    }
}

impl ChunkSource for FileSource {
    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path)?);
        }
        let chunk = match self.file.as_mut() {
            Some(file) => fill_from(file, max),
            None => Ok(Vec::new()),
        };
        if matches!(&chunk, Ok(c) if c.len() < max) {
            self.file = None;
            self.spilled = None;
        }
        chunk
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn len_hint(&self) -> Option<u64> {
        self.len
    }
}

/// Chunks handed over by application code, re-cut to the pump's size.
pub struct ProducerSource<I> {
    chunks: I,
    pending: Vec<u8>,
    exhausted: bool,
    blocking: bool,
}

impl<I> ProducerSource<I>
where
    I: Iterator<Item = io::Result<Vec<u8>>> + Send,
{
    pub fn new(chunks: I) -> Self {
        Self {
            chunks,
            pending: Vec::new(),
            exhausted: false,
            blocking: false,
        }
    }

    /// The iterator may wait on I/O; drive it from a blocking thread.
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

impl<I> fmt::Debug for ProducerSource<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerSource")
            .field("pending", &self.pending.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl<I> ChunkSource for ProducerSource<I>
where
    I: Iterator<Item = io::Result<Vec<u8>>> + Send,
{
    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        while self.pending.len() < max && !self.exhausted {
            match self.chunks.next() {
                Some(chunk) => self.pending.extend_from_slice(&chunk?),
                None => self.exhausted = true,
            }
        }
        let take = self.pending.len().min(max);
        let rest = self.pending.split_off(take);
        Ok(std::mem::replace(&mut self.pending, rest))
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }
}

/// Result of a chunk read done off the connection context.
#[derive(Debug)]
pub struct ChunkRead {
    source: Box<dyn ChunkSource>,
    result: io::Result<Vec<u8>>,
}

/// Long-data chunk size for a configured value and the negotiated maximum
/// payload, keeping every frame (header included) inside one packet.
pub fn clamp_chunk_size(configured: usize, max_payload: usize) -> usize {
    let upper = max_payload
        .saturating_sub(LONG_DATA_HEADER_LEN)
        .max(MIN_LONG_DATA_CHUNK);
    configured.max(MIN_LONG_DATA_CHUNK).min(upper)
}

/// Where pumped chunks go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpTarget {
    /// One `COM_STMT_SEND_LONG_DATA` command per chunk
    LongData { statement_id: u32, param_index: u16 },
    /// Raw frames continuing the LOCAL INFILE exchange
    Infile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// A blocking read is in flight; wait for its [`TaskEvent::Chunk`]
    Waiting,
    /// Every frame for this source has been queued
    Finished,
}

/// Moves one source onto the wire.
#[derive(Debug)]
pub struct ChunkPump {
    target: PumpTarget,
    source: Option<Box<dyn ChunkSource>>,
    chunk_size: usize,
    limit: Option<u64>,
    sent: u64,
    frames: u64,
    last_full: bool,
}

impl ChunkPump {
    pub fn long_data(
        statement_id: u32,
        param_index: u16,
        source: Box<dyn ChunkSource>,
        config: &MySqlConfig,
    ) -> Self {
        let max_payload = (config.max_packet_size as usize).min(MAX_PACKET_SIZE);
        Self {
            target: PumpTarget::LongData {
                statement_id,
                param_index,
            },
            source: Some(source),
            chunk_size: clamp_chunk_size(config.long_data_chunk_size, max_payload),
            limit: Some(config.max_allowed_packet),
            sent: 0,
            frames: 0,
            last_full: false,
        }
    }

    /// Infile frames carry raw content, so every chunk stays below a full
    /// packet and the closing empty frame is unambiguous.
    pub fn infile(source: Box<dyn ChunkSource>, config: &MySqlConfig) -> Self {
        Self {
            target: PumpTarget::Infile,
            source: Some(source),
            chunk_size: clamp_chunk_size(config.long_data_chunk_size, MAX_PACKET_SIZE - 1),
            limit: None,
            sent: 0,
            frames: 0,
            last_full: false,
        }
    }

    pub fn target(&self) -> PumpTarget {
        self.target
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Content bytes queued so far.
    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    /// Frames queued so far, empty terminators included.
    pub fn frames_sent(&self) -> u64 {
        self.frames
    }

    /// Queue frames until the source ends or a blocking read is needed.
    pub fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<PumpState> {
        loop {
            let Some(mut source) = self.source.take() else {
                return Ok(PumpState::Finished);
            };
            if source.is_blocking() {
                let max = self.chunk_size;
                ctx.spawn_blocking(Box::new(move || {
                    let result = source.read_chunk(max);
                    TaskEvent::Chunk(ChunkRead { source, result })
                }));
                return Ok(PumpState::Waiting);
            }
            let result = source.read_chunk(self.chunk_size);
            self.source = Some(source);
            if self.accept(result, ctx)? == PumpState::Finished {
                return Ok(PumpState::Finished);
            }
        }
    }

    /// Continue after a blocking read.
    pub fn resume(&mut self, read: ChunkRead, ctx: &mut TaskContext<'_>) -> Result<PumpState> {
        self.source = Some(read.source);
        if self.accept(read.result, ctx)? == PumpState::Finished {
            return Ok(PumpState::Finished);
        }
        self.run(ctx)
    }

    /// Handle one chunk. `Waiting` here means "read again".
    fn accept(&mut self, result: io::Result<Vec<u8>>, ctx: &mut TaskContext<'_>) -> Result<PumpState> {
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(e) => {
                self.source = None;
                self.close_infile(ctx);
                return Err(self.read_error(e));
            }
        };

        if chunk.is_empty() {
            self.source = None;
            if self.last_full || self.frames == 0 || self.target == PumpTarget::Infile {
                self.emit(&[], ctx);
            }
            return Ok(PumpState::Finished);
        }

        let len = chunk.len() as u64;
        if let Some(limit) = self.limit {
            if self.sent + len > limit {
                self.source = None;
                return Err(Error::data(
                    DataErrorKind::PacketTooLarge,
                    format!(
                        "parameter data exceeds max_allowed_packet ({} > {limit} bytes)",
                        self.sent + len
                    ),
                ));
            }
        }

        self.emit(&chunk, ctx);
        self.sent += len;
        self.last_full = chunk.len() == self.chunk_size;
        if !self.last_full {
            self.source = None;
            if self.target == PumpTarget::Infile {
                self.emit(&[], ctx);
            }
            return Ok(PumpState::Finished);
        }
        Ok(PumpState::Waiting)
    }

    fn emit(&mut self, chunk: &[u8], ctx: &mut TaskContext<'_>) {
        match self.target {
            PumpTarget::LongData {
                statement_id,
                param_index,
            } => ctx.send_command(&long_data_payload(statement_id, param_index, chunk)),
            PumpTarget::Infile => ctx.send(chunk),
        }
        self.frames += 1;
    }

    /// The server waits for an empty frame whatever happened locally.
    fn close_infile(&mut self, ctx: &mut TaskContext<'_>) {
        if self.target == PumpTarget::Infile {
            self.emit(&[], ctx);
        }
    }

    fn read_error(&self, err: io::Error) -> Error {
        let (kind, what) = match self.target {
            PumpTarget::LongData { param_index, .. } => (
                DataErrorKind::LongData,
                format!("failed to read long data for parameter {param_index}"),
            ),
            PumpTarget::Infile => (DataErrorKind::Infile, "failed to read local infile".to_string()),
        };
        match Error::data(kind, format!("{what}: {err}")) {
            Error::Data(data) => Error::Data(data.with_source(err)),
            other => other,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::frame::read_joined_payload;
    use crate::scheduler::{Outbound, Scheduler, Step, Task};
    use std::sync::{Arc, Mutex};

    /// Fails on the read after `ok_reads` successful ones.
    #[derive(Debug)]
    pub(crate) struct FailingSource {
        pub(crate) ok_reads: usize,
    }

    impl ChunkSource for FailingSource {
        fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
            if self.ok_reads == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "disk gone"));
            }
            self.ok_reads -= 1;
            Ok(vec![7; max])
        }
    }

    /// Task that only drives a pump, reporting into a shared slot.
    struct PumpTask {
        pump: ChunkPump,
        outcome: Arc<Mutex<Option<Result<()>>>>,
    }

    impl Task for PumpTask {
        fn name(&self) -> &'static str {
            "pump"
        }

        fn start(&mut self, ctx: &mut TaskContext<'_>) -> Result<Step> {
            let state = self.pump.run(ctx);
            self.finish(state)
        }

        fn decode(&mut self, _payload: &[u8], _ctx: &mut TaskContext<'_>) -> Result<Step> {
            Ok(Step::Continue)
        }

        fn on_event(&mut self, event: TaskEvent, ctx: &mut TaskContext<'_>) -> Result<Step> {
            let TaskEvent::Chunk(read) = event else {
                return Ok(Step::Continue);
            };
            let state = self.pump.resume(read, ctx);
            self.finish(state)
        }

        fn on_error(&mut self, error: Error) {
            *self.outcome.lock().unwrap() = Some(Err(error));
        }
    }

    impl PumpTask {
        fn finish(&mut self, state: Result<PumpState>) -> Result<Step> {
            match state? {
                PumpState::Waiting => Ok(Step::Continue),
                PumpState::Finished => {
                    *self.outcome.lock().unwrap() = Some(Ok(()));
                    Ok(Step::Done)
                }
            }
        }
    }

    fn config(chunk: usize) -> MySqlConfig {
        MySqlConfig::new()
            .long_data_chunk_size(chunk)
            .max_allowed_packet(1 << 20)
    }

    /// Run a pump to completion, executing blocking jobs inline. Returns
    /// the payloads of every queued frame and the outcome.
    pub(crate) fn drive(pump: ChunkPump, config: MySqlConfig) -> (Vec<(u8, Vec<u8>)>, Result<()>) {
        let outcome = Arc::new(Mutex::new(None));
        let mut s = Scheduler::new(Arc::new(config));
        s.submit(Box::new(PumpTask {
            pump,
            outcome: Arc::clone(&outcome),
        }));
        let mut frames = Vec::new();
        while let Some(item) = s.take_outbound() {
            match item {
                Outbound::Frames(bytes) => {
                    let (joined, _) = read_joined_payload(&bytes).unwrap().unwrap();
                    frames.push((joined.first_seq, joined.payload));
                }
                Outbound::Blocking(job) => s.post_event(job()),
                other => panic!("unexpected {other:?}"),
            }
        }
        let result = outcome.lock().unwrap().take().unwrap();
        (frames, result)
    }

    #[test]
    fn test_clamp_chunk_size() {
        assert_eq!(clamp_chunk_size(10, MAX_PACKET_SIZE), MIN_LONG_DATA_CHUNK);
        assert_eq!(clamp_chunk_size(8192, MAX_PACKET_SIZE), 8192);
        assert_eq!(clamp_chunk_size(usize::MAX, 4096), 4096 - LONG_DATA_HEADER_LEN);
        // a tiny max payload never pushes the chunk below the floor
        assert_eq!(clamp_chunk_size(5000, 100), MIN_LONG_DATA_CHUNK);
    }

    #[test]
    fn test_exact_multiple_sends_trailing_empty_frame() {
        let cfg = config(1024);
        let pump = ChunkPump::long_data(9, 2, Box::new(BytesSource::new(vec![1u8; 3072])), &cfg);
        let (frames, result) = drive(pump, cfg);
        result.unwrap();
        assert_eq!(frames.len(), 4);
        for (seq, payload) in &frames {
            assert_eq!(*seq, 0);
            assert_eq!(payload[0], 0x18);
            assert_eq!(&payload[1..5], &9u32.to_le_bytes());
            assert_eq!(&payload[5..7], &2u16.to_le_bytes());
        }
        assert_eq!(frames[0].1.len(), LONG_DATA_HEADER_LEN + 1024);
        assert_eq!(frames[3].1.len(), LONG_DATA_HEADER_LEN);
    }

    #[test]
    fn test_partial_last_chunk_has_no_empty_frame() {
        let cfg = config(1024);
        let pump = ChunkPump::long_data(1, 0, Box::new(BytesSource::new(vec![1u8; 1500])), &cfg);
        let (frames, result) = drive(pump, cfg);
        result.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].1.len(), LONG_DATA_HEADER_LEN + 476);
    }

    #[test]
    fn test_empty_source_sends_one_empty_frame() {
        let cfg = config(1024);
        let pump = ChunkPump::long_data(1, 0, Box::new(BytesSource::from_text("")), &cfg);
        let (frames, result) = drive(pump, cfg);
        result.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1.len(), LONG_DATA_HEADER_LEN);
    }

    #[test]
    fn test_limit_stops_before_offending_frame() {
        let cfg = config(1024).max_allowed_packet(2048);
        let pump = ChunkPump::long_data(1, 0, Box::new(BytesSource::new(vec![0u8; 4000])), &cfg);
        let (frames, result) = drive(pump, cfg);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            result.unwrap_err().data_kind(),
            Some(DataErrorKind::PacketTooLarge)
        );
    }

    #[test]
    fn test_reader_source_runs_as_blocking_job() {
        let cfg = config(1024);
        let data = io::Cursor::new(vec![3u8; 2048 + 10]);
        let pump = ChunkPump::long_data(4, 1, Box::new(ReaderSource::new(data)), &cfg);
        let (frames, result) = drive(pump, cfg);
        result.unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].1.len(), LONG_DATA_HEADER_LEN + 10);
    }

    #[test]
    fn test_producer_rechunks() {
        let cfg = config(1024);
        let pieces = vec![Ok(vec![1u8; 700]), Ok(vec![2u8; 700]), Ok(vec![3u8; 648])];
        let pump = ChunkPump::long_data(
            4,
            1,
            Box::new(ProducerSource::new(pieces.into_iter())),
            &cfg,
        );
        let (frames, result) = drive(pump, cfg);
        result.unwrap();
        // 2048 bytes: two full chunks plus the empty terminator
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].1[LONG_DATA_HEADER_LEN], 2);
        assert_eq!(frames[1].1.last(), Some(&3));
    }

    #[test]
    fn test_read_error_is_long_data_error() {
        let cfg = config(1024);
        let pump = ChunkPump::long_data(1, 3, Box::new(FailingSource { ok_reads: 1 }), &cfg);
        let (frames, result) = drive(pump, cfg);
        assert_eq!(frames.len(), 1);
        let err = result.unwrap_err();
        assert_eq!(err.data_kind(), Some(DataErrorKind::LongData));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_infile_frames_continue_sequence() {
        let cfg = config(1024);
        let pump = ChunkPump::infile(Box::new(BytesSource::new(vec![5u8; 1100])), &cfg);
        let (frames, result) = drive(pump, cfg);
        result.unwrap();
        let seqs: Vec<u8> = frames.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(frames[0].1.len(), 1024);
        assert_eq!(frames[1].1.len(), 76);
        assert!(frames[2].1.is_empty());
    }

    #[test]
    fn test_infile_error_still_sends_empty_frame() {
        let cfg = config(1024);
        let pump = ChunkPump::infile(Box::new(FailingSource { ok_reads: 1 }), &cfg);
        let (frames, result) = drive(pump, cfg);
        assert_eq!(frames.len(), 2);
        assert!(frames[1].1.is_empty());
        assert_eq!(result.unwrap_err().data_kind(), Some(DataErrorKind::Infile));
    }

    #[test]
    fn test_spilled_file_source() {
        let provider = crate::spill::tests::test_provider("long-data");
        let mut writer = crate::spill::SpillWriter::create(&provider, 5).unwrap();
        writer.write(b"hello").unwrap();
        let column = writer.finish().unwrap();
        let path = column.path().to_path_buf();

        let mut source = FileSource::from_spilled(column);
        assert_eq!(source.len_hint(), Some(5));
        assert_eq!(source.read_chunk(1024).unwrap(), b"hello");
        // the spill file goes away once fully read
        assert!(!path.exists());
    }
}
