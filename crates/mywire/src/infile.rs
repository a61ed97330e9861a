//! LOCAL INFILE support.
//!
//! The server answers `LOAD DATA LOCAL INFILE` with a `0xFB` request naming
//! a file. The client streams the content as frames continuing the
//! sequence and always closes with an empty frame, even when it refuses or
//! fails, so the server can finish the statement with OK or ERR. A local
//! failure is kept and reported after that reply.

use crate::long_data::{ChunkPump, ChunkRead, ChunkSource, FileSource, PumpState};
use crate::protocol::capabilities::CLIENT_LOCAL_FILES;
use crate::protocol::{PacketReader, malformed};
use crate::scheduler::TaskContext;
use mywire_core::error::DataErrorKind;
use mywire_core::{Error, Result};
use std::fmt::Debug;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Maps a server-requested file name to its content.
pub trait InfileHandler: Send + Sync + Debug {
    fn open(&self, file_name: &str) -> io::Result<Box<dyn ChunkSource>>;
}

/// Serves relative paths below one directory.
#[derive(Debug, Clone)]
pub struct DirectoryInfileHandler {
    root: PathBuf,
}

impl DirectoryInfileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl InfileHandler for DirectoryInfileHandler {
    fn open(&self, file_name: &str) -> io::Result<Box<dyn ChunkSource>> {
        let requested = Path::new(file_name);
        let escapes = requested
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{file_name} is outside {}", self.root.display()),
            ));
        }
        Ok(Box::new(FileSource::new(self.root.join(requested))))
    }
}

fn infile_error(message: String, source: Option<io::Error>) -> Error {
    match (Error::data(DataErrorKind::Infile, message), source) {
        (Error::Data(data), Some(err)) => Error::Data(data.with_source(err)),
        (other, _) => other,
    }
}

/// File name from a `0xFB` request payload.
pub fn parse_request(payload: &[u8]) -> Result<String> {
    let mut r = PacketReader::new(payload);
    if r.read_u8() != Some(0xFB) {
        return Err(malformed("LOCAL INFILE request", payload));
    }
    Ok(r.read_rest_string())
}

/// One file being sent in answer to a request.
#[derive(Debug)]
pub struct InfileTransfer {
    file_name: String,
    pump: Option<ChunkPump>,
    error: Option<Error>,
}

impl InfileTransfer {
    /// Handle the request payload: open the file and start streaming, or
    /// refuse with an empty frame.
    pub fn start(payload: &[u8], ctx: &mut TaskContext<'_>) -> Result<(Self, PumpState)> {
        let file_name = parse_request(payload)?;
        tracing::debug!(file = %file_name, "local infile requested");
        let mut transfer = Self {
            file_name,
            pump: None,
            error: None,
        };

        let source = if !ctx.config().local_infile || !ctx.session().has_capability(CLIENT_LOCAL_FILES) {
            Err(infile_error(
                format!("LOCAL INFILE is disabled; refusing {}", transfer.file_name),
                None,
            ))
        } else if let Some(handler) = ctx.infile_handler() {
            handler.open(&transfer.file_name).map_err(|e| {
                infile_error(format!("cannot open {}: {e}", transfer.file_name), Some(e))
            })
        } else {
            Err(infile_error(
                format!("no infile handler configured for {}", transfer.file_name),
                None,
            ))
        };

        match source {
            Ok(source) => {
                let mut pump = ChunkPump::infile(source, ctx.config());
                let state = transfer.observe(pump.run(ctx));
                transfer.pump = Some(pump);
                Ok((transfer, state))
            }
            Err(err) => {
                tracing::warn!(error = %err, "refusing local infile");
                ctx.send(&[]);
                transfer.error = Some(err);
                Ok((transfer, PumpState::Finished))
            }
        }
    }

    /// Continue after a blocking read.
    pub fn resume(&mut self, read: ChunkRead, ctx: &mut TaskContext<'_>) -> Result<PumpState> {
        let Some(pump) = self.pump.as_mut() else {
            return Err(Error::protocol("chunk event without an infile transfer"));
        };
        let result = pump.resume(read, ctx);
        Ok(self.observe(result))
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn bytes_sent(&self) -> u64 {
        self.pump.as_ref().map_or(0, ChunkPump::bytes_sent)
    }

    /// The local failure to report once the server has replied.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// The pump has already sent the closing frame when it fails.
    fn observe(&mut self, result: Result<PumpState>) -> PumpState {
        match result {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(file = %self.file_name, error = %err, "local infile read failed");
                self.error = Some(err);
                PumpState::Finished
            }
        }
    }
}
