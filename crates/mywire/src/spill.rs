//! Temp-file backing for oversized column values.
//!
//! A [`SpillWriter`] owns its file until [`SpillWriter::finish`] hands a
//! [`SpilledColumn`] to the consumer. A writer that is dropped unfinished,
//! or that hits an I/O error, deletes what it wrote.

use mywire_core::error::DataErrorKind;
use mywire_core::{Error, Result, SpilledColumn};
use std::fmt::{self, Debug};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink a spilled column is written through.
pub type SpillSink = Box<dyn Write + Send>;

/// Creates the temp files spilled columns are written to.
pub trait TempFileProvider: Send + Sync + Debug {
    /// Create a new, empty, uniquely named file and a writer for it.
    fn create(&self) -> io::Result<(PathBuf, SpillSink)>;
}

/// Files under a directory, `std::env::temp_dir()` unless configured.
#[derive(Debug)]
pub struct TempDirProvider {
    dir: PathBuf,
    prefix: String,
    counter: AtomicU64,
}

impl TempDirProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: format!("mywire-spill-{}", std::process::id()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Default for TempDirProvider {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl TempFileProvider for TempDirProvider {
    fn create(&self) -> io::Result<(PathBuf, SpillSink)> {
        loop {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let nonce: u32 = rand::random();
            let path = self.dir.join(format!("{}-{n}-{nonce:08x}.bin", self.prefix));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, Box::new(file))),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
    }
}

fn spill_error(message: String, err: io::Error) -> Error {
    match Error::data(DataErrorKind::Spill, message) {
        Error::Data(data) => Error::Data(data.with_source(err)),
        other => other,
    }
}

/// One column being streamed to disk.
pub struct SpillWriter {
    path: PathBuf,
    file: Option<SpillSink>,
    expected: u64,
    written: u64,
}

impl Debug for SpillWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpillWriter")
            .field("path", &self.path)
            .field("open", &self.file.is_some())
            .field("expected", &self.expected)
            .field("written", &self.written)
            .finish()
    }
}

impl SpillWriter {
    /// Open a spill file for a column announced as `expected` bytes long.
    pub fn create(provider: &dyn TempFileProvider, expected: u64) -> Result<Self> {
        let (path, file) = provider
            .create()
            .map_err(|e| spill_error("failed to create spill file".to_string(), e))?;
        tracing::debug!(path = %path.display(), expected, "spilling column to disk");
        Ok(Self {
            path,
            file: Some(file),
            expected,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append the next piece of the column.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let result = match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(io::Error::other("spill file already closed")),
        };
        match result {
            Ok(()) => {
                self.written += bytes.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.discard();
                Err(spill_error(
                    format!("failed to write spill file {}", self.path.display()),
                    e,
                ))
            }
        }
    }

    /// Close the file and hand it over, checking every byte arrived.
    pub fn finish(mut self) -> Result<SpilledColumn> {
        let Some(mut file) = self.file.take() else {
            return Err(Error::data(DataErrorKind::Spill, "spill file already closed"));
        };
        if let Err(e) = file.flush() {
            drop(file);
            self.remove_file();
            return Err(spill_error(
                format!("failed to flush spill file {}", self.path.display()),
                e,
            ));
        }
        drop(file);
        if self.written != self.expected {
            self.remove_file();
            return Err(Error::data(
                DataErrorKind::Spill,
                format!(
                    "spill file {} received {} of {} bytes",
                    self.path.display(),
                    self.written,
                    self.expected
                ),
            ));
        }
        let path = std::mem::take(&mut self.path);
        Ok(SpilledColumn::new(path, self.written))
    }

    /// Delete the partial file.
    pub fn discard(&mut self) {
        self.file = None;
        self.remove_file();
    }

    fn remove_file(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove spill file");
            }
        }
        self.path = PathBuf::new();
    }
}

impl Drop for SpillWriter {
    fn drop(&mut self) {
        self.discard();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Provider whose files live in a per-test directory.
    pub(crate) fn test_provider(name: &str) -> TempDirProvider {
        let dir = std::env::temp_dir().join(format!("mywire-test-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        TempDirProvider::new(dir)
    }

    /// Files in `dir`.
    pub(crate) fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    /// Real files whose writes start failing after `limit` bytes, like a
    /// disk filling up.
    #[derive(Debug)]
    pub(crate) struct FullDiskProvider {
        pub(crate) inner: TempDirProvider,
        pub(crate) limit: usize,
    }

    struct LimitedWrite {
        inner: SpillSink,
        left: usize,
    }

    impl Write for LimitedWrite {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.left == 0 {
                return Err(io::Error::new(io::ErrorKind::StorageFull, "no space left"));
            }
            let n = buf.len().min(self.left);
            let n = self.inner.write(&buf[..n])?;
            self.left -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl TempFileProvider for FullDiskProvider {
        fn create(&self) -> io::Result<(PathBuf, SpillSink)> {
            let (path, inner) = self.inner.create()?;
            let sink = LimitedWrite {
                inner,
                left: self.limit,
            };
            Ok((path, Box::new(sink)))
        }
    }

    #[derive(Debug)]
    struct FailingProvider;

    impl TempFileProvider for FailingProvider {
        fn create(&self) -> io::Result<(PathBuf, SpillSink)> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }
    }

    #[test]
    fn test_spill_roundtrip() {
        let provider = test_provider("roundtrip");
        let mut writer = SpillWriter::create(&provider, 6).unwrap();
        writer.write(b"abc").unwrap();
        writer.write(b"def").unwrap();
        let path = writer.path().to_path_buf();
        let col = writer.finish().unwrap();
        assert_eq!(col.path(), path);
        assert_eq!(col.len(), 6);
        assert_eq!(col.read_to_vec().unwrap(), b"abcdef");
        drop(col);
        assert!(!path.exists());
    }

    #[test]
    fn test_short_spill_is_deleted() {
        let provider = test_provider("short");
        let mut writer = SpillWriter::create(&provider, 10).unwrap();
        writer.write(b"abc").unwrap();
        let path = writer.path().to_path_buf();
        let err = writer.finish().unwrap_err();
        assert_eq!(err.data_kind(), Some(DataErrorKind::Spill));
        assert!(!path.exists());
    }

    #[test]
    fn test_dropped_writer_cleans_up() {
        let provider = test_provider("drop");
        let writer = SpillWriter::create(&provider, 3).unwrap();
        let path = writer.path().to_path_buf();
        assert!(path.exists());
        drop(writer);
        assert!(!path.exists());
    }

    #[test]
    fn test_write_failure_deletes_partial_file() {
        let provider = FullDiskProvider {
            inner: test_provider("full"),
            limit: 4,
        };
        let mut writer = SpillWriter::create(&provider, 8).unwrap();
        let path = writer.path().to_path_buf();
        writer.write(b"abc").unwrap();
        let err = writer.write(b"defgh").unwrap_err();
        assert_eq!(err.data_kind(), Some(DataErrorKind::Spill));
        assert!(!path.exists());
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_provider_failure_is_data_error() {
        let err = SpillWriter::create(&FailingProvider, 1).unwrap_err();
        assert_eq!(err.data_kind(), Some(DataErrorKind::Spill));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unique_names() {
        let provider = test_provider("unique");
        let (a, _) = provider.create().unwrap();
        let (b, _) = provider.create().unwrap();
        assert_ne!(a, b);
        std::fs::remove_file(a).unwrap();
        std::fs::remove_file(b).unwrap();
    }
}
