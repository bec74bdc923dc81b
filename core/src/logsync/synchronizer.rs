//! Append-only local mirror of remote log streams.
//!
//! One directory per machine, one file per stream. The persisted offset of a
//! stream is the length of its local file, so resuming after a crash or a
//! lost file needs no extra bookkeeping. While a stream is live only
//! complete lines are written and a trailing partial line is fetched again
//! on the next pass. Once the writer is done, [`LogSynchronizer::sync_final`]
//! keeps the partial line too.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::SyncError;
use crate::remote::OutputLine;

use super::lock::FileLock;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);


// ---------------------------------------------------------------------------
// Stream identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKind {
    Setup,
    Run { slot: u32, run: u32 },
}

impl StreamKind {
    pub fn file_name(&self) -> String {
        match self {
            StreamKind::Setup => "setup.log".to_string(),
            StreamKind::Run { slot, run } => format!("slot{}_run{}.log", slot, run),
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Setup => f.write_str("setup"),
            StreamKind::Run { slot, run } => write!(f, "slot {} run {}", slot, run),
        }
    }
}

/// A log stream of one machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub machine: String,
    pub kind: StreamKind,
}

impl StreamId {
    pub fn new(machine: &str, kind: StreamKind) -> Self {
        StreamId {
            machine: machine.to_string(),
            kind,
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.machine, self.kind)
    }
}


// ---------------------------------------------------------------------------
// LogSynchronizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LogSynchronizer {
    root: PathBuf,
}

impl LogSynchronizer {
    pub fn new(root: &Path) -> Self {
        LogSynchronizer {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn machine_dir(&self, machine: &str) -> PathBuf {
        self.root.join(machine)
    }

    pub fn path_of(&self, stream: &StreamId) -> PathBuf {
        self.machine_dir(&stream.machine).join(stream.kind.file_name())
    }

    /// Bytes of `stream` persisted so far. A missing file counts as zero.
    pub fn persisted_offset(&self, stream: &StreamId) -> Result<u64, SyncError> {
        let path = self.path_of(stream);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(SyncError::Io { path, source }),
        }
    }

    /// Append `lines`, which start at byte `offset` of the remote stream.
    ///
    /// Whatever overlaps what is already persisted is skipped, so replaying a
    /// chunk writes nothing. A chunk that starts past the persisted end is a
    /// gap and is refused. Returns the number of bytes written.
    pub fn sync(
        &self,
        stream: &StreamId,
        offset: u64,
        lines: &[OutputLine],
    ) -> Result<u64, SyncError> {
        let data: Vec<u8> = lines
            .iter()
            .take_while(|l| l.is_complete())
            .flat_map(|l| l.0.iter().copied())
            .collect();
        self.append(stream, offset, &data)
    }

    /// Like [`sync`](Self::sync), but also keeps a trailing line with no
    /// newline. Only for streams whose writer has finished: a crashed run or
    /// a progress bar that never ended its line.
    pub fn sync_final(
        &self,
        stream: &StreamId,
        offset: u64,
        lines: &[OutputLine],
    ) -> Result<u64, SyncError> {
        let data: Vec<u8> = lines.iter().flat_map(|l| l.0.iter().copied()).collect();
        self.append(stream, offset, &data)
    }

    fn append(&self, stream: &StreamId, offset: u64, data: &[u8]) -> Result<u64, SyncError> {
        if data.is_empty() {
            return Ok(0);
        }

        let _lock = FileLock::acquire(&self.machine_dir(&stream.machine).join(".lock"), LOCK_TIMEOUT)?;
        let persisted = self.persisted_offset(stream)?;
        if offset > persisted {
            return Err(SyncError::Gap {
                stream: stream.to_string(),
                persisted,
                offset,
            });
        }
        let end = offset + data.len() as u64;
        if end <= persisted {
            trace!(%stream, offset, "chunk already persisted");
            return Ok(0);
        }

        let fresh = &data[(persisted - offset) as usize..];
        let path = self.path_of(stream);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SyncError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(fresh)
            .and_then(|_| file.flush())
            .map_err(|source| SyncError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(%stream, bytes = fresh.len(), "log appended");
        Ok(fresh.len() as u64)
    }

    /// Everything persisted for `stream`.
    pub fn read_persisted(&self, stream: &StreamId) -> Result<Vec<u8>, SyncError> {
        self.read_tail(stream, u64::MAX)
    }

    /// At most the last `max_bytes` persisted for `stream`.
    pub fn read_tail(&self, stream: &StreamId, max_bytes: u64) -> Result<Vec<u8>, SyncError> {
        let path = self.path_of(stream);
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SyncError::Io { path, source }),
        };
        let io_err = |source| SyncError::Io {
            path: path.clone(),
            source,
        };
        let len = file.metadata().map_err(io_err)?.len();
        let start = len.saturating_sub(max_bytes);
        file.seek(SeekFrom::Start(start)).map_err(io_err)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(io_err)?;
        Ok(buf)
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::session::split_lines;

    fn setup() -> (tempfile::TempDir, LogSynchronizer, StreamId) {
        let dir = tempfile::tempdir().unwrap();
        let sync = LogSynchronizer::new(dir.path());
        let stream = StreamId::new("otter", StreamKind::Run { slot: 1, run: 3 });
        (dir, sync, stream)
    }

    #[test]
    fn layout_is_machine_then_stream() {
        let (dir, sync, stream) = setup();
        assert_eq!(
            sync.path_of(&stream),
            dir.path().join("otter").join("slot1_run3.log")
        );
        assert_eq!(StreamKind::Setup.file_name(), "setup.log");
    }

    #[test]
    fn appends_and_tracks_offset() {
        let (_dir, sync, stream) = setup();
        assert_eq!(sync.persisted_offset(&stream).unwrap(), 0);
        let n = sync.sync(&stream, 0, &split_lines(b"epoch 1\nepoch 2\n")).unwrap();
        assert_eq!(n, 16);
        assert_eq!(sync.persisted_offset(&stream).unwrap(), 16);
        sync.sync(&stream, 16, &split_lines(b"epoch 3\n")).unwrap();
        assert_eq!(sync.read_persisted(&stream).unwrap(), b"epoch 1\nepoch 2\nepoch 3\n");
    }

    #[test]
    fn same_offset_twice_never_duplicates() {
        let (_dir, sync, stream) = setup();
        let chunk = split_lines(b"a\nb\n");
        assert_eq!(sync.sync(&stream, 0, &chunk).unwrap(), 4);
        assert_eq!(sync.sync(&stream, 0, &chunk).unwrap(), 0);
        assert_eq!(sync.read_persisted(&stream).unwrap(), b"a\nb\n");
    }

    #[test]
    fn overlapping_ranges_append_only_the_new_part() {
        let (_dir, sync, stream) = setup();
        sync.sync(&stream, 0, &split_lines(b"a\nb\n")).unwrap();
        let n = sync.sync(&stream, 2, &split_lines(b"b\nc\nd\n")).unwrap();
        assert_eq!(n, 4);
        assert_eq!(sync.read_persisted(&stream).unwrap(), b"a\nb\nc\nd\n");
    }

    #[test]
    fn gap_is_refused() {
        let (_dir, sync, stream) = setup();
        sync.sync(&stream, 0, &split_lines(b"a\n")).unwrap();
        let err = sync.sync(&stream, 10, &split_lines(b"z\n")).unwrap_err();
        assert!(matches!(err, SyncError::Gap { persisted: 2, offset: 10, .. }));
        assert_eq!(sync.read_persisted(&stream).unwrap(), b"a\n");
    }

    #[test]
    fn partial_trailing_line_is_held_back() {
        let (_dir, sync, stream) = setup();
        let n = sync.sync(&stream, 0, &split_lines(b"done\nloading 45%")).unwrap();
        assert_eq!(n, 5);
        let n = sync.sync(&stream, 5, &split_lines(b"loading 45%... ok\n")).unwrap();
        assert_eq!(n, 18);
        assert_eq!(sync.read_persisted(&stream).unwrap(), b"done\nloading 45%... ok\n");
    }

    #[test]
    fn final_sync_keeps_the_unterminated_last_line() {
        let (_dir, sync, stream) = setup();
        sync.sync(&stream, 0, &split_lines(b"epoch 1\nfinal acc 0.93")).unwrap();
        assert_eq!(sync.read_persisted(&stream).unwrap(), b"epoch 1\n");

        let n = sync.sync_final(&stream, 8, &split_lines(b"final acc 0.93")).unwrap();
        assert_eq!(n, 14);
        assert_eq!(sync.read_persisted(&stream).unwrap(), b"epoch 1\nfinal acc 0.93");
        // Replaying the whole stream adds nothing.
        let n = sync
            .sync_final(&stream, 0, &split_lines(b"epoch 1\nfinal acc 0.93"))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn total_loss_resumes_from_zero() {
        let (_dir, sync, stream) = setup();
        sync.sync(&stream, 0, &split_lines(b"a\nb\n")).unwrap();
        std::fs::remove_dir_all(sync.machine_dir("otter")).unwrap();
        assert_eq!(sync.persisted_offset(&stream).unwrap(), 0);
        sync.sync(&stream, 0, &split_lines(b"a\nb\nc\n")).unwrap();
        assert_eq!(sync.read_persisted(&stream).unwrap(), b"a\nb\nc\n");
    }

    #[test]
    fn read_tail_limits_bytes() {
        let (_dir, sync, stream) = setup();
        sync.sync(&stream, 0, &split_lines(b"0123456789\n")).unwrap();
        assert_eq!(sync.read_tail(&stream, 4).unwrap(), b"789\n");
        let missing = StreamId::new("nobody", StreamKind::Setup);
        assert!(sync.read_tail(&missing, 4).unwrap().is_empty());
    }
}
