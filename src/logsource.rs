//! Incremental log file reading
//!
//! A [`LogSource`] follows one path across appends, truncation and
//! rename-and-recreate rotation. Each read reopens the path, compares the
//! underlying file identity with the one being tracked and either resumes
//! at the stored offset or starts the new file from the beginning.
//!
//! The file being read stays open between reads, so a deleted file's inode
//! cannot be handed to its replacement while it is tracked. A copy of the
//! first line is kept as well: when the file at the same inode no longer
//! starts with it, the file was rewritten in place and is read from the
//! beginning.
//!
//! Lines appended to the old file between the last read and its rotation
//! are not read. A file rewritten in place with an identical first line and
//! grown past the old offset is not detected. Both are accepted boundaries.

use std::fs::{self, File, Metadata};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};

/// Upper bound on the first-line fingerprint
const HEAD_LEN: u64 = 256;

/// First line of `file`, capped at [`HEAD_LEN`] bytes
fn read_head(file: &mut File) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut head = Vec::new();
    file.by_ref().take(HEAD_LEN).read_to_end(&mut head)?;
    if let Some(end) = head.iter().position(|b| *b == b'\n') {
        head.truncate(end + 1);
    }
    Ok(head)
}

/// Stable identity of the file behind a path (device + inode on unix)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(meta: &Metadata) -> Self {
        let created = meta
            .created()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self { dev: 0, ino: created }
    }
}

/// Size, modification time and identity as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Signature {
    size: u64,
    modified: Option<SystemTime>,
    id: FileId,
}

impl Signature {
    fn of(meta: &Metadata) -> Self {
        Self {
            size: meta.len(),
            modified: meta.modified().ok(),
            id: FileId::of(meta),
        }
    }
}

/// Reader position for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Never read
    Unopened,
    /// Reading `id` with `offset` bytes consumed
    Tracking { id: FileId, offset: u64 },
}

/// A named log file that may grow, rotate or be replaced
#[derive(Debug)]
pub struct LogSource {
    path: PathBuf,
    state: SourceState,
    /// Handle on the tracked file, pins its inode
    _pinned: Option<File>,
    /// Leading bytes of the tracked file as last read
    head: Vec<u8>,
    last_signature: Option<Signature>,
    rotations: u64,
}

impl LogSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: SourceState::Unopened,
            _pinned: None,
            head: Vec::new(),
            last_signature: None,
            rotations: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Bytes consumed from the currently tracked file
    pub fn offset(&self) -> u64 {
        match self.state {
            SourceState::Unopened => 0,
            SourceState::Tracking { offset, .. } => offset,
        }
    }

    /// Number of rotations or truncations detected so far
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// True when size, mtime or file identity differ from the last check,
    /// or the path now names a different file than the one being read.
    /// A missing file is reported as unmodified.
    pub fn is_modified(&mut self) -> io::Result<bool> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Log file does not exist: {}", self.path.display());
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let signature = Signature::of(&meta);
        let replaced = matches!(self.state, SourceState::Tracking { id, .. } if id != signature.id);
        if replaced {
            debug!("Log file {} now refers to a different file", self.path.display());
        }

        let changed = replaced || self.last_signature != Some(signature);
        self.last_signature = Some(signature);
        Ok(changed)
    }

    /// Lines appended since the last read. The iterator advances the stored
    /// offset as it is consumed; a trailing line without newline is left
    /// for a later call.
    pub fn read_new_lines(&mut self) -> io::Result<NewLines<'_>> {
        let mut file = File::open(&self.path)?;
        let meta = file.metadata()?;
        let id = FileId::of(&meta);
        let head = read_head(&mut file)?;

        let offset = match self.state {
            SourceState::Unopened => 0,
            SourceState::Tracking { id: old, offset }
                if old == id && meta.len() >= offset && head.starts_with(&self.head) =>
            {
                offset
            }
            SourceState::Tracking { id: old, .. } => {
                if old == id {
                    info!(
                        "Log file {} was truncated or rewritten, starting from beginning",
                        self.path.display()
                    );
                } else {
                    info!(
                        "Log file {} has been rotated, starting from beginning",
                        self.path.display()
                    );
                }
                self.rotations += 1;
                0
            }
        };
        self.state = SourceState::Tracking { id, offset };
        self.head = head;

        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(offset))?;
        // Dropping the previous handle only now keeps the old inode allocated
        // until the replacement is open
        self._pinned = Some(file);

        Ok(NewLines {
            reader,
            source: self,
            buf: Vec::new(),
        })
    }

    fn advance(&mut self, bytes: u64) {
        if let SourceState::Tracking { offset, .. } = &mut self.state {
            *offset += bytes;
        }
    }
}

/// One-shot iterator over newly appended lines
pub struct NewLines<'a> {
    reader: BufReader<File>,
    source: &'a mut LogSource,
    buf: Vec<u8>,
}

impl Iterator for NewLines<'_> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(n) => {
                if self.buf.last() != Some(&b'\n') {
                    // Incomplete line, leave it for the next read
                    return None;
                }
                self.source.advance(n as u64);
                let line = String::from_utf8_lossy(&self.buf);
                Some(Ok(line.trim_end_matches(['\n', '\r']).to_string()))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
