//! Everything related to reading new lines out of a watched file.

use std::fmt;
use std::io::{self, SeekFrom};
use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs::{metadata, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::splitter::LineSplitter;

/// Identifies the file behind a path, so a replaced file is told apart
/// from a grown one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn of(meta: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;

        Some(FileId {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_meta: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

/// What changed in a file since the last read.
#[derive(Debug, PartialEq)]
pub(crate) enum Delta {
    /// Nothing new.
    Unchanged,
    /// New complete lines were appended.
    Appended(Vec<Bytes>),
    /// The file was truncated or replaced; reading restarted at offset 0.
    Reset {
        /// Unterminated line left over from the old content.
        flushed: Option<Bytes>,
        lines: Vec<Bytes>,
    },
    /// The path no longer exists.
    Gone { flushed: Option<Bytes> },
}

/// Read position and line state of one tailed file.
pub(crate) struct Tail {
    path: PathBuf,
    offset: u64,
    id: Option<FileId>,
    splitter: LineSplitter,
}

impl fmt::Debug for Tail {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Tail")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("partial", &self.splitter.partial().len())
            .finish()
    }
}

impl Tail {
    /// Opens `path` positioned `seek_back` bytes before its end, returning
    /// the complete lines found between there and the end.
    ///
    /// A file shorter than `seek_back` is read from the start. When the
    /// start position falls inside a line, that line's head is skipped.
    pub async fn open(
        path: impl Into<PathBuf>,
        seek_back: u64,
        max_line_size: usize,
    ) -> io::Result<(Self, Vec<Bytes>)> {
        let path = path.into();
        let mut file = File::open(&path).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(not_a_file());
        }

        let start = meta.len().saturating_sub(seek_back);
        // Read one byte early to learn whether `start` is a line boundary.
        let read_from = start.saturating_sub(1);
        let buf = read_from_offset(&mut file, read_from).await?;

        let skip = if start == 0 {
            0
        } else {
            match buf.first() {
                Some(b'\n') | None => 1,
                Some(_) => match memchr::memchr(b'\n', &buf[1..]) {
                    Some(idx) => idx + 2,
                    None => 1,
                },
            }
        };

        let mut tail = Tail {
            offset: read_from + buf.len() as u64,
            id: FileId::of(&meta),
            splitter: LineSplitter::new(max_line_size),
            path,
        };
        let lines = tail.splitter.split(&buf[skip.min(buf.len())..]).collect();

        Ok((tail, lines))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Re-stats the file and reads whatever was appended since last time.
    pub async fn read_new(&mut self) -> io::Result<Delta> {
        let meta = match metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(self.gone()),
            Err(e) => return Err(e),
        };
        if !meta.is_file() {
            return Err(not_a_file());
        }

        let id = FileId::of(&meta);
        let size = meta.len();

        let replaced = match (self.id, id) {
            (Some(old), Some(new)) => old != new,
            _ => false,
        };

        if replaced || size < self.offset {
            // rolled
            let flushed = self.splitter.flush();
            self.offset = 0;
            self.id = id;

            let lines = match self.read_available().await {
                Ok(lines) => lines,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(Delta::Gone { flushed })
                }
                Err(e) => return Err(e),
            };

            return Ok(Delta::Reset { flushed, lines });
        }

        if size == self.offset {
            return Ok(Delta::Unchanged);
        }

        match self.read_available().await {
            Ok(lines) => Ok(Delta::Appended(lines)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(self.gone()),
            Err(e) => Err(e),
        }
    }

    fn gone(&mut self) -> Delta {
        Delta::Gone {
            flushed: self.splitter.flush(),
        }
    }

    async fn read_available(&mut self) -> io::Result<Vec<Bytes>> {
        let mut file = File::open(&self.path).await?;
        let buf = read_from_offset(&mut file, self.offset).await?;
        self.offset += buf.len() as u64;

        Ok(self.splitter.split(&buf).collect())
    }
}

fn not_a_file() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "not a regular file")
}

async fn read_from_offset(file: &mut File, offset: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    Ok(buf)
}
