// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};

use crate::registry::{FileId, Fingerprint};

/// One complete line, or one piece of a line that exceeded the size limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Payload without the terminator
    pub payload: Bytes,
    /// Bytes of the file this line covers, terminator included
    pub range: Range<u64>,
    pub terminated: bool,
}

#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub lines: Vec<Line>,
    /// True when the read reached the current end of the file
    pub eof: bool,
}

/// Incremental line reader over an open file handle.
///
/// The reader tracks two positions: `position`, the next byte to read from
/// the file, and `line_start`, the start of the partial line still held in
/// memory. Everything before `line_start` has been handed out as lines.
pub struct LineReader {
    path: PathBuf,
    file: File,
    identity: FileId,
    position: u64,
    line_start: u64,
    pending: BytesMut,
    buf: Vec<u8>,
    max_line_bytes: usize,
}

impl LineReader {
    pub fn open(
        path: impl AsRef<Path>,
        read_buffer_bytes: usize,
        max_line_bytes: usize,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let identity = FileId::from_file(&file)?;

        Ok(Self {
            path,
            file,
            identity,
            position: 0,
            line_start: 0,
            pending: BytesMut::new(),
            buf: vec![0; read_buffer_bytes.max(1)],
            max_line_bytes: max_line_bytes.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> FileId {
        self.identity
    }

    /// Offset just past the last line handed out.
    pub fn line_start(&self) -> u64 {
        self.line_start
    }

    /// Next byte that will be read from the file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes of an unfinished line held in memory.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Restart reading at `offset`, forgetting any partial line.
    pub fn seek(&mut self, offset: u64) {
        self.position = offset;
        self.line_start = offset;
        self.pending.clear();
    }

    /// Leading bytes of the open file. Does not move the read position.
    pub fn fingerprint(&self) -> io::Result<Fingerprint> {
        Fingerprint::read(&self.file)
    }

    /// Current size of the open handle, which keeps following the same
    /// file after a rename.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Read up to one buffer of new bytes and split off every line it
    /// completes.
    pub fn read_lines(&mut self) -> io::Result<ReadOutcome> {
        let n = loop {
            match self.file.read_at(&mut self.buf, self.position) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        self.position += n as u64;
        self.pending.extend_from_slice(&self.buf[..n]);

        let mut lines = Vec::new();
        while let Some(line) = self.split_line() {
            lines.push(line);
        }

        Ok(ReadOutcome {
            lines,
            eof: n < self.buf.len(),
        })
    }

    fn split_line(&mut self) -> Option<Line> {
        let max = self.max_line_bytes;

        let (consumed, len, terminated) = match self.pending.iter().position(|b| *b == b'\n') {
            Some(nl) => {
                let len = if nl > 0 && self.pending[nl - 1] == b'\r' {
                    nl - 1
                } else {
                    nl
                };
                if len <= max {
                    (nl + 1, len, true)
                } else {
                    (max, max, false)
                }
            }
            None if self.pending.len() > max => (max, max, false),
            None => return None,
        };

        let mut chunk = self.pending.split_to(consumed);
        chunk.truncate(len);

        let start = self.line_start;
        self.line_start += consumed as u64;

        Some(Line {
            payload: chunk.freeze(),
            range: start..self.line_start,
            terminated,
        })
    }
}
