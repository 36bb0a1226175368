// Serving-directory file access.
//
// A FileSource is created per accepted read request and owned by that
// request's transfer for its whole life. It hands out the file as a
// sequence of 512-byte blocks; the first block shorter than 512 bytes is
// the end of the sequence, and every call after that returns an empty
// block. A file whose size is an exact multiple of 512 bytes therefore
// ends with a zero-length block, as does an empty file.

use crate::tftp::DATA_BUFFER_SIZE;
use std::error;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Represents a request that could not be turned into a readable file.
#[derive(Debug)]
pub enum OpenError {
    NotFound,
    Forbidden,
    Unreadable(io::Error),
}

impl error::Error for OpenError {}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpenError::NotFound => write!(f, "file not found"),
            OpenError::Forbidden => {
                write!(f, "path is outside the served directory or not a regular file")
            }
            OpenError::Unreadable(e) => write!(f, "file could not be opened: {e}"),
        }
    }
}

/// One requested file, confined to the served root, read front to back in
/// 512-byte blocks.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    path: PathBuf,
    finished: bool,
}

/// A requested name stays inside the served root when it is built purely
/// from ordinary path segments: no parent-directory hops, no absolute or
/// prefixed override of the root.
fn is_confined(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

impl FileSource {
    pub async fn open(root: &Path, requested: &str) -> Result<FileSource, OpenError> {
        if !is_confined(Path::new(requested)) {
            return Err(OpenError::Forbidden);
        }

        let path = root.join(requested);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(OpenError::NotFound),
            Err(e) => return Err(OpenError::Unreadable(e)),
        };

        if !metadata.is_file() {
            return Err(OpenError::Forbidden);
        }

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(OpenError::NotFound),
            Err(e) => return Err(OpenError::Unreadable(e)),
        };

        Ok(FileSource { file, path, finished: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next sequential block. Once the terminal short block
    /// has been handed out, every further call returns an empty block.
    pub async fn next_block(&mut self) -> Result<Vec<u8>, io::Error> {
        if self.finished {
            return Ok(Vec::new());
        }

        let block = read_block(&mut self.file).await?;
        if block.len() < DATA_BUFFER_SIZE {
            self.finished = true;
        }

        Ok(block)
    }
}

/// Reads up to one full block. A single call to read has no guarantee of
/// filling the buffer, so keep reading into the remainder until the block
/// is full or the file runs out.
async fn read_block(file: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; DATA_BUFFER_SIZE];
    let mut cursor = 0;

    loop {
        let read = file.read(&mut buf[cursor..]).await?;
        if read == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
        cursor += read;
        if cursor == buf.len() {
            return Ok(buf);
        }
    }
}
