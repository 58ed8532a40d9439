//! Wire protocol: length-prefixed bincode frames over the local socket.
//!
//! Every frame is a little-endian `u32` byte count followed by a
//! bincode-encoded [`Message`]. A response stream is a sequence of
//! `Response` frames terminated by a zero-length frame.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;

/// Largest frame a peer may send; anything bigger is a protocol error.
pub const MAX_FRAME: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectKind {
    /// A compile list: one `source|arg|arg...` line per translation unit.
    Makefile,
    /// A plain source tree; invocations are synthesized per file.
    Dir,
    /// Like `Dir`, with extra compiler flags supplied by the client.
    Smart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMessage {
    pub kind: ProjectKind,
    pub path: PathBuf,
    pub args: Vec<String>,
    pub extra_flags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    FollowLocation,
    ReferencesLocation,
    ReferencesName,
    ListSymbols,
    FindSymbols,
    FindFile,
    CursorInfo,
    Status,
    IsIndexed,
    HasFileManager,
    PreprocessFile,
    Reindex,
    FixIts,
    Errors,
    DumpFile,
    Project,
    DeleteProject,
    UnloadProject,
    ReloadProjects,
    ClearProjects,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMessage {
    pub kind: QueryKind,
    /// Free-form query payload: a name, a pattern, or a path.
    pub query: String,
    pub flags: u32,
    /// `path,offset` for location queries.
    pub location: Option<String>,
}

impl QueryMessage {
    pub const FLAG_REGEXP: u32 = 1 << 0;

    pub fn new(kind: QueryKind, query: impl Into<String>) -> Self {
        Self {
            kind,
            query: query.into(),
            flags: 0,
            location: None,
        }
    }

    pub fn with_location(kind: QueryKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            query: String::new(),
            flags: 0,
            location: Some(location.into()),
        }
    }

    pub fn match_regexp(&self) -> bool {
        self.flags & Self::FLAG_REGEXP != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Project(ProjectMessage),
    Query(QueryMessage),
    /// Subscribe the client to the daemon's log stream at `level`.
    CreateOutput { level: u32 },
    Response(ResponseMessage),
}

/// Write one framed message.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> std::io::Result<()> {
    let payload = bincode::serialize(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Write the zero-length frame that terminates a response stream.
pub fn write_end<W: Write>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(&0u32.to_le_bytes())?;
    writer.flush()
}

/// Read one framed message; `Ok(None)` is the stream terminator.
pub fn read_message<R: Read>(reader: &mut R) -> std::io::Result<Option<Message>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    let message = bincode::deserialize(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(message))
}
