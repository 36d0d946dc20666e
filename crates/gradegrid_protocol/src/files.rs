//! Directory crawling and file materialization.
//!
//! Files travel as `(relative path, base64 payload)` pairs. The crawler
//! walks a directory tree in a deterministic order; materialization writes
//! payloads under a root and refuses paths that would escape it.

use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use walkdir::WalkDir;

use crate::error::{ProtocolError, Result};

/// One file on the wire: path relative to the assignment root, base64 data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub path: String,
    pub data: String,
}

impl FilePayload {
    pub fn from_bytes(path: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            path: path.into(),
            data: BASE64.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.data)
            .map_err(|e| ProtocolError::Protocol(format!("bad base64 for '{}': {e}", self.path)))
    }
}

/// Encode arbitrary bytes with the wire's base64 alphabet.
pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a wire base64 string.
pub fn decode_str(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| ProtocolError::Protocol(format!("bad base64 payload: {e}")))
}

/// Read every regular file under `root` into payloads, paths relative to
/// `root` with `/` separators, sorted by file name for a stable listing.
pub fn collect_dir(root: &Path) -> Result<Vec<FilePayload>> {
    let mut listing = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            ProtocolError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walk failed on a loop")
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root");
        let bytes = std::fs::read(entry.path())?;
        listing.push(FilePayload::from_bytes(unix_path(relative), &bytes));
    }
    Ok(listing)
}

/// Decode and write every payload under `root`, creating parent
/// directories as needed.
pub fn materialize(root: &Path, listing: &[FilePayload]) -> Result<()> {
    for payload in listing {
        let relative = safe_relative_path(&payload.path)?;
        let target = root.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, payload.decode()?)?;
    }
    Ok(())
}

/// Read a file into lines, preserving order; only the line terminator is
/// removed.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().map(str::to_string).collect())
}

/// Basename with the final extension removed: `alice.txt` -> `alice`.
pub fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

fn unix_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn safe_relative_path(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ProtocolError::Protocol(format!(
                    "file path escapes the working directory: {raw}"
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ProtocolError::Protocol("empty file path".to_string()));
    }
    Ok(clean)
}
