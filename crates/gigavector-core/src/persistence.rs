//! Magic-tagged snapshot framing shared by every persistable component
//! (spec.md §4.15/§6).
//!
//! Each component's on-disk format is `4B magic | u32 version | body`.
//! `load` verifies both fields before handing the body to the caller.
//! Save/load require the component to be quiescent (no concurrent writers)
//! — callers are responsible for that invariant, matching
//! `VectorStore`/`PointIDMap`'s own persistence methods.

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Wraps `body` with `magic` (exactly 4 bytes) and `version`, and writes
/// the result to `path`. Not atomic: a partial write on failure leaves an
/// unreadable file, per spec.md §4.15 — callers needing atomic replace
/// must write to a temp path and rename into place themselves.
///
/// # Errors
///
/// `Io` on any filesystem failure; `InvalidArgument` if `magic.len() != 4`.
pub fn save(path: &Path, magic: &[u8; 4], version: u32, body: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(8 + body.len());
    buf.extend_from_slice(magic);
    buf.extend_from_slice(&version.to_be_bytes());
    buf.extend_from_slice(body);
    fs::write(path, buf)?;
    Ok(())
}

/// Reads `path`, verifies `magic` and that the stored version is
/// `<= max_supported_version`, and returns the body bytes following the
/// 8-byte header.
///
/// # Errors
///
/// `Io` if the file can't be read; `Protocol` if the file is shorter than
/// the header, the magic doesn't match, or the version exceeds what this
/// build supports.
pub fn load(path: &Path, magic: &[u8; 4], max_supported_version: u32) -> Result<Vec<u8>> {
    let buf = fs::read(path)?;
    if buf.len() < 8 {
        return Err(Error::Protocol(format!(
            "snapshot {} shorter than an 8-byte header",
            path.display()
        )));
    }
    if &buf[0..4] != magic {
        return Err(Error::Protocol(format!(
            "snapshot {} has wrong magic: expected {:?}, got {:?}",
            path.display(),
            magic,
            &buf[0..4]
        )));
    }
    let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version > max_supported_version {
        return Err(Error::Protocol(format!(
            "snapshot {} has version {version}, this build supports up to {max_supported_version}",
            path.display()
        )));
    }
    Ok(buf[8..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips_body() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        save(&path, b"TEST", 1, &[1, 2, 3, 4]).unwrap();
        let body = load(&path, b"TEST", 1).unwrap();
        assert_eq!(body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        save(&path, b"TEST", 1, &[]).unwrap();
        assert!(matches!(load(&path, b"NOPE", 1), Err(Error::Protocol(_))));
    }

    #[test]
    fn future_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        save(&path, b"TEST", 2, &[]).unwrap();
        assert!(matches!(load(&path, b"TEST", 1), Err(Error::Protocol(_))));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        fs::write(&path, [1, 2, 3]).unwrap();
        assert!(matches!(load(&path, b"TEST", 1), Err(Error::Protocol(_))));
    }
}
