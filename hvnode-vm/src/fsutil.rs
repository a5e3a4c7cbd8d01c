//! Blocking filesystem helpers shared by the image cache and staging code

use hvnode_core::{HvnodeError, HvnodeResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

const HASH_BUFFER_SIZE: usize = 128 * 1024;

/// Run blocking filesystem work off the async executor.
pub(crate) async fn blocking<T, F>(work: F) -> HvnodeResult<T>
where
    F: FnOnce() -> HvnodeResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| HvnodeError::Internal {
            message: format!("Blocking task failed: {}", e),
        })?
}

/// SHA-256 of a file's contents as lowercase hex.
pub(crate) fn sha256_file(path: &Path) -> HvnodeResult<String> {
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write `data` to `target` through a sibling temporary file and a rename.
///
/// Readers see either the previous contents or the new ones.
pub(crate) fn write_atomically(target: &Path, data: &[u8]) -> HvnodeResult<()> {
    let dir = parent_dir(target)?;
    std::fs::create_dir_all(dir)?;
    let mut scratch = tempfile::NamedTempFile::new_in(dir)?;
    scratch.write_all(data)?;
    scratch.as_file().sync_all()?;
    scratch.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Copy `source` to `target` through a sibling temporary file and a rename.
pub(crate) fn copy_atomically(source: &Path, target: &Path) -> HvnodeResult<u64> {
    let dir = parent_dir(target)?;
    std::fs::create_dir_all(dir)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, File::open(source)?);
    let mut scratch = tempfile::NamedTempFile::new_in(dir)?;
    let copied = std::io::copy(&mut reader, scratch.as_file_mut())?;
    scratch.as_file().sync_all()?;
    scratch.persist(target).map_err(|e| e.error)?;
    Ok(copied)
}

fn parent_dir(path: &Path) -> HvnodeResult<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| HvnodeError::Internal {
            message: format!("{} has no parent directory", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_write_atomically_replaces_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("file");
        write_atomically(&path, b"one").unwrap();
        write_atomically(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_copy_atomically() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        std::fs::write(&source, b"payload").unwrap();
        assert_eq!(copy_atomically(&source, &target).unwrap(), 7);
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    }
}
