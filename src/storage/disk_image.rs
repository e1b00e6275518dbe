use crate::core::{Result, StoreError};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const QCOW2_MAGIC: [u8; 4] = *b"QFI\xfb";
const QCOW2_SIZE_OFFSET: usize = 24;
const QCOW2_HEADER_PROBE: usize = 32;

/// Virtual size of a disk artifact: the qcow2 header's size field when the
/// file carries the qcow2 magic, otherwise the file length.
pub async fn virtual_size(path: &Path) -> Result<u64> {
    let mut file = File::open(path)
        .await
        .map_err(|e| StoreError::io(format!("open artifact '{}'", path.display()), e))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| StoreError::io(format!("stat artifact '{}'", path.display()), e))?
        .len();

    let mut header = [0u8; QCOW2_HEADER_PROBE];
    let mut filled = 0;
    while filled < header.len() {
        let n = file
            .read(&mut header[filled..])
            .await
            .map_err(|e| StoreError::io(format!("read artifact '{}'", path.display()), e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled >= 4 && header[..4] == QCOW2_MAGIC {
        if filled < QCOW2_HEADER_PROBE {
            return Err(StoreError::Corrupted {
                path: path.to_path_buf(),
                reason: "truncated qcow2 header".to_string(),
            });
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&header[QCOW2_SIZE_OFFSET..QCOW2_SIZE_OFFSET + 8]);
        return Ok(u64::from_be_bytes(size));
    }
    Ok(len)
}

/// Minimal qcow2 v3 header claiming `size` bytes. Enough for size probing.
pub fn qcow2_header(size: u64) -> Vec<u8> {
    let mut header = vec![0u8; 104];
    header[..4].copy_from_slice(&QCOW2_MAGIC);
    header[4..8].copy_from_slice(&3u32.to_be_bytes());
    header[20..24].copy_from_slice(&16u32.to_be_bytes());
    header[QCOW2_SIZE_OFFSET..QCOW2_SIZE_OFFSET + 8].copy_from_slice(&size.to_be_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_qcow2_virtual_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vol.qcow2");
        std::fs::write(&path, qcow2_header(5 * 1024 * 1024 * 1024)).unwrap();
        assert_eq!(virtual_size(&path).await.unwrap(), 5 * 1024 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_raw_size_is_file_length() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vol.raw");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        assert_eq!(virtual_size(&path).await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn test_truncated_qcow2_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vol.qcow2");
        std::fs::write(&path, b"QFI\xfb\x00\x00").unwrap();
        assert!(matches!(
            virtual_size(&path).await,
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let err = virtual_size(&temp_dir.path().join("nope.qcow2")).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
