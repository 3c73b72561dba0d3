#![allow(dead_code)]

//! Helpers shared by unit and integration tests.

use anyhow::Result;

async fn create_temp_dir() -> Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("dts_test{}_{}", std::process::id(), idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

/// Create a sandbox-root layout (`spool/`, `copy/`, `logs/`) under a fresh
/// temp directory.
pub async fn setup_sandbox_root() -> Result<std::path::PathBuf> {
    let root = create_temp_dir().await?;
    for sub in ["spool", "copy", "logs"] {
        tokio::fs::create_dir_all(root.join(sub)).await?;
    }
    Ok(root)
}

/// Write a deterministic payload of `size` bytes.
pub async fn write_payload(path: &std::path::Path, size: usize) -> Result<Vec<u8>> {
    let data: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
    tokio::fs::write(path, &data).await?;
    Ok(data)
}
