//! File utilities shared by the spool, transfer and delivery layers.

use anyhow::{anyhow, Context, Result};
use async_recursion::async_recursion;
use std::os::unix::fs::PermissionsExt;

/// Mode for directories the daemon creates (delivery dirs, spool slots).
pub const DIR_MODE: u32 = 0o775;

/// Byte-exact single-file copy preserving the source mode.
pub async fn copy_file(src: &std::path::Path, dst: &std::path::Path) -> Result<u64> {
    let mut reader = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {src:?} for reading"))?;
    let mut buf_reader = tokio::io::BufReader::with_capacity(1 << 18, &mut reader);
    let mut writer = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("cannot open {dst:?} for writing"))?;
    let bytes = tokio::io::copy_buf(&mut buf_reader, &mut writer)
        .await
        .with_context(|| format!("failed copying data to {dst:?}"))?;
    let metadata = reader
        .metadata()
        .await
        .with_context(|| format!("failed reading metadata from {src:?}"))?;
    writer
        .set_permissions(metadata.permissions())
        .await
        .with_context(|| format!("cannot set permissions on {dst:?}"))?;
    Ok(bytes)
}

/// Recursive copy of a file, directory tree or symlink, preserving modes
/// and symlinks.
#[async_recursion]
pub async fn copy_any(src: &std::path::Path, dst: &std::path::Path) -> Result<u64> {
    let src_metadata = tokio::fs::symlink_metadata(src)
        .await
        .with_context(|| format!("failed reading metadata from {src:?}"))?;
    if src_metadata.is_file() {
        return copy_file(src, dst).await;
    }
    if src_metadata.is_symlink() {
        let link = tokio::fs::read_link(src)
            .await
            .with_context(|| format!("failed reading symlink {src:?}"))?;
        tokio::fs::symlink(link, dst)
            .await
            .with_context(|| format!("failed creating symlink {dst:?}"))?;
        return Ok(0);
    }
    tokio::fs::create_dir(dst)
        .await
        .with_context(|| format!("cannot create directory {dst:?}"))?;
    let mut entries = tokio::fs::read_dir(src)
        .await
        .with_context(|| format!("cannot open directory {src:?} for reading"))?;
    let mut bytes = 0u64;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {src:?}"))?
    {
        let entry_path = entry.path();
        let name = entry_path.file_name().unwrap();
        bytes += copy_any(&entry_path, &dst.join(name)).await?;
    }
    tokio::fs::set_permissions(dst, src_metadata.permissions())
        .await
        .with_context(|| format!("cannot set permissions on {dst:?}"))?;
    Ok(bytes)
}

/// Copy with a bounded retry budget, unlinking the partial target between
/// attempts.
pub async fn copy_with_retries(
    src: &std::path::Path,
    dst: &std::path::Path,
    max_tries: u32,
) -> Result<u64> {
    let mut last_err = None;
    for attempt in 1..=max_tries {
        match copy_any(src, dst).await {
            Ok(n) => return Ok(n),
            Err(e) => {
                tracing::warn!("ERROR[{}]: failed copy to {:?}: {:#}", attempt, dst, e);
                let _ = remove_any(dst).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("copy to {dst:?} failed")))
}

/// Delete a file, symlink or directory tree.
pub async fn remove_any(path: &std::path::Path) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("cannot stat {path:?}")),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("cannot remove directory {path:?}"))
    } else {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("cannot remove {path:?}"))
    }
}

/// Disk usage of a file or tree, in bytes. Works for directories too, as
/// transfer sizing needs.
#[async_recursion]
pub async fn disk_usage(path: &std::path::Path) -> Result<u64> {
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("cannot stat {path:?}"))?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut total = 0u64;
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot read directory {path:?}"))?;
    while let Some(entry) = entries.next_entry().await? {
        total += disk_usage(&entry.path()).await?;
    }
    Ok(total)
}

/// Free bytes on the filesystem holding `path`.
pub fn disk_free(path: &std::path::Path) -> Result<u64> {
    let vfs = nix::sys::statvfs::statvfs(path)
        .with_context(|| format!("statvfs failed for {path:?}"))?;
    Ok(vfs.blocks_available() as u64 * vfs.fragment_size() as u64)
}

/// Total bytes on the filesystem holding `path`.
pub fn disk_total(path: &std::path::Path) -> Result<u64> {
    let vfs = nix::sys::statvfs::statvfs(path)
        .with_context(|| format!("statvfs failed for {path:?}"))?;
    Ok(vfs.blocks() as u64 * vfs.fragment_size() as u64)
}

/// Verify the delivery directory exists (optionally creating it), is a
/// directory, and is writable via a `.test` probe file.
pub async fn test_delivery_dir(dpath: &std::path::Path, create: bool) -> Result<()> {
    match tokio::fs::metadata(dpath).await {
        Ok(md) => {
            if !md.is_dir() {
                return Err(anyhow!("deliveryDir: {dpath:?} not a directory"));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if !create {
                return Err(anyhow!("deliveryDir: {dpath:?} doesn't exist"));
            }
            tokio::fs::create_dir_all(dpath)
                .await
                .with_context(|| format!("deliveryDir: cannot create {dpath:?}"))?;
            tokio::fs::set_permissions(dpath, std::fs::Permissions::from_mode(DIR_MODE)).await?;
        }
        Err(e) => return Err(e).with_context(|| format!("deliveryDir: cannot stat {dpath:?}")),
    }
    let probe = dpath.join(".test");
    tokio::fs::write(&probe, b"")
        .await
        .with_context(|| format!("deliveryDir: cannot write to directory {dpath:?}"))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

/// Numbered subdirectories (`NNNN`) of a spool queue directory, in
/// ascending order.
pub async fn numbered_subdirs(dir: &std::path::Path) -> Result<Vec<(u32, std::path::PathBuf)>> {
    let mut slots = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(slots),
        Err(e) => return Err(e).with_context(|| format!("cannot read spool dir {dir:?}")),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(n) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u32>().ok())
        {
            slots.push((n, path));
        }
    }
    slots.sort_by_key(|(n, _)| *n);
    Ok(slots)
}

/// Allocate the next numbered spool slot under `dir`, creating it.
pub async fn alloc_spool_slot(dir: &std::path::Path) -> Result<(u32, std::path::PathBuf)> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create spool dir {dir:?}"))?;
    let next = numbered_subdirs(dir)
        .await?
        .last()
        .map(|(n, _)| n + 1)
        .unwrap_or(0);
    let slot = dir.join(format!("{next:04}"));
    tokio::fs::create_dir(&slot)
        .await
        .with_context(|| format!("cannot create spool slot {slot:?}"))?;
    tokio::fs::set_permissions(&slot, std::fs::Permissions::from_mode(DIR_MODE)).await?;
    Ok((next, slot))
}

/// Pre-allocate a file to its final size so stripes can write their own
/// regions.
pub async fn prealloc(path: &std::path::Path, size: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("cannot open {path:?} for preallocation"))?;
    file.set_len(size)
        .await
        .with_context(|| format!("cannot preallocate {path:?} to {size} bytes"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_preserves_bytes_and_mode() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("a.dat");
        tokio::fs::write(&src, b"payload").await?;
        tokio::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o640)).await?;
        let dst = tmp.path().join("b.dat");
        let n = copy_file(&src, &dst).await?;
        assert_eq!(n, 7);
        assert_eq!(tokio::fs::read(&dst).await?, b"payload");
        let mode = tokio::fs::metadata(&dst).await?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
        Ok(())
    }

    #[tokio::test]
    async fn copy_any_handles_trees_and_symlinks() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("tree");
        tokio::fs::create_dir_all(src.join("sub")).await?;
        tokio::fs::write(src.join("f1"), b"1").await?;
        tokio::fs::write(src.join("sub/f2"), b"22").await?;
        tokio::fs::symlink("f1", src.join("link")).await?;
        let dst = tmp.path().join("copy");
        copy_any(&src, &dst).await?;
        assert_eq!(tokio::fs::read(dst.join("f1")).await?, b"1");
        assert_eq!(tokio::fs::read(dst.join("sub/f2")).await?, b"22");
        let link = tokio::fs::read_link(dst.join("link")).await?;
        assert_eq!(link, std::path::PathBuf::from("f1"));
        Ok(())
    }

    #[tokio::test]
    async fn spool_slots_are_sequential() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let qdir = tmp.path().join("spool/sci");
        let (n0, p0) = alloc_spool_slot(&qdir).await?;
        let (n1, p1) = alloc_spool_slot(&qdir).await?;
        assert_eq!((n0, n1), (0, 1));
        assert_eq!(p0.file_name().unwrap(), "0000");
        assert_eq!(p1.file_name().unwrap(), "0001");
        assert_eq!(numbered_subdirs(&qdir).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn delivery_dir_probe() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("dlvr");
        test_delivery_dir(&dir, true).await?;
        assert!(dir.is_dir());
        // a plain file in place of the directory is rejected
        let f = tmp.path().join("plain");
        tokio::fs::write(&f, b"").await?;
        assert!(test_delivery_dir(&f, true).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn du_counts_trees() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let d = tmp.path().join("t");
        tokio::fs::create_dir_all(d.join("s")).await?;
        tokio::fs::write(d.join("a"), [0u8; 100]).await?;
        tokio::fs::write(d.join("s/b"), [0u8; 50]).await?;
        assert_eq!(disk_usage(&d).await?, 150);
        Ok(())
    }

    #[tokio::test]
    async fn prealloc_sets_length() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let p = tmp.path().join("big");
        prealloc(&p, 1 << 20).await?;
        assert_eq!(tokio::fs::metadata(&p).await?.len(), 1 << 20);
        Ok(())
    }
}
