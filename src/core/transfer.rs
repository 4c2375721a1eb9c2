//! 文件复制：先写临时文件，保留修改时间后再原子重命名

use crate::error::{SyncError, SyncResult};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

/// 大缓冲区（1 MiB）
pub const LARGE_BUFFER_SIZE: usize = 1024 * 1024;
/// 默认缓冲区（64 KiB）
pub const SMALL_BUFFER_SIZE: usize = 64 * 1024;

/// 目标已存在时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// 目标已存在则失败
    CreateNew,
    /// 覆盖目标
    Overwrite,
}

/// 临时文件路径：与目标同目录，`.<name>.flashsync-tmp`
fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.flashsync-tmp", name))
}

/// 复制单个文件，返回复制的字节数
///
/// 目标的修改时间设置为与源一致，这样下一次同步时不会再次判定为需要更新。
pub async fn copy_file(
    source: &Path,
    dest: &Path,
    mode: CopyMode,
    buffer_size: usize,
) -> SyncResult<u64> {
    if mode == CopyMode::CreateNew
        && fs::try_exists(dest)
            .await
            .map_err(|e| SyncError::io(dest, e))?
    {
        return Err(SyncError::io(
            dest,
            io::Error::new(io::ErrorKind::AlreadyExists, "目标文件已存在"),
        ));
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent, e))?;
    }

    let src_file = fs::File::open(source)
        .await
        .map_err(|e| SyncError::io(source, e))?;
    let modified = src_file
        .metadata()
        .await
        .and_then(|m| m.modified())
        .map_err(|e| SyncError::io(source, e))?;

    let temp_path = temp_path_for(dest);
    // 任何一步失败都删除临时文件
    let temp_guard = scopeguard::guard(temp_path.clone(), |p| {
        let _ = std::fs::remove_file(p);
    });

    let temp_file = fs::File::create(&temp_path)
        .await
        .map_err(|e| SyncError::io(&temp_path, e))?;

    let mut reader = BufReader::with_capacity(buffer_size, src_file);
    let mut writer = BufWriter::with_capacity(buffer_size, temp_file);
    let bytes = tokio::io::copy_buf(&mut reader, &mut writer)
        .await
        .map_err(|e| SyncError::io(source, e))?;
    writer.flush().await.map_err(|e| SyncError::io(&temp_path, e))?;

    let temp_file = writer.into_inner();
    temp_file
        .sync_all()
        .await
        .map_err(|e| SyncError::io(&temp_path, e))?;

    let std_file = temp_file.into_std().await;
    tokio::task::spawn_blocking(move || std_file.set_modified(modified))
        .await
        .map_err(|e| SyncError::io(&temp_path, io::Error::other(e)))?
        .map_err(|e| SyncError::io(&temp_path, e))?;

    fs::rename(&temp_path, dest)
        .await
        .map_err(|e| SyncError::io(dest, e))?;
    scopeguard::ScopeGuard::into_inner(temp_guard);

    debug!("复制完成: {:?} -> {:?} ({}字节)", source, dest, bytes);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[tokio::test]
    async fn test_copy_preserves_content_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("nested/deeper/dst.txt");
        std::fs::write(&src, b"flash drive contents").unwrap();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_650_000_000);
        std::fs::File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(t)
            .unwrap();

        let bytes = copy_file(&src, &dst, CopyMode::CreateNew, SMALL_BUFFER_SIZE)
            .await
            .unwrap();

        assert_eq!(bytes, 20);
        assert_eq!(std::fs::read(&dst).unwrap(), b"flash drive contents");
        assert_eq!(std::fs::metadata(&dst).unwrap().modified().unwrap(), t);
        assert!(!temp_path_for(&dst).exists());
    }

    #[tokio::test]
    async fn test_create_new_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old").unwrap();

        let err = copy_file(&src, &dst, CopyMode::CreateNew, SMALL_BUFFER_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::IoAccess { .. }));
        assert_eq!(std::fs::read(&dst).unwrap(), b"old");

        copy_file(&src, &dst, CopyMode::Overwrite, LARGE_BUFFER_SIZE)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_missing_source_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.txt");
        let result = copy_file(
            &dir.path().join("missing.txt"),
            &dst,
            CopyMode::Overwrite,
            SMALL_BUFFER_SIZE,
        )
        .await;

        assert!(result.is_err());
        assert!(!dst.exists());
        assert!(!temp_path_for(&dst).exists());
    }
}
