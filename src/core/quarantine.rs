//! 隔离区管理
//!
//! 目标中多余的文件和大小不一致的旧文件不会被删除，而是移动到目标根目录下
//! 带时间戳的隔离目录中：
//!
//! - `<target>/!EXFILES/<yyyy-MM-dd_HH-mm-ss>/<filename>[_<n>]`
//! - `<target>/!EXSIZE/<yyyy-MM-dd_HH-mm-ss>/<filename>[_<n>]`
//!
//! 每次同步每种隔离区最多一个批次目录，只在确实需要时创建。

use crate::error::{SyncError, SyncResult};
use crate::models::CASE_INSENSITIVE_PATHS;
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

/// 多余文件隔离区
pub const ORPHAN_DIR_NAME: &str = "!EXFILES";
/// 大小不一致文件隔离区
pub const SIZE_MISMATCH_DIR_NAME: &str = "!EXSIZE";
/// 批次目录名格式
pub const BATCH_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// 扫描时始终排除的根目录名
pub const RESERVED_DIR_NAMES: [&str; 2] = [ORPHAN_DIR_NAME, SIZE_MISMATCH_DIR_NAME];

/// 是否为保留的隔离目录名（不区分大小写）
pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_DIR_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// 隔离类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineKind {
    Orphan,
    SizeMismatch,
}

impl QuarantineKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            QuarantineKind::Orphan => ORPHAN_DIR_NAME,
            QuarantineKind::SizeMismatch => SIZE_MISMATCH_DIR_NAME,
        }
    }
}

impl std::fmt::Display for QuarantineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// 在文件名的扩展名前追加 `_<n>`；`.bashrc` 这类以点开头的名字没有扩展名，得到 `.bashrc_1`
pub fn numbered_name(file_name: &str, n: u32) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}_{}", stem, n),
    }
}

fn name_key(name: &str) -> String {
    if CASE_INSENSITIVE_PATHS {
        name.to_lowercase()
    } else {
        name.to_string()
    }
}

/// 一次同步中某种隔离区的批次目录
///
/// 目录在第一次需要时创建且只创建一次；目标文件名在锁内预留，
/// 并发移动的文件不会选到同一个名字，也不会覆盖已隔离的文件。
#[derive(Debug)]
pub struct QuarantineBatch {
    kind: QuarantineKind,
    root: PathBuf,
    timestamp: String,
    dir: OnceCell<PathBuf>,
    reserved: Mutex<HashSet<String>>,
}

impl QuarantineBatch {
    pub fn new(kind: QuarantineKind, target_root: &Path, started_at: DateTime<Local>) -> Self {
        Self {
            kind,
            root: target_root.join(kind.dir_name()),
            timestamp: started_at.format(BATCH_TIMESTAMP_FORMAT).to_string(),
            dir: OnceCell::new(),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn kind(&self) -> QuarantineKind {
        self.kind
    }

    /// 批次目录（尚未创建时为 None）
    pub fn directory(&self) -> Option<&Path> {
        self.dir.get().map(PathBuf::as_path)
    }

    /// 确保批次目录存在，返回其路径
    pub async fn ensure_created(&self) -> SyncResult<&Path> {
        let dir = self
            .dir
            .get_or_try_init(|| self.create_batch_dir())
            .await?;
        Ok(dir.as_path())
    }

    async fn create_batch_dir(&self) -> SyncResult<PathBuf> {
        let creation_error = |path: &Path, source: io::Error| SyncError::QuarantineCreation {
            path: path.to_path_buf(),
            source,
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| creation_error(&self.root, e))?;

        // 同一秒内的另一次同步已经用了这个时间戳时，追加序号，批次从不复用
        let mut candidate = self.root.join(&self.timestamp);
        let mut n = 0u32;
        loop {
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    n += 1;
                    candidate = self.root.join(format!("{}_{}", self.timestamp, n));
                }
                Err(e) => return Err(creation_error(&candidate, e)),
            }
        }

        info!("已创建隔离目录: {:?}", candidate);
        Ok(candidate)
    }

    /// 在批次目录中为文件名预留一个未被占用的位置
    async fn reserve_destination(&self, dir: &Path, file_name: &str) -> SyncResult<PathBuf> {
        let mut reserved = self.reserved.lock().await;
        let mut name = file_name.to_string();
        let mut n = 0u32;
        loop {
            let candidate = dir.join(&name);
            let taken = reserved.contains(&name_key(&name))
                || tokio::fs::try_exists(&candidate)
                    .await
                    .map_err(|e| SyncError::io(&candidate, e))?;
            if !taken {
                reserved.insert(name_key(&name));
                return Ok(candidate);
            }
            n += 1;
            name = numbered_name(file_name, n);
        }
    }

    /// 把文件按文件名（不保留目录结构）移入批次目录，返回新位置
    pub async fn quarantine_file(&self, file: &Path) -> SyncResult<PathBuf> {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SyncError::io(file, io::Error::new(io::ErrorKind::InvalidInput, "无效的文件名"))
            })?;

        let dir = self.ensure_created().await?;
        let dest = self.reserve_destination(dir, &file_name).await?;

        tokio::fs::rename(file, &dest)
            .await
            .map_err(|e| SyncError::io(file, e))?;

        debug!("已隔离到 {}: {:?} -> {:?}", self.kind, file, dest);
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fixed_time() -> DateTime<Local> {
        DateTime::parse_from_rfc3339("2024-05-06T07:08:09+00:00")
            .unwrap()
            .with_timezone(&Local)
    }

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("report.txt", 1), "report_1.txt");
        assert_eq!(numbered_name("archive.tar.gz", 2), "archive.tar_2.gz");
        assert_eq!(numbered_name("README", 3), "README_3");
        // 以点开头的文件整体视为文件名
        assert_eq!(numbered_name(".bashrc", 1), ".bashrc_1");
        assert_eq!(numbered_name(".config.json", 1), ".config_1.json");
    }

    #[test]
    fn test_reserved_names_ignore_case() {
        assert!(is_reserved_name("!EXFILES"));
        assert!(is_reserved_name("!exsize"));
        assert!(!is_reserved_name("EXFILES"));
        assert!(!is_reserved_name("!EXFILES_old"));
    }

    #[tokio::test]
    async fn test_batch_not_created_until_needed() {
        let dir = tempfile::tempdir().unwrap();
        let batch = QuarantineBatch::new(QuarantineKind::Orphan, dir.path(), fixed_time());
        assert!(batch.directory().is_none());
        assert!(!dir.path().join(ORPHAN_DIR_NAME).exists());

        let created = batch.ensure_created().await.unwrap().to_path_buf();
        let expected_name = fixed_time().format(BATCH_TIMESTAMP_FORMAT).to_string();
        assert_eq!(created, dir.path().join(ORPHAN_DIR_NAME).join(&expected_name));
        assert!(created.is_dir());

        // 再次调用返回同一个目录
        assert_eq!(batch.ensure_created().await.unwrap(), created.as_path());
    }

    #[tokio::test]
    async fn test_batch_never_reuses_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let first = QuarantineBatch::new(QuarantineKind::SizeMismatch, dir.path(), fixed_time());
        let second = QuarantineBatch::new(QuarantineKind::SizeMismatch, dir.path(), fixed_time());

        let a = first.ensure_created().await.unwrap().to_path_buf();
        let b = second.ensure_created().await.unwrap().to_path_buf();
        assert_ne!(a, b);
        assert!(b.file_name().unwrap().to_string_lossy().ends_with("_1"));
    }

    #[tokio::test]
    async fn test_colliding_names_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path();
        for sub in ["one", "two", "three"] {
            std::fs::create_dir_all(target.join(sub)).unwrap();
            std::fs::write(target.join(sub).join("notes.txt"), sub).unwrap();
        }

        let batch = Arc::new(QuarantineBatch::new(QuarantineKind::Orphan, target, fixed_time()));
        let mut handles = Vec::new();
        for sub in ["one", "two", "three"] {
            let batch = batch.clone();
            let file = target.join(sub).join("notes.txt");
            handles.push(tokio::spawn(async move { batch.quarantine_file(&file).await }));
        }

        let mut moved: Vec<PathBuf> = Vec::new();
        for h in handles {
            moved.push(h.await.unwrap().unwrap());
        }
        moved.sort();
        moved.dedup();
        assert_eq!(moved.len(), 3);

        let batch_dir = batch.directory().unwrap();
        let mut contents: Vec<String> = ["notes.txt", "notes_1.txt", "notes_2.txt"]
            .iter()
            .map(|n| std::fs::read_to_string(batch_dir.join(n)).unwrap())
            .collect();
        contents.sort();
        assert_eq!(contents, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn test_existing_file_in_batch_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let batch = QuarantineBatch::new(QuarantineKind::Orphan, dir.path(), fixed_time());
        let batch_dir = batch.ensure_created().await.unwrap().to_path_buf();
        std::fs::write(batch_dir.join("a.txt"), "already here").unwrap();

        std::fs::write(dir.path().join("a.txt"), "incoming").unwrap();
        let dest = batch.quarantine_file(&dir.path().join("a.txt")).await.unwrap();

        assert_eq!(dest, batch_dir.join("a_1.txt"));
        assert_eq!(std::fs::read_to_string(batch_dir.join("a.txt")).unwrap(), "already here");
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "incoming");
    }

    #[tokio::test]
    async fn test_creation_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // 用普通文件占住隔离根目录的位置
        std::fs::write(dir.path().join(ORPHAN_DIR_NAME), "not a directory").unwrap();
        let batch = QuarantineBatch::new(QuarantineKind::Orphan, dir.path(), fixed_time());

        let err = batch.ensure_created().await.unwrap_err();
        assert!(matches!(err, SyncError::QuarantineCreation { .. }));
        assert!(batch.directory().is_none());
    }
}
