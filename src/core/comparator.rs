use crate::error::{SyncError, SyncResult};
use crate::models::RelativePath;
use chrono::{DateTime, Utc};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// 超过此大小且元数据一致的文件需要比较内容哈希
pub const HASH_THRESHOLD: u64 = 1024 * 1024;

/// 文件元数据快照，按需从文件系统读取
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub relative_path: RelativePath,
    pub absolute_path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl FileRecord {
    /// 读取 `root` 下相对路径对应文件的元数据
    pub async fn stat(root: &Path, relative_path: &RelativePath) -> SyncResult<Self> {
        let absolute_path = relative_path.to_path(root);
        let metadata = tokio::fs::metadata(&absolute_path)
            .await
            .map_err(|e| SyncError::io(&absolute_path, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| SyncError::io(&absolute_path, e))?;

        Ok(Self {
            relative_path: relative_path.clone(),
            absolute_path,
            size: metadata.len(),
            modified,
        })
    }

    pub fn modified_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.modified)
    }
}

/// 比较配置
#[derive(Debug, Clone)]
pub struct CompareConfig {
    /// 修改时间容差，0 表示必须完全相同
    pub mtime_tolerance: Duration,
    /// 哈希比较的大小阈值（严格大于时才哈希）
    pub hash_threshold: u64,
    /// 读取文件计算哈希时的缓冲区大小
    pub buffer_size: usize,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            mtime_tolerance: Duration::ZERO,
            hash_threshold: HASH_THRESHOLD,
            buffer_size: 64 * 1024,
        }
    }
}

/// 文件比较器
#[derive(Debug, Clone, Default)]
pub struct FileComparator {
    config: CompareConfig,
}

impl FileComparator {
    pub fn with_config(config: CompareConfig) -> Self {
        Self { config }
    }

    /// 修改时间是否不同（考虑容差）
    pub fn modified_differs(&self, source: &FileRecord, dest: &FileRecord) -> bool {
        let diff = match source.modified.duration_since(dest.modified) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        diff > self.config.mtime_tolerance
    }

    /// 仅根据元数据判断是否需要更新
    pub fn metadata_differs(&self, source: &FileRecord, dest: &FileRecord) -> bool {
        source.size != dest.size || self.modified_differs(source, dest)
    }

    /// 判断目标文件是否需要用源文件更新
    ///
    /// 1. 修改时间或大小不同 → 更新
    /// 2. 否则文件大于阈值时比较两边的 BLAKE3 哈希
    /// 3. 其余情况不更新
    pub async fn should_update(&self, source: &FileRecord, dest: &FileRecord) -> SyncResult<bool> {
        if self.metadata_differs(source, dest) {
            debug!(
                "元数据不同: {} (src={}B, dst={}B)",
                source.relative_path, source.size, dest.size
            );
            return Ok(true);
        }

        if source.size <= self.config.hash_threshold {
            return Ok(false);
        }

        let (src_hash, dst_hash) = tokio::try_join!(
            hash_file(&source.absolute_path, self.config.buffer_size),
            hash_file(&dest.absolute_path, self.config.buffer_size),
        )?;

        if src_hash != dst_hash {
            debug!("内容哈希不同: {}", source.relative_path);
        }
        Ok(src_hash != dst_hash)
    }
}

/// 流式计算整个文件的 BLAKE3 哈希
pub async fn hash_file(path: &Path, buffer_size: usize) -> SyncResult<blake3::Hash> {
    let owned = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<blake3::Hash> {
        let mut file = std::fs::File::open(&owned)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; buffer_size.max(4096)];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    })
    .await
    .map_err(|e| SyncError::HashComputation {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;

    result.map_err(|source| SyncError::HashComputation {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn record(path: &Path, root: &Path) -> FileRecord {
        let metadata = fs::metadata(path).unwrap();
        FileRecord {
            relative_path: RelativePath::from_path(root, path).unwrap(),
            absolute_path: path.to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified().unwrap(),
        }
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[tokio::test]
    async fn test_size_difference_triggers_update() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "hello").unwrap();
        fs::write(&b, "hello world").unwrap();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&a, t);
        set_mtime(&b, t);

        let cmp = FileComparator::default();
        assert!(cmp.should_update(&record(&a, dir.path()), &record(&b, dir.path())).await.unwrap());
    }

    #[tokio::test]
    async fn test_mtime_difference_triggers_update() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "same").unwrap();
        fs::write(&b, "same").unwrap();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&a, t);
        set_mtime(&b, t + Duration::from_secs(1));

        let cmp = FileComparator::default();
        assert!(cmp.should_update(&record(&a, dir.path()), &record(&b, dir.path())).await.unwrap());

        // 容差内视为相同
        let tolerant = FileComparator::with_config(CompareConfig {
            mtime_tolerance: Duration::from_secs(2),
            ..CompareConfig::default()
        });
        assert!(!tolerant
            .should_update(&record(&a, dir.path()), &record(&b, dir.path()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_small_identical_metadata_skips_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        // 内容不同但元数据相同，小文件不做哈希
        fs::write(&a, "aaaa").unwrap();
        fs::write(&b, "bbbb").unwrap();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&a, t);
        set_mtime(&b, t);

        let cmp = FileComparator::default();
        assert!(!cmp.should_update(&record(&a, dir.path()), &record(&b, dir.path())).await.unwrap());
    }

    #[tokio::test]
    async fn test_large_files_compared_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let c = dir.path().join("c.bin");
        let data = vec![7u8; (HASH_THRESHOLD + 10) as usize];
        let mut other = data.clone();
        other[100] = 8;
        fs::write(&a, &data).unwrap();
        fs::write(&b, &data).unwrap();
        fs::write(&c, &other).unwrap();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        for p in [&a, &b, &c] {
            set_mtime(p, t);
        }

        let cmp = FileComparator::default();
        let ra = record(&a, dir.path());
        assert!(!cmp.should_update(&ra, &record(&b, dir.path())).await.unwrap());
        assert!(cmp.should_update(&ra, &record(&c, dir.path())).await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_missing_file_is_hash_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = hash_file(&dir.path().join("missing.bin"), 4096).await.unwrap_err();
        assert!(matches!(err, SyncError::HashComputation { .. }));
    }

    #[tokio::test]
    async fn test_hash_matches_blake3() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&a, &data).unwrap();
        assert_eq!(hash_file(&a, 4096).await.unwrap(), blake3::hash(&data));
    }
}
