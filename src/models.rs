//! 同步数据模型：相对路径、文件处置结果、进度事件与同步报告

use crate::logging::LogEntry;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};

/// 当前平台的文件名是否大小写不敏感
pub const CASE_INSENSITIVE_PATHS: bool = cfg!(any(windows, target_os = "macos"));

/// 相对于树根的文件路径，统一使用 `/` 分隔
///
/// 两棵树之间按相对路径匹配文件；在大小写不敏感的平台上比较时忽略大小写，
/// 但保留原始拼写，所有文件操作都使用磁盘上的真实名称。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn new(path: impl AsRef<str>) -> Self {
        let normalized = path.as_ref().replace('\\', "/");
        let trimmed: Vec<&str> = normalized
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        Self(trimmed.join("/"))
    }

    /// 由绝对路径和树根计算相对路径；非 UTF-8 文件名返回 None
    pub fn from_path(root: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 是否一定落在树根之内：非空，且没有 `..` 或带 `:` 的路径段（Windows 盘符、备用数据流）
    pub fn is_contained(&self) -> bool {
        !self.is_empty()
            && self
                .0
                .split('/')
                .all(|segment| segment != ".." && !segment.contains(':'))
    }

    /// 最后一级文件名
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// 第一级路径段（用于判断是否落在保留的隔离目录中）
    pub fn first_segment(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// 拼接到指定树根下
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut full = root.to_path_buf();
        for part in self.0.split('/').filter(|s| !s.is_empty()) {
            full.push(part);
        }
        full
    }

    fn key(&self) -> Cow<'_, str> {
        if CASE_INSENSITIVE_PATHS {
            Cow::Owned(self.0.to_lowercase())
        } else {
            Cow::Borrowed(&self.0)
        }
    }
}

impl PartialEq for RelativePath {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RelativePath {}

impl Hash for RelativePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for RelativePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RelativePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl std::fmt::Display for RelativePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelativePath {
    fn from(s: &str) -> Self {
        RelativePath::new(s)
    }
}

/// 单个文件在一次同步中的处置结果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// 仅源中存在，已复制到目标
    New,
    /// 两边都存在且内容有变化，已用源覆盖
    Updated,
    /// 两边一致，无操作
    Unchanged,
    /// 仅目标中存在，已移入 !EXFILES
    MovedToQuarantineOrphan,
    /// 大小不一致，旧文件已移入 !EXSIZE 并从源重新复制
    MovedToQuarantineSizeMismatch,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Disposition::New => "new",
            Disposition::Updated => "updated",
            Disposition::Unchanged => "unchanged",
            Disposition::MovedToQuarantineOrphan => "orphan",
            Disposition::MovedToQuarantineSizeMismatch => "size_mismatch",
        };
        f.pad(s)
    }
}

/// 同步状态机
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Scanning,
    Classifying,
    QuarantiningOrphans,
    QuarantiningSizeMismatches,
    UpdatingCommon,
    CopyingNew,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }
}

/// 单个文件处理完成后的进度
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub relative_path: String,
    /// 累计已处理文件数
    pub processed: u64,
    /// 本次同步的文件总数（开始时确定，中途不重新计算）
    pub total: u64,
    pub disposition: Disposition,
}

/// 同步结束通知
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCompleted {
    pub success: bool,
    pub error_message: Option<String>,
}

/// 引擎发给外部的事件
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Phase(SyncStatus),
    Progress(SyncProgress),
    Log(LogEntry),
    Completed(SyncCompleted),
}

/// 同步报告
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub start_time: i64,
    pub end_time: i64,
    pub status: SyncStatus,
    pub files_total: u64,
    pub files_added: u64,
    pub files_updated: u64,
    pub files_unchanged: u64,
    pub files_orphaned: u64,
    pub files_size_mismatched: u64,
    pub files_failed: u64,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub(crate) fn new(run_id: &str, source: &Path, target: &Path, start_time: i64) -> Self {
        Self {
            run_id: run_id.to_string(),
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            start_time,
            end_time: start_time,
            status: SyncStatus::Idle,
            files_total: 0,
            files_added: 0,
            files_updated: 0,
            files_unchanged: 0,
            files_orphaned: 0,
            files_size_mismatched: 0,
            files_failed: 0,
            errors: Vec::new(),
        }
    }

    /// 成功处理的文件数
    pub fn files_processed(&self) -> u64 {
        self.files_added
            + self.files_updated
            + self.files_unchanged
            + self.files_orphaned
            + self.files_size_mismatched
    }

    /// 实际改动了磁盘的文件数
    pub fn files_changed(&self) -> u64 {
        self.files_processed() - self.files_unchanged
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Completed
    }

    pub(crate) fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::New => self.files_added += 1,
            Disposition::Updated => self.files_updated += 1,
            Disposition::Unchanged => self.files_unchanged += 1,
            Disposition::MovedToQuarantineOrphan => self.files_orphaned += 1,
            Disposition::MovedToQuarantineSizeMismatch => self.files_size_mismatched += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_normalization() {
        let p = RelativePath::new("\\sub\\dir\\file.txt");
        assert_eq!(p.as_str(), "sub/dir/file.txt");
        assert_eq!(p.file_name(), "file.txt");
        assert_eq!(p.first_segment(), "sub");
        assert_eq!(RelativePath::new("sub/").as_str(), "sub");
        assert_eq!(RelativePath::new("./a//b").as_str(), "a/b");
    }

    #[test]
    fn test_relative_path_containment() {
        assert!(RelativePath::new("sub/dir/file.txt").is_contained());
        assert!(!RelativePath::new("").is_contained());
        assert!(!RelativePath::new("../escape").is_contained());
        assert!(!RelativePath::new("sub/../../escape").is_contained());
        assert!(!RelativePath::new("C:\\Windows\\system32").is_contained());
        assert!(!RelativePath::new("notes.txt:hidden").is_contained());
    }

    #[test]
    fn test_relative_path_from_path() {
        let root = Path::new("/mnt/usb");
        let p = RelativePath::from_path(root, Path::new("/mnt/usb/music/song.mp3")).unwrap();
        assert_eq!(p.as_str(), "music/song.mp3");
        assert_eq!(p.to_path(root), Path::new("/mnt/usb/music/song.mp3"));
        assert!(RelativePath::from_path(root, root).is_none());
        assert!(RelativePath::from_path(root, Path::new("/elsewhere/x")).is_none());
    }

    #[test]
    fn test_relative_path_case_handling() {
        let a = RelativePath::new("Docs/Report.TXT");
        let b = RelativePath::new("docs/report.txt");
        assert_eq!(a == b, CASE_INSENSITIVE_PATHS);
        // 原始拼写始终保留
        assert_eq!(a.as_str(), "Docs/Report.TXT");
    }

    #[test]
    fn test_report_counts() {
        let mut report = SyncReport::new("run", Path::new("/s"), Path::new("/t"), 0);
        report.count(Disposition::New);
        report.count(Disposition::Unchanged);
        report.count(Disposition::MovedToQuarantineOrphan);
        assert_eq!(report.files_processed(), 3);
        assert_eq!(report.files_changed(), 2);
    }
}
