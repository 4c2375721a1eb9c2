//! 同步错误类型

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 根目录角色（用于错误信息）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootRole {
    Source,
    Target,
}

impl std::fmt::Display for RootRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootRole::Source => write!(f, "源目录"),
            RootRole::Target => write!(f, "目标目录"),
        }
    }
}

/// 同步过程中的错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 源或目标根目录不存在，整个同步中止
    #[error("{role}不存在: {}", path.display())]
    PathNotFound { role: RootRole, path: PathBuf },

    /// 单个文件的读写/移动/复制失败
    #[error("文件访问失败 {}: {source}", path.display())]
    IoAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 大文件哈希计算失败
    #[error("哈希计算失败 {}: {source}", path.display())]
    HashComputation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 隔离批次目录创建失败
    #[error("无法创建隔离目录 {}: {source}", path.display())]
    QuarantineCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("同步已取消")]
    Cancelled,
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::IoAccess {
            path: path.into(),
            source,
        }
    }

    /// 只有根目录缺失会中止整个同步，其余错误都在单个文件范围内处理
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::PathNotFound { .. })
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_missing_root_is_fatal() {
        let missing = SyncError::PathNotFound {
            role: RootRole::Target,
            path: PathBuf::from("/media/usb"),
        };
        assert!(missing.is_fatal());
        assert!(missing.to_string().contains("目标目录"));

        let io_err = SyncError::io("a.txt", io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(!io_err.is_fatal());
        assert!(!SyncError::Cancelled.is_fatal());
    }
}
