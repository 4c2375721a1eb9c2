use crate::core::quarantine::is_reserved_name;
use crate::error::{SyncError, SyncResult};
use crate::models::RelativePath;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 扫描范围
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    /// 整个目录树
    #[default]
    All,
    /// 指定的相对路径（文件或子目录）
    Paths(Vec<String>),
}

impl Selection {
    pub fn from_paths(paths: Vec<String>) -> Self {
        if paths.is_empty() {
            Selection::All
        } else {
            Selection::Paths(paths)
        }
    }
}

/// 文件树扫描器
///
/// 返回相对路径集合，只包含普通文件，始终排除根目录下的 `!EXFILES` 和 `!EXSIZE`。
#[derive(Debug, Clone, Default)]
pub struct TreeScanner;

impl TreeScanner {
    pub fn new() -> Self {
        Self
    }

    /// 按选择范围扫描
    pub async fn scan(&self, root: &Path, selection: &Selection) -> SyncResult<BTreeSet<RelativePath>> {
        match selection {
            Selection::All => self.enumerate(root).await,
            Selection::Paths(paths) => self.enumerate_selection(root, paths).await,
        }
    }

    /// 递归扫描整个目录树
    pub async fn enumerate(&self, root: &Path) -> SyncResult<BTreeSet<RelativePath>> {
        if !tokio::fs::metadata(root)
            .await
            .map(|m| m.is_dir())
            .map_err(|e| SyncError::io(root, e))?
        {
            return Err(SyncError::io(
                root,
                io::Error::new(io::ErrorKind::NotFound, "不是目录"),
            ));
        }

        let files = walk_blocking(root.to_path_buf(), root.to_path_buf()).await?;
        info!("扫描完成: {:?}, {} 个文件", root, files.len());
        Ok(files)
    }

    /// 只扫描选中的文件和子目录；既不是文件也不是目录的条目直接忽略
    pub async fn enumerate_selection(
        &self,
        root: &Path,
        paths: &[String],
    ) -> SyncResult<BTreeSet<RelativePath>> {
        let mut files = BTreeSet::new();

        for entry in paths {
            let relative = RelativePath::new(entry);
            if !relative.is_contained() {
                debug!("忽略无效的选择项: {:?}", entry);
                continue;
            }
            if is_reserved_name(relative.first_segment()) {
                debug!("忽略隔离目录中的选择项: {}", relative);
                continue;
            }

            let full_path = relative.to_path(root);
            match tokio::fs::metadata(&full_path).await {
                Ok(m) if m.is_file() => {
                    files.insert(relative);
                }
                Ok(m) if m.is_dir() => {
                    files.extend(walk_blocking(root.to_path_buf(), full_path).await?);
                }
                Ok(_) => debug!("选择项既不是文件也不是目录，跳过: {}", relative),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("选择项不存在，跳过: {}", relative)
                }
                Err(e) => return Err(SyncError::io(full_path, e)),
            }
        }

        info!("扫描选中项完成: {:?}, {} 个文件", root, files.len());
        Ok(files)
    }
}

/// 在阻塞线程中遍历 `start`，路径相对于 `root`
async fn walk_blocking(root: PathBuf, start: PathBuf) -> SyncResult<BTreeSet<RelativePath>> {
    let start_for_err = start.clone();
    tokio::task::spawn_blocking(move || walk(&root, &start))
        .await
        .map_err(|e| SyncError::io(start_for_err, io::Error::other(e)))?
}

/// 遇到无法读取的条目时整个扫描失败，不返回不完整的列表
fn walk(root: &Path, start: &Path) -> SyncResult<BTreeSet<RelativePath>> {
    let mut files = BTreeSet::new();
    let mut skipped = 0usize;

    let walker = WalkDir::new(start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_reserved_root_entry(root, entry.path()));

    for entry in walker {
        let entry = entry.map_err(|e| walk_error(start, e))?;

        if !entry.file_type().is_file() {
            continue;
        }

        match RelativePath::from_path(root, entry.path()) {
            Some(relative) => {
                files.insert(relative);
            }
            None => {
                warn!("跳过无法表示的文件名: {:?}", entry.path());
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        debug!("{:?}: 跳过 {} 个条目", start, skipped);
    }
    Ok(files)
}

fn walk_error(start: &Path, err: walkdir::Error) -> SyncError {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| start.to_path_buf());
    warn!("扫描失败，无法访问: {:?} - {}", path, err);
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("目录遍历失败"));
    SyncError::io(path, source)
}

/// 根目录下名为 `!EXFILES` / `!EXSIZE` 的条目（目录或文件）
fn is_reserved_root_entry(root: &Path, path: &Path) -> bool {
    path.parent() == Some(root)
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .map(is_reserved_name)
            .unwrap_or(false)
}
