//! 把源和目标的相对路径集合划分为 新增 / 多余 / 共有，并找出共有文件中大小不一致的部分

use crate::models::RelativePath;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

/// 两边都存在的文件；大小写不敏感的平台上两边的拼写可能不同
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonFile {
    pub source: RelativePath,
    pub target: RelativePath,
}

impl CommonFile {
    /// 用于报告的路径（源的拼写）
    pub fn relative_path(&self) -> &RelativePath {
        &self.source
    }
}

/// 大小不一致的共有文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeMismatch {
    pub file: CommonFile,
    pub source_size: u64,
    pub target_size: u64,
}

/// 分类结果，各列表按相对路径排序
#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// 仅源中存在
    pub new: Vec<RelativePath>,
    /// 仅目标中存在
    pub orphaned: Vec<RelativePath>,
    /// 两边都存在（包含大小不一致的）
    pub common: Vec<CommonFile>,
    /// common 的子集
    pub size_mismatch: Vec<SizeMismatch>,
}

impl Classification {
    /// 本次同步要处理的文件总数
    pub fn total(&self) -> u64 {
        (self.orphaned.len() + self.common.len() + self.new.len()) as u64
    }

    /// 普通更新阶段要检查的共有文件（已去掉大小不一致的）
    pub fn update_candidates(&self) -> Vec<CommonFile> {
        let mismatched: BTreeSet<&RelativePath> =
            self.size_mismatch.iter().map(|m| &m.file.source).collect();
        self.common
            .iter()
            .filter(|c| !mismatched.contains(&c.source))
            .cloned()
            .collect()
    }
}

/// 纯集合运算：Orphaned = T − S，Common = S ∩ T，New = S − T
pub fn partition(source: &BTreeSet<RelativePath>, target: &BTreeSet<RelativePath>) -> Classification {
    let new = source.difference(target).cloned().collect();
    let orphaned = target.difference(source).cloned().collect();
    let common = source
        .iter()
        .filter_map(|s| {
            target.get(s).map(|t| CommonFile {
                source: s.clone(),
                target: t.clone(),
            })
        })
        .collect();

    Classification {
        new,
        orphaned,
        common,
        size_mismatch: Vec::new(),
    }
}

/// 并发读取共有文件两边的大小，返回大小不一致的文件
///
/// 只读元数据，不读内容。任一边读取失败的文件留在普通共有集合中，
/// 由更新阶段报告错误。
pub async fn find_size_mismatches(
    source_root: &Path,
    target_root: &Path,
    common: &[CommonFile],
    max_concurrent: usize,
) -> Vec<SizeMismatch> {
    let mut found: Vec<SizeMismatch> = stream::iter(common.iter().cloned())
        .map(|file| async move {
            let src = tokio::fs::metadata(file.source.to_path(source_root)).await;
            let dst = tokio::fs::metadata(file.target.to_path(target_root)).await;
            match (src, dst) {
                (Ok(s), Ok(d)) if s.len() != d.len() => Some(SizeMismatch {
                    file,
                    source_size: s.len(),
                    target_size: d.len(),
                }),
                (Err(e), _) | (_, Err(e)) => {
                    debug!("读取大小失败，留给更新阶段处理: {} - {}", file.source, e);
                    None
                }
                _ => None,
            }
        })
        .buffer_unordered(max_concurrent.max(1))
        .filter_map(|m| async move { m })
        .collect()
        .await;

    found.sort_by(|a, b| a.file.source.cmp(&b.file.source));
    found
}

/// 完整分类：集合划分 + 大小检查
pub async fn classify(
    source_root: &Path,
    target_root: &Path,
    source: &BTreeSet<RelativePath>,
    target: &BTreeSet<RelativePath>,
    max_concurrent: usize,
) -> Classification {
    let mut classification = partition(source, target);
    classification.size_mismatch =
        find_size_mismatches(source_root, target_root, &classification.common, max_concurrent).await;
    classification
}
