use crate::core::classifier::{self, Classification, CommonFile, SizeMismatch};
use crate::core::comparator::{CompareConfig, FileComparator, FileRecord, HASH_THRESHOLD};
use crate::core::quarantine::{QuarantineBatch, QuarantineKind};
use crate::core::scanner::{Selection, TreeScanner};
use crate::core::transfer::{copy_file, CopyMode, LARGE_BUFFER_SIZE, SMALL_BUFFER_SIZE};
use crate::error::{RootRole, SyncError, SyncResult};
use crate::logging::{LogEntry, LogLevel};
use crate::models::{
    Disposition, RelativePath, SyncCompleted, SyncEvent, SyncProgress, SyncReport, SyncStatus,
};
use chrono::{DateTime, Local, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info};

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 每个阶段内的最大并发文件操作数
    pub max_concurrent_operations: usize,
    /// 复制和哈希时使用 1 MiB 缓冲区（否则 64 KiB）
    pub use_large_buffers: bool,
    /// 元数据一致时，超过此大小的文件比较内容哈希
    pub hash_threshold: u64,
    /// 修改时间容差
    pub mtime_tolerance: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            use_large_buffers: true,
            hash_threshold: HASH_THRESHOLD,
            mtime_tolerance: Duration::ZERO,
        }
    }
}

impl SyncConfig {
    pub fn buffer_size(&self) -> usize {
        if self.use_large_buffers {
            LARGE_BUFFER_SIZE
        } else {
            SMALL_BUFFER_SIZE
        }
    }

    fn concurrency(&self) -> usize {
        self.max_concurrent_operations.max(1)
    }

    fn compare_config(&self) -> CompareConfig {
        CompareConfig {
            mtime_tolerance: self.mtime_tolerance,
            hash_threshold: self.hash_threshold,
            buffer_size: self.buffer_size(),
        }
    }
}

/// 预览中的一项
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEntry {
    pub relative_path: String,
    pub disposition: Disposition,
    pub source_size: Option<u64>,
    pub target_size: Option<u64>,
    pub source_modified: Option<DateTime<Utc>>,
}

/// 差异预览（不修改磁盘）
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPreview {
    pub entries: Vec<PreviewEntry>,
    pub new_count: usize,
    pub orphaned_count: usize,
    pub size_mismatch_count: usize,
    pub update_count: usize,
    pub unchanged_count: usize,
    pub errors: Vec<String>,
}

impl ScanPreview {
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    /// 是否有任何需要执行的操作
    pub fn has_changes(&self) -> bool {
        self.new_count + self.orphaned_count + self.size_mismatch_count + self.update_count > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "新增 {}, 多余 {}, 大小不一致 {}, 需更新 {}, 未变化 {}",
            self.new_count,
            self.orphaned_count,
            self.size_mismatch_count,
            self.update_count,
            self.unchanged_count
        )
    }

    fn push(&mut self, entry: PreviewEntry) {
        match entry.disposition {
            Disposition::New => self.new_count += 1,
            Disposition::MovedToQuarantineOrphan => self.orphaned_count += 1,
            Disposition::MovedToQuarantineSizeMismatch => self.size_mismatch_count += 1,
            Disposition::Updated => self.update_count += 1,
            Disposition::Unchanged => self.unchanged_count += 1,
        }
        self.entries.push(entry);
    }
}

/// 事件发送端，接收方关闭时静默丢弃
#[derive(Debug, Clone, Default)]
struct EventSink {
    tx: Option<mpsc::Sender<SyncEvent>>,
}

impl EventSink {
    async fn send(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    /// 写 tracing 并发给外部日志接收者
    async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        entry.trace();
        self.send(SyncEvent::Log(entry)).await;
    }

    async fn phase(&self, status: SyncStatus) {
        debug!("同步阶段: {:?}", status);
        self.send(SyncEvent::Phase(status)).await;
    }
}

type Outcome = (RelativePath, SyncResult<Disposition>);

/// 一次同步运行的共享状态，在各阶段的工作任务之间共享
struct SyncRun {
    source: PathBuf,
    target: PathBuf,
    comparator: FileComparator,
    buffer_size: usize,
    orphan_batch: QuarantineBatch,
    size_batch: QuarantineBatch,
    /// 已处理文件数，工作任务并发递增
    processed: AtomicU64,
    /// 开始时确定，中途不重新计算
    total: u64,
    sink: EventSink,
    cancelled: Arc<AtomicBool>,
}

impl SyncRun {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 单个文件处理完毕：记录日志，成功时发送进度
    async fn finish_file(&self, path: &RelativePath, result: &SyncResult<Disposition>) {
        match result {
            Ok(disposition) => {
                let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
                match disposition {
                    Disposition::Unchanged => debug!("未变化: {}", path),
                    Disposition::New => self.sink.log(LogLevel::Info, format!("已添加新文件: {}", path)).await,
                    Disposition::Updated => self.sink.log(LogLevel::Info, format!("已更新文件: {}", path)).await,
                    Disposition::MovedToQuarantineOrphan => {
                        self.sink
                            .log(LogLevel::Info, format!("已将多余文件移入 !EXFILES: {}", path))
                            .await
                    }
                    Disposition::MovedToQuarantineSizeMismatch => {
                        self.sink
                            .log(LogLevel::Info, format!("已将大小不一致的文件移入 !EXSIZE 并重新复制: {}", path))
                            .await
                    }
                }
                self.sink
                    .send(SyncEvent::Progress(SyncProgress {
                        relative_path: path.to_string(),
                        processed,
                        total: self.total,
                        disposition: *disposition,
                    }))
                    .await;
            }
            Err(e) => {
                self.sink
                    .log(LogLevel::Error, format!("处理文件失败 {}: {}", path, e))
                    .await;
            }
        }
    }
}

/// 并行执行一个阶段的所有文件操作，等待全部完成后返回
///
/// 并发数由信号量限制；取消后不再调度新的文件，已开始的操作会完成。
async fn run_phase<T, F, Fut>(run: &Arc<SyncRun>, limit: usize, items: Vec<T>, op: F) -> Vec<Outcome>
where
    T: Send + 'static,
    F: Fn(Arc<SyncRun>, T) -> Fut,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        if run.is_cancelled() {
            break;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let task = op(run.clone(), item);
        let run = run.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit;
            if run.is_cancelled() {
                return None;
            }
            let (path, result) = task.await;
            run.finish_file(&path, &result).await;
            Some((path, result))
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for joined in join_all(handles).await {
        match joined {
            Ok(Some(outcome)) => outcomes.push(outcome),
            Ok(None) => {}
            Err(e) => error!("文件任务异常退出: {}", e),
        }
    }
    outcomes
}

async fn quarantine_orphan(run: Arc<SyncRun>, path: RelativePath) -> Outcome {
    let result = run
        .orphan_batch
        .quarantine_file(&path.to_path(&run.target))
        .await
        .map(|_| Disposition::MovedToQuarantineOrphan);
    (path, result)
}

async fn replace_size_mismatch(run: Arc<SyncRun>, mismatch: SizeMismatch) -> Outcome {
    let result = requarantine_and_copy(&run, &mismatch.file).await;
    (mismatch.file.source, result)
}

async fn requarantine_and_copy(run: &SyncRun, file: &CommonFile) -> SyncResult<Disposition> {
    let target_file = file.target.to_path(&run.target);
    run.size_batch.quarantine_file(&target_file).await?;
    // 旧文件已经移走，直接写入
    copy_file(
        &file.source.to_path(&run.source),
        &target_file,
        CopyMode::Overwrite,
        run.buffer_size,
    )
    .await?;
    Ok(Disposition::MovedToQuarantineSizeMismatch)
}

async fn update_common(run: Arc<SyncRun>, file: CommonFile) -> Outcome {
    let result = update_if_changed(&run, &file).await;
    (file.source, result)
}

async fn update_if_changed(run: &SyncRun, file: &CommonFile) -> SyncResult<Disposition> {
    let source = FileRecord::stat(&run.source, &file.source).await?;
    let target = FileRecord::stat(&run.target, &file.target).await?;
    if !run.comparator.should_update(&source, &target).await? {
        return Ok(Disposition::Unchanged);
    }
    copy_file(
        &source.absolute_path,
        &target.absolute_path,
        CopyMode::Overwrite,
        run.buffer_size,
    )
    .await?;
    Ok(Disposition::Updated)
}

async fn copy_new(run: Arc<SyncRun>, path: RelativePath) -> Outcome {
    let result = copy_file(
        &path.to_path(&run.source),
        &path.to_path(&run.target),
        CopyMode::CreateNew,
        run.buffer_size,
    )
    .await
    .map(|_| Disposition::New);
    (path, result)
}

/// 汇总一个阶段的结果
fn tally(report: &mut SyncReport, outcomes: Vec<Outcome>) {
    for (path, result) in outcomes {
        match result {
            Ok(disposition) => report.count(disposition),
            Err(e) => {
                report.files_failed += 1;
                report.errors.push(format!("{}: {}", path, e));
            }
        }
    }
}

/// 同步引擎
///
/// 把源目录的文件集合同步到目标目录：目标中多余的文件移入 `!EXFILES`，
/// 大小不一致的旧文件移入 `!EXSIZE` 后重新复制，其余共有文件按需更新，
/// 最后复制新文件。目标中的文件从不删除。
pub struct SyncEngine {
    source: PathBuf,
    target: PathBuf,
    selection: Selection,
    config: SyncConfig,
    cancelled: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            selection: Selection::All,
            config: SyncConfig::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 只同步选中的文件和子目录
    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 取消同步：在阶段之间和每个文件操作开始前检查
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 供其他任务使用的取消标志
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn validate_roots(&self) -> SyncResult<()> {
        for (role, path) in [(RootRole::Source, &self.source), (RootRole::Target, &self.target)] {
            let is_dir = tokio::fs::metadata(path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !is_dir {
                return Err(SyncError::PathNotFound {
                    role,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }

    /// 并发扫描源和目标
    async fn scan_trees(&self) -> SyncResult<(BTreeSet<RelativePath>, BTreeSet<RelativePath>)> {
        let scanner = TreeScanner::new();
        let (source_files, target_files) = tokio::try_join!(
            scanner.scan(&self.source, &self.selection),
            scanner.scan(&self.target, &self.selection),
        )?;

        debug!(
            "扫描完成: 源 {} 文件, 目标 {} 文件",
            source_files.len(),
            target_files.len()
        );
        Ok((source_files, target_files))
    }

    async fn classify(
        &self,
        source_files: &BTreeSet<RelativePath>,
        target_files: &BTreeSet<RelativePath>,
    ) -> Classification {
        classifier::classify(
            &self.source,
            &self.target,
            source_files,
            target_files,
            self.config.concurrency(),
        )
        .await
    }

    /// 分析差异但不修改任何文件
    pub async fn analyze(&self) -> SyncResult<ScanPreview> {
        self.validate_roots().await?;
        let (source_files, target_files) = self.scan_trees().await?;
        let classification = self.classify(&source_files, &target_files).await;
        let comparator = FileComparator::with_config(self.config.compare_config());
        let limit = self.config.concurrency();
        let mut preview = ScanPreview::default();

        let new_entries: Vec<PreviewEntry> = stream::iter(classification.new.iter())
            .map(|path| async move {
                let record = FileRecord::stat(&self.source, path).await.ok();
                PreviewEntry {
                    relative_path: path.to_string(),
                    disposition: Disposition::New,
                    source_size: record.as_ref().map(|r| r.size),
                    target_size: None,
                    source_modified: record.as_ref().map(|r| r.modified_utc()),
                }
            })
            .buffered(limit)
            .collect()
            .await;
        new_entries.into_iter().for_each(|e| preview.push(e));

        let orphan_entries: Vec<PreviewEntry> = stream::iter(classification.orphaned.iter())
            .map(|path| async move {
                let record = FileRecord::stat(&self.target, path).await.ok();
                PreviewEntry {
                    relative_path: path.to_string(),
                    disposition: Disposition::MovedToQuarantineOrphan,
                    source_size: None,
                    target_size: record.map(|r| r.size),
                    source_modified: None,
                }
            })
            .buffered(limit)
            .collect()
            .await;
        orphan_entries.into_iter().for_each(|e| preview.push(e));

        for mismatch in &classification.size_mismatch {
            let record = FileRecord::stat(&self.source, &mismatch.file.source).await.ok();
            preview.push(PreviewEntry {
                relative_path: mismatch.file.source.to_string(),
                disposition: Disposition::MovedToQuarantineSizeMismatch,
                source_size: Some(mismatch.source_size),
                target_size: Some(mismatch.target_size),
                source_modified: record.map(|r| r.modified_utc()),
            });
        }

        let candidates = classification.update_candidates();
        let decisions: Vec<SyncResult<PreviewEntry>> = stream::iter(candidates.iter())
            .map(|file| self.preview_common(&comparator, file))
            .buffered(limit)
            .collect()
            .await;

        for decision in decisions {
            match decision {
                Ok(entry) => preview.push(entry),
                Err(e) => preview.errors.push(e.to_string()),
            }
        }

        info!("差异分析完成: {}", preview.summary());
        Ok(preview)
    }

    async fn preview_common(
        &self,
        comparator: &FileComparator,
        file: &CommonFile,
    ) -> SyncResult<PreviewEntry> {
        let source = FileRecord::stat(&self.source, &file.source).await?;
        let target = FileRecord::stat(&self.target, &file.target).await?;
        let disposition = if comparator.should_update(&source, &target).await? {
            Disposition::Updated
        } else {
            Disposition::Unchanged
        };
        Ok(PreviewEntry {
            relative_path: file.source.to_string(),
            disposition,
            source_size: Some(source.size),
            target_size: Some(target.size),
            source_modified: Some(source.modified_utc()),
        })
    }

    /// 执行同步
    ///
    /// 每处理完一个文件发送一次 `SyncEvent::Progress`，结束时发送一次 `SyncEvent::Completed`。
    /// 单个文件失败只记录错误，不影响其他文件；只有根目录不存在会使整个同步失败。
    pub async fn run_sync(&self, events: Option<mpsc::Sender<SyncEvent>>) -> SyncReport {
        let started: DateTime<Local> = Local::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let sink = EventSink { tx: events };
        let mut report = SyncReport::new(&run_id, &self.source, &self.target, started.timestamp());

        info!("开始同步 [{}]: {:?} -> {:?}", run_id, self.source, self.target);
        sink.log(LogLevel::Info, "开始同步...").await;

        if let Err(e) = self.validate_roots().await {
            return Self::finish_failed(report, &sink, e).await;
        }
        if self.is_cancelled() {
            return Self::finish_cancelled(report, &sink).await;
        }

        sink.phase(SyncStatus::Scanning).await;
        let (source_files, target_files) = match self.scan_trees().await {
            Ok(trees) => trees,
            Err(e) => return Self::finish_failed(report, &sink, e).await,
        };
        if self.is_cancelled() {
            return Self::finish_cancelled(report, &sink).await;
        }

        sink.phase(SyncStatus::Classifying).await;
        let classification = self.classify(&source_files, &target_files).await;
        for m in &classification.size_mismatch {
            sink.log(
                LogLevel::Warning,
                format!(
                    "大小不一致: {} (源={} 字节, 目标={} 字节)",
                    m.file.source, m.source_size, m.target_size
                ),
            )
            .await;
        }

        let total = classification.total();
        report.files_total = total;
        sink.log(
            LogLevel::Info,
            format!(
                "分类完成: 新增 {}, 多余 {}, 大小不一致 {}, 共有 {}",
                classification.new.len(),
                classification.orphaned.len(),
                classification.size_mismatch.len(),
                classification.common.len() - classification.size_mismatch.len()
            ),
        )
        .await;

        let run = Arc::new(SyncRun {
            source: self.source.clone(),
            target: self.target.clone(),
            comparator: FileComparator::with_config(self.config.compare_config()),
            buffer_size: self.config.buffer_size(),
            orphan_batch: QuarantineBatch::new(QuarantineKind::Orphan, &self.target, started),
            size_batch: QuarantineBatch::new(QuarantineKind::SizeMismatch, &self.target, started),
            processed: AtomicU64::new(0),
            total,
            sink: sink.clone(),
            cancelled: self.cancelled.clone(),
        });
        let limit = self.config.concurrency();
        let update_candidates = classification.update_candidates();
        let Classification {
            new,
            orphaned,
            size_mismatch,
            ..
        } = classification;

        // 1. 多余文件移入 !EXFILES
        if self.is_cancelled() {
            return Self::finish_cancelled(report, &sink).await;
        }
        sink.phase(SyncStatus::QuarantiningOrphans).await;
        if !orphaned.is_empty() {
            match run.orphan_batch.ensure_created().await {
                Ok(_) => tally(&mut report, run_phase(&run, limit, orphaned, quarantine_orphan).await),
                Err(e) => Self::fail_batch(&mut report, &sink, orphaned.iter(), &e).await,
            }
        }

        // 2. 大小不一致：旧文件移入 !EXSIZE，再从源复制
        if self.is_cancelled() {
            return Self::finish_cancelled(report, &sink).await;
        }
        sink.phase(SyncStatus::QuarantiningSizeMismatches).await;
        if !size_mismatch.is_empty() {
            match run.size_batch.ensure_created().await {
                Ok(_) => tally(
                    &mut report,
                    run_phase(&run, limit, size_mismatch, replace_size_mismatch).await,
                ),
                Err(e) => {
                    Self::fail_batch(&mut report, &sink, size_mismatch.iter().map(|m| &m.file.source), &e)
                        .await
                }
            }
        }

        // 3. 共有文件按需更新
        if self.is_cancelled() {
            return Self::finish_cancelled(report, &sink).await;
        }
        sink.phase(SyncStatus::UpdatingCommon).await;
        tally(&mut report, run_phase(&run, limit, update_candidates, update_common).await);

        // 4. 复制新文件
        if self.is_cancelled() {
            return Self::finish_cancelled(report, &sink).await;
        }
        sink.phase(SyncStatus::CopyingNew).await;
        tally(&mut report, run_phase(&run, limit, new, copy_new).await);

        if self.is_cancelled() {
            return Self::finish_cancelled(report, &sink).await;
        }

        report.status = SyncStatus::Completed;
        report.end_time = Utc::now().timestamp();
        sink.log(
            LogLevel::Info,
            format!(
                "同步完成: 新增 {}, 更新 {}, 未变化 {}, 移入 !EXFILES {}, 移入 !EXSIZE {}, 失败 {}",
                report.files_added,
                report.files_updated,
                report.files_unchanged,
                report.files_orphaned,
                report.files_size_mismatched,
                report.files_failed
            ),
        )
        .await;
        sink.phase(SyncStatus::Completed).await;
        sink.send(SyncEvent::Completed(SyncCompleted {
            success: true,
            error_message: None,
        }))
        .await;

        report
    }

    /// 隔离目录创建失败：该批次的所有文件都记为失败
    async fn fail_batch<'a>(
        report: &mut SyncReport,
        sink: &EventSink,
        paths: impl Iterator<Item = &'a RelativePath>,
        err: &SyncError,
    ) {
        sink.log(LogLevel::Error, err.to_string()).await;
        for path in paths {
            report.files_failed += 1;
            report.errors.push(format!("{}: {}", path, err));
        }
    }

    async fn finish_failed(mut report: SyncReport, sink: &EventSink, err: SyncError) -> SyncReport {
        let message = format!("同步失败: {}", err);
        sink.log(LogLevel::Error, message.clone()).await;

        report.status = SyncStatus::Failed;
        report.end_time = Utc::now().timestamp();
        report.errors.push(err.to_string());

        sink.phase(SyncStatus::Failed).await;
        sink.send(SyncEvent::Completed(SyncCompleted {
            success: false,
            error_message: Some(message),
        }))
        .await;
        report
    }

    async fn finish_cancelled(mut report: SyncReport, sink: &EventSink) -> SyncReport {
        let message = SyncError::Cancelled.to_string();
        sink.log(LogLevel::Warning, message.clone()).await;

        report.status = SyncStatus::Cancelled;
        report.end_time = Utc::now().timestamp();
        report.errors.push(message.clone());

        sink.phase(SyncStatus::Cancelled).await;
        sink.send(SyncEvent::Completed(SyncCompleted {
            success: false,
            error_message: Some(message),
        }))
        .await;
        report
    }
}
