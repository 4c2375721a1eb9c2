use anyhow::Context;
use clap::{Parser, Subcommand};
use chrono::Local;
use flashsync_lib::config::{AppSettings, AuthorizedDrive};
use flashsync_lib::logging::{init_logging, LogHistory, LogLevel};
use flashsync_lib::models::SyncEvent;
use flashsync_lib::{resolve_config_dir, ScanPreview, Selection, SyncEngine, SyncReport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "flashsync", version, about = "把本地目录同步到闪存盘，多余和不一致的文件移入隔离区而不删除")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 分析差异，不修改任何文件
    Scan {
        source: PathBuf,
        target: PathBuf,
        /// 只处理这些相对路径（可重复）
        #[arg(long = "select", value_name = "PATH")]
        select: Vec<String>,
    },
    /// 执行同步
    Sync {
        source: PathBuf,
        target: PathBuf,
        /// 只处理这些相对路径（可重复）
        #[arg(long = "select", value_name = "PATH")]
        select: Vec<String>,
        /// 最大并发数（默认使用设置中的值）
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
        /// 使用 64 KiB 缓冲区
        #[arg(long)]
        small_buffers: bool,
        /// 把本次同步的日志保存到文件
        #[arg(long, value_name = "FILE")]
        save_log: Option<PathBuf>,
    },
    /// 查看或修改设置
    Config {
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        large_buffers: Option<bool>,
        #[arg(long)]
        auto_sync: Option<bool>,
        #[arg(long)]
        mtime_tolerance: Option<u64>,
        /// 授权驱动器（卷标），需同时给出 --drive-path 和 --sync-folder
        #[arg(long, value_name = "ID", requires_all = ["drive_path", "sync_folder"])]
        authorize_drive: Option<String>,
        /// 驱动器上的目标目录
        #[arg(long, value_name = "PATH")]
        drive_path: Option<PathBuf>,
        /// 同步到该驱动器的源目录
        #[arg(long, value_name = "PATH")]
        sync_folder: Option<PathBuf>,
        /// 取消授权驱动器
        #[arg(long, value_name = "ID")]
        revoke_drive: Option<String>,
        /// 恢复默认设置
        #[arg(long)]
        reset: bool,
    },
    /// 查看 --save-log 保存的同步日志
    Logs {
        file: PathBuf,
        /// 只显示该级别（Info / Warning / Error）
        #[arg(long)]
        level: Option<LogLevel>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_dir = match resolve_config_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("初始化配置目录失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config_dir);

    match run(cli.command, &config_dir).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config_dir: &Path) -> anyhow::Result<ExitCode> {
    match command {
        Command::Scan {
            source,
            target,
            select,
        } => {
            let settings = AppSettings::load(config_dir);
            let preview = SyncEngine::new(source, target)
                .with_selection(Selection::from_paths(select))
                .with_config(settings.sync_config())
                .analyze()
                .await?;
            print_preview(&preview);
            Ok(ExitCode::SUCCESS)
        }
        Command::Sync {
            source,
            target,
            select,
            jobs,
            small_buffers,
            save_log,
        } => {
            let mut settings = AppSettings::load(config_dir);
            let mut sync_config = settings.sync_config();
            if let Some(jobs) = jobs {
                sync_config.max_concurrent_operations = jobs.max(1);
            }
            if small_buffers {
                sync_config.use_large_buffers = false;
            }

            let engine = SyncEngine::new(&source, &target)
                .with_selection(Selection::from_paths(select))
                .with_config(sync_config);

            // Ctrl+C 取消同步，已开始的文件操作会完成
            let cancel_flag = engine.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("收到中断信号，正在取消同步...");
                    cancel_flag.store(true, Ordering::SeqCst);
                }
            });

            let (tx, rx) = mpsc::channel(256);
            let printer = tokio::spawn(print_events(rx));
            let report = engine.run_sync(Some(tx)).await;
            let history = printer.await.unwrap_or_default();

            print_report(&report);
            let warnings = history.count_level(LogLevel::Warning);
            let errors = history.count_level(LogLevel::Error);
            if warnings + errors > 0 {
                println!("警告 {} 条, 错误 {} 条", warnings, errors);
            }
            if let Some(path) = save_log {
                std::fs::write(&path, history.render())
                    .with_context(|| format!("保存日志失败: {:?}", path))?;
            }

            if report.is_success() {
                settings.record_sync_paths(&source, &target);
                if settings.mark_drive_synced(&target, Local::now()) {
                    tracing::debug!("已更新驱动器的最后同步时间: {:?}", target);
                }
                if let Err(e) = settings.save(config_dir) {
                    tracing::warn!("保存最近同步路径失败: {:#}", e);
                }
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Config {
            max_concurrent,
            large_buffers,
            auto_sync,
            mtime_tolerance,
            authorize_drive,
            drive_path,
            sync_folder,
            revoke_drive,
            reset,
        } => {
            let mut settings = if reset {
                AppSettings::reset(config_dir)?
            } else {
                AppSettings::load(config_dir)
            };

            let mut changed = max_concurrent.is_some()
                || large_buffers.is_some()
                || auto_sync.is_some()
                || mtime_tolerance.is_some();
            if let Some(n) = max_concurrent {
                settings.max_concurrent_operations = n.max(1);
            }
            if let Some(b) = large_buffers {
                settings.use_large_buffers = b;
            }
            if let Some(b) = auto_sync {
                settings.auto_sync_enabled = b;
            }
            if let Some(secs) = mtime_tolerance {
                settings.mtime_tolerance_seconds = secs;
            }
            if let (Some(id), Some(drive_path), Some(sync_folder)) =
                (authorize_drive, drive_path, sync_folder)
            {
                let drive = AuthorizedDrive {
                    volume_label: id.clone(),
                    drive_id: id.clone(),
                    drive_name: drive_path,
                    sync_folder_path: sync_folder,
                    last_sync_time: None,
                };
                if settings.add_authorized_drive(drive) {
                    tracing::info!("已授权驱动器: {}", id);
                    changed = true;
                } else {
                    tracing::warn!("驱动器已授权: {}", id);
                }
            }
            if let Some(id) = revoke_drive {
                if settings.remove_authorized_drive(&id) {
                    tracing::info!("已取消授权驱动器: {}", id);
                    changed = true;
                } else {
                    tracing::warn!("驱动器未授权: {}", id);
                }
            }
            if changed {
                settings.save(config_dir)?;
            }

            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Logs { file, level } => {
            let history = LogHistory::load(&file)
                .with_context(|| format!("读取日志失败: {:?}", file))?;
            for entry in history.entries().filter(|e| level.map_or(true, |l| e.level == l)) {
                println!("{}", entry);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn print_events(mut rx: mpsc::Receiver<SyncEvent>) -> LogHistory {
    let mut history = LogHistory::new();
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::Progress(p) => {
                println!("[{}/{}] {:<13} {}", p.processed, p.total, p.disposition, p.relative_path);
            }
            SyncEvent::Completed(c) if !c.success => {
                if let Some(message) = c.error_message {
                    eprintln!("{}", message);
                }
            }
            // 日志已经由 tracing 输出，这里只留存
            SyncEvent::Log(entry) => history.push(entry),
            _ => {}
        }
    }
    history
}

fn print_preview(preview: &ScanPreview) {
    for entry in &preview.entries {
        println!("{:<13} {}", entry.disposition, entry.relative_path);
    }
    for error in &preview.errors {
        eprintln!("错误: {}", error);
    }
    println!("{}", preview.summary());
}

fn print_report(report: &SyncReport) {
    println!(
        "状态: {:?}, 共 {} 个文件: 新增 {}, 更新 {}, 未变化 {}, 多余 {}, 大小不一致 {}, 失败 {}",
        report.status,
        report.files_total,
        report.files_added,
        report.files_updated,
        report.files_unchanged,
        report.files_orphaned,
        report.files_size_mismatched,
        report.files_failed
    );
    for error in &report.errors {
        eprintln!("  {}", error);
    }
}
