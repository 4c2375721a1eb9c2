//! 日志模块 - 文件日志、大小轮转，以及同步引擎发出的日志条目

use crate::config::{read_section, write_section};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

/// 日志文件名
pub const LOG_FILE_NAME: &str = "flashsync.log";

/// 内存中保留的日志条数上限
pub const MAX_LOGS_TO_KEEP: usize = 1000;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "log").unwrap_or_default()
    }

    /// 保存日志配置
    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        write_section(config_dir, "log", self)
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 同步日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "Info"),
            LogLevel::Warning => write!(f, "Warning"),
            LogLevel::Error => write!(f, "Error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Info" => Ok(LogLevel::Info),
            "Warning" => Ok(LogLevel::Warning),
            "Error" => Ok(LogLevel::Error),
            other => Err(format!("未知的日志级别: {}", other)),
        }
    }
}

/// 日志行中的时间格式
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 引擎发出的一条日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub level: LogLevel,
    pub timestamp: DateTime<Local>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            timestamp: Local::now(),
        }
    }

    /// 解析 `Display` 输出的一行，格式不符时返回 None
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('[')?;
        let (time, rest) = rest.split_once("] [")?;
        let (level, message) = rest.split_once(']')?;

        let naive = NaiveDateTime::parse_from_str(time, LOG_TIME_FORMAT).ok()?;
        let timestamp = Local.from_local_datetime(&naive).earliest()?;

        Some(Self {
            message: message.strip_prefix(' ').unwrap_or(message).to_string(),
            level: level.parse().ok()?,
            timestamp,
        })
    }

    /// 同时写入 tracing
    pub(crate) fn trace(&self) {
        match self.level {
            LogLevel::Info => tracing::info!("{}", self.message),
            LogLevel::Warning => tracing::warn!("{}", self.message),
            LogLevel::Error => tracing::error!("{}", self.message),
        }
    }
}

impl std::fmt::Display for LogEntry {
    /// 格式: `[yyyy-MM-dd HH:mm:ss] [Level] message`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.timestamp.format(LOG_TIME_FORMAT),
            self.level,
            self.message
        )
    }
}

/// 最近日志的内存记录，超过上限时丢弃最旧的
#[derive(Debug, Default)]
pub struct LogHistory {
    entries: VecDeque<LogEntry>,
}

impl LogHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > MAX_LOGS_TO_KEEP {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// 按级别统计
    pub fn count_level(&self, level: LogLevel) -> usize {
        self.entries.iter().filter(|e| e.level == level).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 从 `render` 的输出读回，跳过无法解析的行
    pub fn parse(text: &str) -> Self {
        let mut history = Self::new();
        for line in text.lines() {
            match LogEntry::parse(line) {
                Some(entry) => history.push(entry),
                None if line.trim().is_empty() => {}
                None => tracing::debug!("跳过无法解析的日志行: {}", line),
            }
        }
        history
    }

    /// 读取保存的日志文件
    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// 每条一行的文本形式
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }
}

type SharedWriter = Arc<Mutex<Option<BufWriter<File>>>>;

fn lock_writer(writer: &SharedWriter) -> MutexGuard<'_, Option<BufWriter<File>>> {
    writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 带大小限制的日志写入器
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: SharedWriter,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = (max_size_mb.max(1) as u64) * 1024 * 1024;
        let writer = open_log_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

fn open_log_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
    if exceeds(file_path, max_size) {
        rotate_log(file_path)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)?;

    Ok(BufWriter::new(file))
}

fn exceeds(file_path: &Path, max_size: u64) -> bool {
    fs::metadata(file_path)
        .map(|m| m.len() > max_size)
        .unwrap_or(false)
}

/// 轮转日志文件：flashsync.log -> flashsync.log.old
fn rotate_log(file_path: &Path) -> io::Result<()> {
    let backup_path = file_path.with_extension("log.old");

    if backup_path.exists() {
        fs::remove_file(&backup_path)?;
    }

    fs::rename(file_path, &backup_path)
}

/// 超过大小时关闭当前文件、轮转并重新打开
fn rotate_if_needed(writer: &SharedWriter, file_path: &Path, max_size: u64) -> io::Result<()> {
    if !exceeds(file_path, max_size) {
        return Ok(());
    }

    let mut guard = lock_writer(writer);
    if let Some(mut w) = guard.take() {
        let _ = w.flush();
    }

    rotate_log(file_path)?;
    *guard = Some(open_log_file(file_path, max_size)?);
    Ok(())
}

/// 日志写入器包装
pub struct LogWriter {
    inner: SharedWriter,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = {
            let mut guard = lock_writer(&self.inner);
            let writer = guard
                .as_mut()
                .ok_or_else(|| io::Error::other("Writer not available"))?;
            let written = writer.write(buf)?;
            writer.flush()?;
            written
        };

        // 轮转失败不影响本次写入
        let _ = rotate_if_needed(&self.inner, &self.file_path, self.max_size);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock_writer(&self.inner).as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        let _ = rotate_if_needed(&self.writer, &self.file_path, self.max_size);

        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

/// 初始化全局日志：文件日志 + stderr 控制台输出
pub fn init_logging(log_dir: &Path) {
    let config = LogConfig::load(log_dir);

    if !config.enabled {
        // 文件日志已禁用，只保留控制台的警告和错误
        let _ = tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_max_level(tracing::Level::WARN)
            .with_target(false)
            .try_init();
        return;
    }

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());

    let (file_writer, file_error) = match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(writer) => (Some(writer), None),
        Err(e) => (None, Some(e)),
    };

    // 文件日志创建失败时只剩控制台输出
    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    if let Some(e) = file_error {
        tracing::warn!("无法创建日志文件 {:?}: {}", log_dir, e);
    }
}
