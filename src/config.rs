//! 应用配置模块
//!
//! 所有配置保存在配置目录下的 `config.json` 中，每个关注点一个字段
//! （`settings`、`log`、`data_path`），读写时互不覆盖。

use crate::core::SyncConfig;
use anyhow::Context;
use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// 最近同步路径保留条数
const MAX_RECENT_PATHS: usize = 10;

/// 读取 config.json 中的一个字段，文件缺失或格式错误时返回 None
pub fn read_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE_NAME)).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    serde_json::from_value(config.get(key)?.clone()).ok()
}

/// 更新 config.json 中的一个字段，保留其他字段
pub fn write_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> anyhow::Result<()> {
    fs::create_dir_all(config_dir)
        .with_context(|| format!("创建配置目录失败: {:?}", config_dir))?;
    let config_file = config_dir.join(CONFIG_FILE_NAME);

    let mut config: serde_json::Value = match fs::read_to_string(&config_file) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({})),
        Err(_) => serde_json::json!({}),
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value)?;

    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("写入配置文件失败: {:?}", config_file))?;
    Ok(())
}

/// 从 config.json 删除一个字段
fn remove_section(config_dir: &Path, key: &str) -> anyhow::Result<()> {
    let config_file = config_dir.join(CONFIG_FILE_NAME);
    let Ok(content) = fs::read_to_string(&config_file) else {
        return Ok(());
    };
    let mut config: serde_json::Value =
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(map) = config.as_object_mut() {
        map.remove(key);
    }
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)?;
    Ok(())
}

/// 一组最近同步过的路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPathPair {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// 已授权的驱动器：插入后允许自动同步
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedDrive {
    /// 驱动器标识（卷标）
    pub drive_id: String,
    /// 挂载位置，即同步的目标目录
    pub drive_name: PathBuf,
    #[serde(default)]
    pub volume_label: String,
    /// 同步到这个驱动器的源目录
    pub sync_folder_path: PathBuf,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Local>>,
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    /// 插入已授权驱动器时是否自动同步（由驱动器检测模块使用）
    #[serde(default)]
    pub auto_sync_enabled: bool,
    #[serde(default)]
    pub authorized_drives: Vec<AuthorizedDrive>,
    /// 每个阶段内的最大并发文件操作数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,
    /// 复制时使用大缓冲区
    #[serde(default = "default_use_large_buffers")]
    pub use_large_buffers: bool,
    /// 修改时间容差（秒），FAT 等文件系统的时间精度较低时可调大
    #[serde(default)]
    pub mtime_tolerance_seconds: u64,
    /// 最近同步过的源/目标，最新的在前
    #[serde(default)]
    pub last_sync_paths: Vec<SyncPathPair>,
}

fn default_max_concurrent() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_use_large_buffers() -> bool {
    true
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            auto_sync_enabled: false,
            authorized_drives: Vec::new(),
            max_concurrent_operations: default_max_concurrent(),
            use_large_buffers: default_use_large_buffers(),
            mtime_tolerance_seconds: 0,
            last_sync_paths: Vec::new(),
        }
    }
}

impl AppSettings {
    /// 加载设置，缺失或损坏时使用默认值
    pub fn load(config_dir: &Path) -> Self {
        let mut settings: Self = read_section(config_dir, "settings").unwrap_or_default();
        settings.max_concurrent_operations = settings.max_concurrent_operations.max(1);
        settings
    }

    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        write_section(config_dir, "settings", self)
    }

    /// 恢复默认设置并写回
    pub fn reset(config_dir: &Path) -> anyhow::Result<Self> {
        remove_section(config_dir, "settings")?;
        let settings = Self::default();
        settings.save(config_dir)?;
        Ok(settings)
    }

    /// 记录一次同步的路径，去重后放到最前
    pub fn record_sync_paths(&mut self, source: &Path, target: &Path) {
        let pair = SyncPathPair {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        };
        self.last_sync_paths.retain(|p| p != &pair);
        self.last_sync_paths.insert(0, pair);
        self.last_sync_paths.truncate(MAX_RECENT_PATHS);
    }

    /// 授权驱动器；同一标识已存在时不做改动，返回 false
    pub fn add_authorized_drive(&mut self, drive: AuthorizedDrive) -> bool {
        if self.is_drive_authorized(&drive.drive_id) {
            return false;
        }
        self.authorized_drives.push(drive);
        true
    }

    /// 取消授权，返回是否有驱动器被移除
    pub fn remove_authorized_drive(&mut self, drive_id: &str) -> bool {
        let before = self.authorized_drives.len();
        self.authorized_drives.retain(|d| d.drive_id != drive_id);
        self.authorized_drives.len() != before
    }

    pub fn is_drive_authorized(&self, drive_id: &str) -> bool {
        self.authorized_drives.iter().any(|d| d.drive_id == drive_id)
    }

    /// 同步成功后更新以 `target` 为挂载位置的驱动器的最后同步时间
    pub fn mark_drive_synced(&mut self, target: &Path, at: DateTime<Local>) -> bool {
        match self.authorized_drives.iter_mut().find(|d| d.drive_name == target) {
            Some(drive) => {
                drive.last_sync_time = Some(at);
                true
            }
            None => false,
        }
    }

    /// 生成同步引擎配置
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            max_concurrent_operations: self.max_concurrent_operations.max(1),
            use_large_buffers: self.use_large_buffers,
            mtime_tolerance: Duration::from_secs(self.mtime_tolerance_seconds),
            ..SyncConfig::default()
        }
    }
}

/// 读取自定义数据目录（config.json 中的 data_path）
pub fn custom_data_path(config_dir: &Path) -> Option<PathBuf> {
    read_section::<String>(config_dir, "data_path")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::load(dir.path());
        assert!(!settings.auto_sync_enabled);
        assert!(settings.use_large_buffers);
        assert!(settings.max_concurrent_operations >= 1);
    }

    #[test]
    fn test_settings_roundtrip_preserves_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        write_section(dir.path(), "log", &serde_json::json!({ "level": "debug" })).unwrap();

        let mut settings = AppSettings::load(dir.path());
        settings.max_concurrent_operations = 3;
        settings.use_large_buffers = false;
        settings.auto_sync_enabled = true;
        settings.save(dir.path()).unwrap();

        let loaded = AppSettings::load(dir.path());
        assert_eq!(loaded.max_concurrent_operations, 3);
        assert!(!loaded.use_large_buffers);
        assert!(loaded.auto_sync_enabled);

        let log: serde_json::Value = read_section(dir.path(), "log").unwrap();
        assert_eq!(log["level"], "debug");
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        write_section(
            dir.path(),
            "settings",
            &serde_json::json!({ "maxConcurrentOperations": 0 }),
        )
        .unwrap();

        let settings = AppSettings::load(dir.path());
        assert_eq!(settings.max_concurrent_operations, 1);
        assert_eq!(settings.sync_config().max_concurrent_operations, 1);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "{ not json").unwrap();
        let settings = AppSettings::load(dir.path());
        assert!(settings.use_large_buffers);

        // 写入时会覆盖损坏的文件
        settings.save(dir.path()).unwrap();
        assert!(read_section::<AppSettings>(dir.path(), "settings").is_some());
    }

    #[test]
    fn test_reset_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AppSettings::default();
        settings.use_large_buffers = false;
        settings.save(dir.path()).unwrap();

        let reset = AppSettings::reset(dir.path()).unwrap();
        assert!(reset.use_large_buffers);
        assert!(AppSettings::load(dir.path()).use_large_buffers);
    }

    fn drive(id: &str, mount: &str) -> AuthorizedDrive {
        AuthorizedDrive {
            drive_id: id.to_string(),
            drive_name: PathBuf::from(mount),
            volume_label: id.to_string(),
            sync_folder_path: PathBuf::from("/home/me/music"),
            last_sync_time: None,
        }
    }

    #[test]
    fn test_authorized_drives_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AppSettings::default();

        assert!(settings.add_authorized_drive(drive("USB-A", "/media/usb-a")));
        assert!(!settings.add_authorized_drive(drive("USB-A", "/media/other")));
        assert!(settings.add_authorized_drive(drive("USB-B", "/media/usb-b")));
        assert_eq!(settings.authorized_drives.len(), 2);
        assert_eq!(settings.authorized_drives[0].drive_name, PathBuf::from("/media/usb-a"));

        let synced_at = Local::now();
        assert!(settings.mark_drive_synced(Path::new("/media/usb-b"), synced_at));
        assert!(!settings.mark_drive_synced(Path::new("/media/unknown"), synced_at));
        settings.save(dir.path()).unwrap();

        let mut loaded = AppSettings::load(dir.path());
        assert!(loaded.is_drive_authorized("USB-A"));
        assert_eq!(loaded.authorized_drives[1].last_sync_time, Some(synced_at));
        assert!(loaded.authorized_drives[0].last_sync_time.is_none());

        assert!(loaded.remove_authorized_drive("USB-A"));
        assert!(!loaded.remove_authorized_drive("USB-A"));
        assert!(!loaded.is_drive_authorized("USB-A"));
        assert!(loaded.is_drive_authorized("USB-B"));
    }

    #[test]
    fn test_record_sync_paths_dedups_and_truncates() {
        let mut settings = AppSettings::default();
        for i in 0..12 {
            settings.record_sync_paths(Path::new(&format!("/src{}", i)), Path::new("/usb"));
        }
        settings.record_sync_paths(Path::new("/src5"), Path::new("/usb"));

        assert_eq!(settings.last_sync_paths.len(), MAX_RECENT_PATHS);
        assert_eq!(settings.last_sync_paths[0].source, PathBuf::from("/src5"));
        assert_eq!(
            settings
                .last_sync_paths
                .iter()
                .filter(|p| p.source == Path::new("/src5"))
                .count(),
            1
        );
    }
}
