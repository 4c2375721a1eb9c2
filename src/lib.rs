use std::path::PathBuf;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod models;

pub use core::{ScanPreview, Selection, SyncConfig, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use models::{Disposition, SyncEvent, SyncReport, SyncStatus};

/// 配置目录名
pub const APP_DIR_NAME: &str = "flashsync";
/// 覆盖配置目录的环境变量
pub const HOME_ENV_VAR: &str = "FLASHSYNC_HOME";

/// 解析配置目录并确保其存在
///
/// 优先级：`FLASHSYNC_HOME` > config.json 中的 `data_path` > 平台默认目录。
pub fn resolve_config_dir() -> anyhow::Result<PathBuf> {
    let default_config_dir = dirs::config_dir();
    std::fs::create_dir_all(&default_config_dir)?;

    let config_dir = config::custom_data_path(&default_config_dir)
        .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
        .unwrap_or(default_config_dir);

    std::fs::create_dir_all(&config_dir)?;
    Ok(config_dir)
}

pub mod dirs {
    use super::{APP_DIR_NAME, HOME_ENV_VAR};
    use std::path::PathBuf;

    /// 应用的默认配置目录（不检查 `data_path`）
    pub fn config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os(HOME_ENV_VAR).filter(|h| !h.is_empty()) {
            return PathBuf::from(home);
        }
        platform_config_root()
            .map(|p| p.join(APP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR_NAME)))
    }

    fn platform_config_root() -> Option<PathBuf> {
        let home = || std::env::var_os("HOME").map(PathBuf::from);
        if cfg!(windows) {
            std::env::var_os("APPDATA").map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            home().map(|h| h.join("Library").join("Application Support"))
        } else {
            std::env::var_os("XDG_CONFIG_HOME")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| home().map(|h| h.join(".config")))
        }
    }
}
