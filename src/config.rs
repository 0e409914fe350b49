use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "vcs-log.toml";
const GLOBAL_CONFIG_FILE_NAME: &str = ".vcs-log.toml";

/// Config file contents (from ~/.vcs-log.toml or <storage dir>/vcs-log.toml).
/// Every field is optional so a file only overrides what it names.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub refresh: Option<RefreshSection>,

    #[serde(default)]
    pub cache: Option<CacheSection>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct RefreshSection {
    #[serde(default)]
    pub recent_commit_count: Option<usize>,
    #[serde(default)]
    pub join_attempts: Option<u32>,
    #[serde(default)]
    pub join_window_multiplier: Option<usize>,
    #[serde(default)]
    pub overlay_enabled: Option<bool>,
    #[serde(default)]
    pub overlay_commit_count: Option<usize>,
    #[serde(default)]
    pub dispose_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CacheSection {
    #[serde(default)]
    pub metadata_cache_size: Option<usize>,
    #[serde(default)]
    pub details_cache_size: Option<usize>,
    #[serde(default)]
    pub placeholder_generation_window: Option<u64>,
    #[serde(default)]
    pub task_queue_depth: Option<usize>,
}

/// Merged configuration (repo > global > defaults)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Size of the recent window fetched per root on initial load and incremental refresh
    pub recent_commit_count: usize,
    /// Incremental join attempts before falling back to a full reload
    pub join_attempts: u32,
    /// Window growth factor between join attempts
    pub join_window_multiplier: usize,
    pub overlay_enabled: bool,
    pub overlay_commit_count: usize,
    pub metadata_cache_size: usize,
    pub details_cache_size: usize,
    /// Loading placeholders this many generations behind the current one are evicted
    pub placeholder_generation_window: u64,
    pub task_queue_depth: usize,
    pub dispose_timeout: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            recent_commit_count: 1000,
            join_attempts: 2,
            join_window_multiplier: 5,
            overlay_enabled: true,
            overlay_commit_count: 100,
            metadata_cache_size: 10_000,
            details_cache_size: 500,
            placeholder_generation_window: 10,
            task_queue_depth: 10,
            dispose_timeout: Duration::from_millis(5_000),
        }
    }
}

impl LogConfig {
    /// Load configuration with precedence: repo > global > defaults
    pub fn load(storage_dir: &Path) -> Result<Self> {
        let global = match dirs::home_dir() {
            Some(home) => Self::load_file(&home.join(GLOBAL_CONFIG_FILE_NAME))
                .context("Failed to load global config")?,
            None => None,
        };
        let repo = Self::load_file(&storage_dir.join(CONFIG_FILE_NAME))
            .context("Failed to load repo config")?;

        let mut config = Self::default();
        for file in [global, repo].into_iter().flatten() {
            config.apply(file);
        }
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Option<FileConfig>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let config: FileConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(Some(config))
    }

    /// Global config location, if a home directory exists
    pub fn global_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_FILE_NAME))
    }

    fn apply(&mut self, file: FileConfig) {
        if let Some(refresh) = file.refresh {
            if let Some(v) = refresh.recent_commit_count {
                self.recent_commit_count = v.max(1);
            }
            if let Some(v) = refresh.join_attempts {
                self.join_attempts = v;
            }
            if let Some(v) = refresh.join_window_multiplier {
                self.join_window_multiplier = v.max(1);
            }
            if let Some(v) = refresh.overlay_enabled {
                self.overlay_enabled = v;
            }
            if let Some(v) = refresh.overlay_commit_count {
                self.overlay_commit_count = v.max(1);
            }
            if let Some(v) = refresh.dispose_timeout_ms {
                self.dispose_timeout = Duration::from_millis(v);
            }
        }

        if let Some(cache) = file.cache {
            if let Some(v) = cache.metadata_cache_size {
                self.metadata_cache_size = v.max(1);
            }
            if let Some(v) = cache.details_cache_size {
                self.details_cache_size = v.max(1);
            }
            if let Some(v) = cache.placeholder_generation_window {
                self.placeholder_generation_window = v;
            }
            if let Some(v) = cache.task_queue_depth {
                self.task_queue_depth = v.max(1);
            }
        }
    }
}
