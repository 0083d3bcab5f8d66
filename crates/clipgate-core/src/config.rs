use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::platform::Platform;

/// Retry policy for transient fetch failures (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of dispatches per job (including the first).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff (e.g. 2.0).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2.0,
            max_delay_secs: 60,
        }
    }
}

/// Per-user concurrency ceiling and submission rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLimitsConfig {
    pub max_concurrent_jobs: usize,
    pub max_requests_per_window: u32,
    pub window_secs: u64,
}

impl Default for UserLimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_requests_per_window: 5,
            window_secs: 60,
        }
    }
}

/// When and for how long failing proxies are quarantined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPolicyConfig {
    /// Consecutive failures before a proxy is quarantined.
    pub failure_threshold: u32,
    pub base_quarantine_secs: u64,
    pub max_quarantine_secs: u64,
}

impl Default for ProxyPolicyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_quarantine_secs: 30,
            max_quarantine_secs: 900,
        }
    }
}

/// One egress proxy registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub id: String,
    /// Proxy URL passed to the fetch tool, e.g. `http://10.0.0.5:3128`.
    pub address: String,
}

/// External tool locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// yt-dlp binary; `yt-dlp` on PATH when unset.
    #[serde(default)]
    pub ytdlp_path: Option<PathBuf>,
    /// Subtitle generator invoked as `<cmd> <input> <output>`.
    #[serde(default)]
    pub subtitle_command: Option<String>,
}

/// Per-platform slot ceilings keyed by platform name (`[platforms]` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PlatformLimits(BTreeMap<Platform, usize>);

impl Default for PlatformLimits {
    fn default() -> Self {
        Self(
            Platform::ALL
                .into_iter()
                .map(|p| (p, p.default_max_slots()))
                .collect(),
        )
    }
}

impl PlatformLimits {
    /// Ceiling for `platform`, falling back to its built-in default when the table omits it.
    pub fn max_slots(&self, platform: Platform) -> usize {
        self.0
            .get(&platform)
            .copied()
            .unwrap_or_else(|| platform.default_max_slots())
    }

    /// Resolved ceilings for every known platform.
    pub fn resolved(&self) -> Vec<(Platform, usize)> {
        Platform::ALL
            .into_iter()
            .map(|p| (p, self.max_slots(p)))
            .collect()
    }

    pub fn set(&mut self, platform: Platform, max_slots: usize) {
        self.0.insert(platform, max_slots);
    }
}

/// Global configuration loaded from `~/.config/clipgate/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Maximum worker executions running at once across all platforms.
    pub workers: usize,
    /// Scheduler poll tick in milliseconds.
    pub poll_interval_ms: u64,
    /// A pending job denied admission for longer than this fails with `AdmissionTimeout`.
    pub max_admission_wait_secs: u64,
    /// Hard wall-clock ceiling for one worker execution.
    pub worker_timeout_secs: u64,
    /// Scratch directory for in-progress downloads (None = XDG cache dir).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Directory finished files are moved into (None = XDG data dir).
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default)]
    pub platforms: PlatformLimits,
    #[serde(default)]
    pub users: UserLimitsConfig,
    #[serde(default)]
    pub proxy_policy: ProxyPolicyConfig,
    /// Optional retry policy; if missing, built-in defaults are used.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            poll_interval_ms: 500,
            max_admission_wait_secs: 1800,
            worker_timeout_secs: 3600,
            download_dir: None,
            storage_dir: None,
            platforms: PlatformLimits::default(),
            users: UserLimitsConfig::default(),
            proxy_policy: ProxyPolicyConfig::default(),
            retry: None,
            tools: ToolsConfig::default(),
            proxies: Vec::new(),
        }
    }
}

impl GateConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn max_admission_wait(&self) -> Duration {
        Duration::from_secs(self.max_admission_wait_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs.max(1))
    }

    pub fn retry_or_default(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    /// Scratch directory for downloads, defaulting to `~/.cache/clipgate/downloads`.
    pub fn download_dir_or_default(&self) -> Result<PathBuf> {
        match &self.download_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let xdg_dirs = xdg::BaseDirectories::with_prefix("clipgate")?;
                Ok(xdg_dirs.get_cache_home().join("downloads"))
            }
        }
    }

    /// Durable storage directory, defaulting to `~/.local/share/clipgate/videos`.
    pub fn storage_dir_or_default(&self) -> Result<PathBuf> {
        match &self.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let xdg_dirs = xdg::BaseDirectories::with_prefix("clipgate")?;
                Ok(xdg_dirs.get_data_home().join("videos"))
            }
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("clipgate")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<GateConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = GateConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: GateConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = GateConfig::default();
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.users.max_concurrent_jobs, 3);
        assert_eq!(cfg.users.max_requests_per_window, 5);
        assert_eq!(cfg.proxy_policy.failure_threshold, 5);
        assert_eq!(cfg.platforms.max_slots(Platform::Kick), 2);
        assert_eq!(cfg.retry_or_default().max_attempts, 3);
        assert!(cfg.proxies.is_empty());
    }

    #[test]
    fn config_toml_roundtrip() {
        let mut cfg = GateConfig::default();
        cfg.proxies.push(ProxyConfig {
            id: "p1".to_string(),
            address: "http://10.0.0.1:3128".to_string(),
        });
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: GateConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.workers, cfg.workers);
        assert_eq!(parsed.platforms, cfg.platforms);
        assert_eq!(parsed.proxies, cfg.proxies);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            workers = 4
            poll_interval_ms = 250
            max_admission_wait_secs = 600
            worker_timeout_secs = 900

            [platforms]
            kick = 1
            zoom-clip = 6

            [users]
            max_concurrent_jobs = 2
            max_requests_per_window = 10
            window_secs = 30

            [[proxies]]
            id = "a"
            address = "http://a:8080"

            [[proxies]]
            id = "b"
            address = "socks5://b:1080"
        "#;
        let cfg: GateConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.platforms.max_slots(Platform::Kick), 1);
        assert_eq!(cfg.platforms.max_slots(Platform::ZoomClip), 6);
        // Omitted platforms keep their built-in ceiling.
        assert_eq!(cfg.platforms.max_slots(Platform::Rumble), 3);
        assert_eq!(cfg.users.max_requests_per_window, 10);
        assert_eq!(cfg.proxies.len(), 2);
        assert_eq!(cfg.proxies[1].address, "socks5://b:1080");
        assert!(cfg.retry.is_none());
        assert_eq!(cfg.proxy_policy.failure_threshold, 5);
    }

    #[test]
    fn config_toml_rejects_unknown_platform() {
        let toml = r#"
            workers = 4
            poll_interval_ms = 250
            max_admission_wait_secs = 600
            worker_timeout_secs = 900

            [platforms]
            youtube = 3
        "#;
        assert!(toml::from_str::<GateConfig>(toml).is_err());
    }

    #[test]
    fn config_toml_retry_and_tools() {
        let toml = r#"
            workers = 2
            poll_interval_ms = 1000
            max_admission_wait_secs = 60
            worker_timeout_secs = 120

            [retry]
            max_attempts = 5
            base_delay_secs = 0.5
            max_delay_secs = 15

            [tools]
            ytdlp_path = "/opt/bin/yt-dlp"
            subtitle_command = "whisper-subs"
        "#;
        let cfg: GateConfig = toml::from_str(toml).unwrap();
        let retry = cfg.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert!((retry.base_delay_secs - 0.5).abs() < 1e-9);
        assert_eq!(retry.max_delay_secs, 15);
        assert_eq!(cfg.tools.ytdlp_path.as_deref(), Some(std::path::Path::new("/opt/bin/yt-dlp")));
        assert_eq!(cfg.tools.subtitle_command.as_deref(), Some("whisper-subs"));
    }
}
