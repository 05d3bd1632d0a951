use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "cosmos.toml";
pub const DATA_DIR_ENV: &str = "COSMOS_DATA_DIR";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CosmosConfig {
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// GPU host reachable over SSH. Empty means "not configured".
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub ssh_key: Option<String>,

    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    #[serde(default = "default_docker_image")]
    pub docker_image: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_user() -> String {
    "ubuntu".to_string()
}
fn default_port() -> u16 {
    22
}
fn default_remote_dir() -> String {
    "/home/ubuntu/cosmos-transfer1".to_string()
}
fn default_docker_image() -> String {
    "nvcr.io/ubuntu/cosmos-transfer1:latest".to_string()
}
fn default_database() -> String {
    "cosmos.db".to_string()
}
fn default_outputs_dir() -> String {
    "outputs".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: default_user(),
            port: default_port(),
            ssh_key: None,
            remote_dir: default_remote_dir(),
            docker_image: default_docker_image(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            outputs_dir: default_outputs_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RemoteConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// `user@host` target for ssh/scp.
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

impl CosmosConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config: CosmosConfig = toml::from_str(&content)
            .map_err(|e| anyhow!("invalid {}: {}", config_path.display(), e))?;
        Ok(config)
    }

    /// Log the effective configuration. Called once logging is installed.
    pub fn log_summary(&self, data_dir: &Path) {
        info!(
            "Loaded config: data_dir={}, remote={}, database={}, outputs={}",
            data_dir.display(),
            if self.remote.is_configured() {
                self.remote.target()
            } else {
                "<unset>".to_string()
            },
            self.database_path(data_dir).display(),
            self.outputs_dir(data_dir).display()
        );
    }

    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        resolve(data_dir, &self.paths.database)
    }

    pub fn outputs_dir(&self, data_dir: &Path) -> PathBuf {
        resolve(data_dir, &self.paths.outputs_dir)
    }
}

fn resolve(base: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// `$COSMOS_DATA_DIR`, else `~/.cosmos`.
pub fn data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".cosmos"))
        .ok_or_else(|| anyhow!("could not determine home directory; set {}", DATA_DIR_ENV))
}
