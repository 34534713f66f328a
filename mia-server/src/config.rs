//! 服务器配置
//!
//! 配置来源按优先级从低到高：内置默认值、配置文件、`MIA_`前缀环境变量。

use config::{Config, Environment, File};
use mia_core::{MiaError, Result};
use mia_ingest::IngestConfig;
use serde::{Deserialize, Serialize};

/// 服务器完整配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Web服务配置
    #[serde(default)]
    pub web: WebConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,
    /// 摄取流水线配置
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Web服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// 监听主机
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 影像落盘根目录
    #[serde(default = "default_storage_root")]
    pub root_path: String,
    /// multipart上传暂存目录
    #[serde(default = "default_spool_path")]
    pub spool_path: String,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres连接串，缺省时使用内存存储库
    #[serde(default)]
    pub url: Option<String>,
    /// 最大连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_storage_root() -> String {
    "./data/images".to_string()
}

fn default_spool_path() -> String {
    "./data/spool".to_string()
}

fn default_max_connections() -> u32 {
    20
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_path: default_storage_root(),
            spool_path: default_spool_path(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl ServerConfig {
    /// 加载配置，配置文件可选
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }

        let settings = builder
            .add_source(Environment::with_prefix("MIA").separator("__"))
            .build()
            .map_err(|e| MiaError::Config(format!("配置加载失败: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| MiaError::Config(format!("配置解析失败: {}", e)))
    }
}
