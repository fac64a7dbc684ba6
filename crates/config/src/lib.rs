//! 应用配置
//!
//! 配置来源按优先级从低到高：内置默认值、TOML配置文件、
//! `DISPATCHD__` 前缀的环境变量。

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use dispatchd_errors::{DispatchError, DispatchResult};

/// HTTP服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 分发引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    /// 未显式指定时的批量大小
    pub default_batch_size: u32,
    /// 单次分配的批量上限
    pub max_batch_size: u32,
    /// 历史遗留的失败阈值，超时重试策略不再使用
    pub task_failure_threshold: u32,
    /// 处理超时判定（毫秒）
    pub processing_timeout_ms: u64,
    /// 超时巡检周期（秒），0 表示不启动内置巡检
    pub sweep_interval_seconds: u64,
}

/// 快照持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 轮次快照目录，每个实例独占一个目录
    pub data_dir: String,
}

/// 飞书通知配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub feishu_webhook_url: Option<String>,
    pub report_interval_minutes: u32,
    /// Webhook请求超时（秒）
    pub request_timeout_seconds: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    /// pretty 或 json
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub dispatch: DispatchSection,
    pub persistence: PersistenceConfig,
    pub webhook: WebhookConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8710,
            },
            dispatch: DispatchSection {
                default_batch_size: 8,
                max_batch_size: 1000,
                task_failure_threshold: 3,
                processing_timeout_ms: 600_000,
                sweep_interval_seconds: 60,
            },
            persistence: PersistenceConfig {
                data_dir: "data/rounds".to_string(),
            },
            webhook: WebhookConfig {
                feishu_webhook_url: None,
                report_interval_minutes: 240,
                request_timeout_seconds: 10,
            },
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// 加载配置；未找到配置文件时使用内置默认值
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = AppConfig::default();
        let mut builder = ConfigBuilder::builder()
            .set_default("server.host", defaults.server.host.clone())?
            .set_default("server.port", defaults.server.port as i64)?
            .set_default(
                "dispatch.default_batch_size",
                defaults.dispatch.default_batch_size as i64,
            )?
            .set_default(
                "dispatch.max_batch_size",
                defaults.dispatch.max_batch_size as i64,
            )?
            .set_default(
                "dispatch.task_failure_threshold",
                defaults.dispatch.task_failure_threshold as i64,
            )?
            .set_default(
                "dispatch.processing_timeout_ms",
                defaults.dispatch.processing_timeout_ms as i64,
            )?
            .set_default(
                "dispatch.sweep_interval_seconds",
                defaults.dispatch.sweep_interval_seconds as i64,
            )?
            .set_default("persistence.data_dir", defaults.persistence.data_dir.clone())?
            .set_default(
                "webhook.report_interval_minutes",
                defaults.webhook.report_interval_minutes as i64,
            )?
            .set_default(
                "webhook.request_timeout_seconds",
                defaults.webhook.request_timeout_seconds as i64,
            )?
            .set_default("log.level", defaults.log.level.clone())?
            .set_default("log.format", defaults.log.format.clone())?;

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            for path in ["config/dispatchd.toml", "dispatchd.toml"] {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("DISPATCHD")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if self.server.host.trim().is_empty() {
            return Err(DispatchError::config_error("server.host 不能为空"));
        }
        if self.dispatch.default_batch_size == 0 {
            return Err(DispatchError::config_error("dispatch.default_batch_size 必须大于 0"));
        }
        if self.dispatch.max_batch_size == 0 {
            return Err(DispatchError::config_error("dispatch.max_batch_size 必须大于 0"));
        }
        if self.dispatch.default_batch_size > self.dispatch.max_batch_size {
            return Err(DispatchError::config_error(
                "dispatch.default_batch_size 不能超过 max_batch_size",
            ));
        }
        if self.persistence.data_dir.trim().is_empty() {
            return Err(DispatchError::config_error("persistence.data_dir 不能为空"));
        }
        if let Some(url) = &self.webhook.feishu_webhook_url {
            if !url.starts_with("https://") {
                return Err(DispatchError::config_error(
                    "webhook.feishu_webhook_url 必须是 https:// 地址",
                ));
            }
        }
        if self.webhook.request_timeout_seconds == 0 {
            return Err(DispatchError::config_error(
                "webhook.request_timeout_seconds 必须大于 0",
            ));
        }
        match self.log.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(DispatchError::config_error(format!("不支持的日志格式: {other}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.dispatch.default_batch_size, 8);
        assert_eq!(config.dispatch.max_batch_size, 1000);
        assert_eq!(config.webhook.report_interval_minutes, 240);
        assert_eq!(config.server.port, 8710);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_from_toml() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 9000

[dispatch]
default_batch_size = 4
max_batch_size = 100
task_failure_threshold = 3
processing_timeout_ms = 30000
sweep_interval_seconds = 10

[persistence]
data_dir = "/var/lib/dispatchd/rounds"

[webhook]
feishu_webhook_url = "https://open.feishu.cn/open-apis/bot/v2/hook/abc"
report_interval_minutes = 60
request_timeout_seconds = 5

[log]
level = "debug"
format = "json"
"#;
        let config = AppConfig::from_toml(toml_str).expect("解析失败");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.dispatch.default_batch_size, 4);
        assert_eq!(
            config.webhook.feishu_webhook_url.as_deref(),
            Some("https://open.feishu.cn/open-apis/bot/v2/hook/abc")
        );
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_validation_rejects_bad_batch_sizes() {
        let mut config = AppConfig::default();
        config.dispatch.default_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatch.default_batch_size = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_http_webhook() {
        let mut config = AppConfig::default();
        config.webhook.feishu_webhook_url = Some("http://insecure.example.com/hook".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_log_format() {
        let mut config = AppConfig::default();
        config.log.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
