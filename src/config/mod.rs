use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 注入模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// 关闭注入，已注入的进程会被强制退出
    Disable,
    /// 动态 attach 注入
    #[default]
    Dynamic,
    /// 启动参数静态注入（-javaagent），守护进程只负责参数更新
    Static,
}

/// 守护进程配置快照，一个监控周期内只读；新配置只能通过重启生效
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    pub agent_mode: AgentMode,

    /// 进程扫描周期（秒）
    pub scan_ticker: u64,
    /// 进程存活检测周期（秒）
    pub pid_exists_ticker: u64,
    /// 进程信息上报周期（小时）
    pub log_report_ticker: u64,
    /// 心跳周期（分钟）
    pub heart_beat_report_ticker: u64,
    /// 定时重启周期（分钟），一般一个月以上
    pub reboot_ticker: u64,

    pub namespace_id: String,
    /// 为空时使用主机名
    pub data_id: String,
    /// Nacos 服务端地址列表，为空时不开启远程配置
    pub ip_addrs: Vec<String>,

    /// 匹配 java 可执行文件名的正则
    pub java_selector: String,
    pub java_home: Option<String>,
    pub attach_timeout_secs: u64,
    pub token_wait_secs: u64,

    /// 参数更新时推送给 agent 的配置
    pub parameters: HashMap<String, String>,
    pub config_version: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            agent_mode: AgentMode::Dynamic,
            scan_ticker: 30,
            pid_exists_ticker: 10,
            log_report_ticker: 6,
            heart_beat_report_ticker: 5,
            reboot_ticker: 43_200,
            namespace_id: String::new(),
            data_id: String::new(),
            ip_addrs: Vec::new(),
            java_selector: r"^java(\.exe)?$".to_string(),
            java_home: None,
            attach_timeout_secs: 60,
            token_wait_secs: 30,
            parameters: HashMap::new(),
            config_version: String::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let cfg: DaemonConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 读取配置文件；文件不存在时使用默认配置
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_json(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("[config] {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tickers = [
            ("scanTicker", self.scan_ticker),
            ("pidExistsTicker", self.pid_exists_ticker),
            ("logReportTicker", self.log_report_ticker),
            ("heartBeatReportTicker", self.heart_beat_report_ticker),
            ("rebootTicker", self.reboot_ticker),
        ];
        for (field, value) in tickers {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        if let Err(e) = regex::Regex::new(&self.java_selector) {
            return Err(ConfigError::Invalid {
                field: "javaSelector",
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    pub fn is_disable(&self) -> bool {
        self.agent_mode == AgentMode::Disable
    }

    pub fn is_dynamic_mode(&self) -> bool {
        self.agent_mode == AgentMode::Dynamic
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_ticker)
    }

    pub fn pid_exists_interval(&self) -> Duration {
        Duration::from_secs(self.pid_exists_ticker)
    }

    pub fn log_report_interval(&self) -> Duration {
        Duration::from_secs(self.log_report_ticker * 3600)
    }

    pub fn heart_beat_interval(&self) -> Duration {
        Duration::from_secs(self.heart_beat_report_ticker * 60)
    }

    pub fn reboot_interval(&self) -> Duration {
        Duration::from_secs(self.reboot_ticker * 60)
    }

    pub fn token_wait(&self) -> Duration {
        Duration::from_secs(self.token_wait_secs)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.attach_timeout_secs)
    }

    /// dataId 为空时使用主机名
    pub fn effective_data_id(&self, host_name: &str) -> String {
        if self.data_id.is_empty() {
            host_name.to_string()
        } else {
            self.data_id.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let cfg = DaemonConfig::from_json(r#"{"agentMode":"disable","scanTicker":5}"#).unwrap();
        assert_eq!(cfg.agent_mode, AgentMode::Disable);
        assert_eq!(cfg.scan_ticker, 5);
        assert_eq!(cfg.pid_exists_ticker, 10);
        assert!(cfg.is_disable());
        assert!(!cfg.is_dynamic_mode());
    }

    #[test]
    fn test_interval_units() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.log_report_interval(), Duration::from_secs(6 * 3600));
        assert_eq!(cfg.heart_beat_interval(), Duration::from_secs(300));
        assert_eq!(cfg.reboot_interval(), Duration::from_secs(43_200 * 60));
    }

    #[test]
    fn test_zero_ticker_rejected() {
        let err = DaemonConfig::from_json(r#"{"heartBeatReportTicker":0}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "heartBeatReportTicker", .. }
        ));
    }

    #[test]
    fn test_bad_selector_rejected() {
        let err = DaemonConfig::from_json(r#"{"javaSelector":"(java"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "javaSelector", .. }));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.agent_mode, AgentMode::Dynamic);
    }

    #[test]
    fn test_effective_data_id() {
        let mut cfg = DaemonConfig::default();
        assert_eq!(cfg.effective_data_id("host-a"), "host-a");
        cfg.data_id = "rasp".to_string();
        assert_eq!(cfg.effective_data_id("host-a"), "rasp");
    }
}
