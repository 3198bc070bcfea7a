use serde::{Serialize, Deserialize};
use std::fmt;
use std::time::Duration;
use crate::config::validation::{ValidationError, ValidationUtils, Validator};

/// 應用程序配置結構
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Validator for ApplicationConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        self.log.validate()?;
        self.redis.validate()?;

        Ok(())
    }
}

/// 日誌配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Validator for LogConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        // 驗證日誌級別
        ValidationUtils::one_of(
            &self.level.to_lowercase(),
            &["trace", "debug", "info", "warn", "error"].iter().map(|s| s.to_string()).collect::<Vec<String>>(),
            "log.level"
        )?;

        // 驗證日誌格式
        ValidationUtils::one_of(
            &self.format.to_lowercase(),
            &["pretty", "json"].iter().map(|s| s.to_string()).collect::<Vec<String>>(),
            "log.format"
        )?;

        Ok(())
    }
}

/// Redis部署模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// 單節點
    Standalone,
    /// 哨兵
    Sentinel,
    /// 靜態主從
    MasterReplica,
    /// 集群
    Cluster,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Standalone => "standalone",
            DeploymentMode::Sentinel => "sentinel",
            DeploymentMode::MasterReplica => "master-replica",
            DeploymentMode::Cluster => "cluster",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 讀取策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    /// 優先從副本讀取，沒有可用副本時回退到主節點
    ReplicaPreferred,
    /// 優先從主節點讀取，主節點不可用時回退到副本
    UpstreamPreferred,
    /// 只從主節點讀取
    Upstream,
    /// 只從副本讀取
    Replica,
}

impl fmt::Display for ReadFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadFrom::ReplicaPreferred => "replica_preferred",
            ReadFrom::UpstreamPreferred => "upstream_preferred",
            ReadFrom::Upstream => "upstream",
            ReadFrom::Replica => "replica",
        };
        f.write_str(name)
    }
}

/// 斷線期間的命令處理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectedBehavior {
    /// 斷線時直接拒絕命令（快速失敗）
    Reject,
    /// 由客戶端自動重連後再執行命令
    Reconnect,
}

/// 集群拓撲刷新配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyRefreshConfig {
    /// 週期刷新間隔（秒），None 表示關閉週期刷新
    pub periodic_refresh_secs: Option<u64>,
    /// 節點錯誤時觸發自適應刷新
    pub adaptive_refresh: bool,
    /// 兩次自適應刷新之間的最小間隔（秒）
    pub adaptive_refresh_timeout_secs: u64,
    /// 拓撲變更後關閉已不屬於集群主節點的連接
    pub close_stale_connections: bool,
}

impl Default for TopologyRefreshConfig {
    fn default() -> Self {
        Self {
            periodic_refresh_secs: Some(5),
            adaptive_refresh: true,
            adaptive_refresh_timeout_secs: 10,
            close_stale_connections: true,
        }
    }
}

impl TopologyRefreshConfig {
    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_refresh_secs.map(Duration::from_secs)
    }

    pub fn adaptive_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.adaptive_refresh_timeout_secs)
    }
}

impl Validator for TopologyRefreshConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(secs) = self.periodic_refresh_secs {
            ValidationUtils::in_range(secs, 1, 3600, "redis.topology_refresh.periodic_refresh_secs")?;
        }
        ValidationUtils::in_range(
            self.adaptive_refresh_timeout_secs,
            0,
            3600,
            "redis.topology_refresh.adaptive_refresh_timeout_secs"
        )?;

        Ok(())
    }
}

/// TCP 保活配置
///
/// idle/interval/count 未設置時沿用作業系統預設值。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub idle_secs: Option<u64>,
    pub interval_secs: Option<u64>,
    pub count: Option<u32>,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_secs: None,
            interval_secs: None,
            count: None,
        }
    }
}

impl Validator for KeepAliveConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        let tuned = self.idle_secs.is_some() || self.interval_secs.is_some() || self.count.is_some();
        ValidationUtils::check_dependency(tuned, self.enabled, "redis.keep_alive.idle_secs", "redis.keep_alive.enabled")?;

        if let Some(idle) = self.idle_secs {
            ValidationUtils::in_range(idle, 1, 7200, "redis.keep_alive.idle_secs")?;
        }
        if let Some(interval) = self.interval_secs {
            ValidationUtils::in_range(interval, 1, 600, "redis.keep_alive.interval_secs")?;
        }
        if let Some(count) = self.count {
            ValidationUtils::in_range(count, 1, 100, "redis.keep_alive.count")?;
        }

        Ok(())
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// 部署模式
    pub mode: DeploymentMode,
    /// 連接地址；集群與主從模式為逗號分隔的節點列表
    pub uri: String,
    pub command_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    pub keep_alive: KeepAliveConfig,
    pub tcp_user_timeout_secs: Option<u64>,
    pub tcp_nodelay: bool,
    pub disconnected_behavior: DisconnectedBehavior,
    pub read_from: ReadFrom,
    pub topology_refresh: TopologyRefreshConfig,
    /// 集群客戶端內部重試次數
    pub cluster_retries: u32,
    /// 掃描時每批返回的鍵數量上限
    pub scan_batch_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Standalone,
            uri: "redis://127.0.0.1:6379/0".to_string(),
            command_timeout_secs: 30,
            connection_timeout_secs: 5,
            keep_alive: KeepAliveConfig::default(),
            tcp_user_timeout_secs: None,
            tcp_nodelay: true,
            disconnected_behavior: DisconnectedBehavior::Reject,
            read_from: ReadFrom::ReplicaPreferred,
            topology_refresh: TopologyRefreshConfig::default(),
            cluster_retries: 3,
            scan_batch_size: 500,
        }
    }
}

impl RedisConfig {
    /// 以指定模式與地址建立配置，其餘使用預設值
    pub fn new(mode: DeploymentMode, uri: impl Into<String>) -> Self {
        Self {
            mode,
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// 獲取命令超時持續時間
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// 獲取連接超時持續時間
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn tcp_user_timeout(&self) -> Option<Duration> {
        self.tcp_user_timeout_secs.map(Duration::from_secs)
    }

    pub fn with_read_from(mut self, read_from: ReadFrom) -> Self {
        self.read_from = read_from;
        self
    }

    pub fn with_disconnected_behavior(mut self, behavior: DisconnectedBehavior) -> Self {
        self.disconnected_behavior = behavior;
        self
    }

    pub fn with_timeouts(mut self, connection_timeout_secs: u64, command_timeout_secs: u64) -> Self {
        self.connection_timeout_secs = connection_timeout_secs;
        self.command_timeout_secs = command_timeout_secs;
        self
    }
}

impl Validator for RedisConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        // 驗證Redis配置
        ValidationUtils::not_empty(&self.uri, "redis.uri")?;
        match self.mode {
            DeploymentMode::Standalone => {
                ValidationUtils::has_scheme(&self.uri, &["redis", "rediss"], "redis.uri")?
            }
            DeploymentMode::Sentinel => ValidationUtils::has_scheme(
                &self.uri,
                &["redis-sentinel", "rediss-sentinel"],
                "redis.uri",
            )?,
            // 節點列表在構建連接時解析
            DeploymentMode::MasterReplica | DeploymentMode::Cluster => {}
        }
        // 只有單節點模式有自動重連的連接管理器
        if self.mode != DeploymentMode::Standalone && self.disconnected_behavior != DisconnectedBehavior::Reject {
            return Err(ValidationError::InvalidValue(format!(
                "redis.disconnected_behavior 在 {} 模式只能為 reject",
                self.mode
            )));
        }
        ValidationUtils::in_range(self.command_timeout_secs, 1, 3600, "redis.command_timeout_secs")?;
        ValidationUtils::in_range(self.connection_timeout_secs, 1, 60, "redis.connection_timeout_secs")?;
        if let Some(user_timeout) = self.tcp_user_timeout_secs {
            ValidationUtils::in_range(user_timeout, 1, 3600, "redis.tcp_user_timeout_secs")?;
        }
        ValidationUtils::in_range(self.cluster_retries, 0, 16, "redis.cluster_retries")?;
        ValidationUtils::in_range(self.scan_batch_size, 1, 100_000, "redis.scan_batch_size")?;
        self.keep_alive.validate()?;
        self.topology_refresh.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_redis_config_is_valid() {
        let config = RedisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.read_from, ReadFrom::ReplicaPreferred);
        assert_eq!(config.disconnected_behavior, DisconnectedBehavior::Reject);
        assert_eq!(config.scan_batch_size, 500);
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = RedisConfig::default();
        config.scan_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = RedisConfig::default();
        config.uri = "  ".to_string();
        assert!(matches!(config.validate(), Err(ValidationError::MissingField(_))));

        let config = RedisConfig::new(DeploymentMode::Sentinel, "redis://127.0.0.1:6379");
        assert!(matches!(config.validate(), Err(ValidationError::InvalidValue(_))));

        let config = RedisConfig::new(DeploymentMode::Cluster, "10.0.0.1:7001,10.0.0.2:7002");
        assert!(config.validate().is_ok());

        let mut config = RedisConfig::default();
        config.topology_refresh.periodic_refresh_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_only_for_standalone() {
        let config = RedisConfig::default().with_disconnected_behavior(DisconnectedBehavior::Reconnect);
        assert!(config.validate().is_ok());

        let config = RedisConfig::new(DeploymentMode::Cluster, "10.0.0.1:7001")
            .with_disconnected_behavior(DisconnectedBehavior::Reconnect);
        assert!(matches!(config.validate(), Err(ValidationError::InvalidValue(_))));
    }

    #[test]
    fn test_keep_alive_tuning_requires_enabled() {
        let keep_alive = KeepAliveConfig {
            enabled: false,
            idle_secs: Some(60),
            interval_secs: None,
            count: None,
        };
        assert!(matches!(
            keep_alive.validate(),
            Err(ValidationError::DependencyError { .. })
        ));
    }

    #[test]
    fn test_deserialize_partial_section() {
        let json = r#"{ "mode": "cluster", "uri": "10.0.0.1:7001,10.0.0.2:7002", "read_from": "upstream_preferred" }"#;
        let config: RedisConfig = serde_json::from_str(json).expect("無法解析配置");
        assert_eq!(config.mode, DeploymentMode::Cluster);
        assert_eq!(config.read_from, ReadFrom::UpstreamPreferred);
        assert_eq!(config.connection_timeout_secs, 5);
        assert!(config.topology_refresh.adaptive_refresh);
    }

    #[test]
    fn test_log_config_validation() {
        let log = LogConfig {
            level: "verbose".to_string(),
            format: "pretty".to_string(),
        };
        assert!(log.validate().is_err());
        assert!(LogConfig::default().validate().is_ok());
    }
}
