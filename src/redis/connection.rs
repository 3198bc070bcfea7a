//! 各部署模式的連接適配器
//!
//! - [`StandaloneConnection`]: 單節點
//! - [`SentinelConnection`]: 經由哨兵發現主從節點
//! - [`MasterReplicaConnection`]: 靜態主從節點列表
//! - [`ClusterConnection`]: 集群

pub mod cluster;
pub mod master_replica;
pub mod replica_aware;
pub mod sentinel;
pub mod standalone;

pub use cluster::ClusterConnection;
pub use master_replica::MasterReplicaConnection;
pub use replica_aware::ReplicaAwareConnection;
pub use sentinel::SentinelConnection;
pub use standalone::StandaloneConnection;

use parking_lot::RwLock;
use redis::io::tcp::socket2::TcpKeepalive;
use redis::io::tcp::TcpSettings;
use redis::AsyncConnectionConfig;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::{DisconnectedBehavior, RedisConfig};
use crate::redis::client::RedisClientError;
use crate::redis::endpoint::EndpointKey;

/// 可關閉的連接槽
///
/// 關閉後槽內連接被丟棄，之後的任何取用都會返回 [`RedisClientError::Closed`]。
pub(crate) struct Link<C> {
    endpoint: EndpointKey,
    conn: RwLock<Option<C>>,
}

impl<C: Clone> Link<C> {
    pub(crate) fn new(endpoint: EndpointKey, conn: C) -> Self {
        Self {
            endpoint,
            conn: RwLock::new(Some(conn)),
        }
    }

    /// 取出連接副本（多路復用連接的克隆共享同一條底層連接）
    pub(crate) fn checkout(&self) -> Result<C, RedisClientError> {
        self.conn
            .read()
            .clone()
            .ok_or_else(|| RedisClientError::Closed(self.endpoint.to_string()))
    }

    pub(crate) fn release(&self) -> Result<(), RedisClientError> {
        match self.conn.write().take() {
            Some(conn) => {
                drop(conn);
                Ok(())
            }
            None => Err(RedisClientError::Closed(self.endpoint.to_string())),
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.conn.read().is_none()
    }
}

/// 記錄構建時生效的連接選項
pub(crate) fn log_connection_options(endpoint: &EndpointKey, config: &RedisConfig) {
    debug!(
        "連接選項 {}: 命令超時={}秒, 連接超時={}秒, keepalive={}, tcp_nodelay={}, tcp_user_timeout={:?}, 斷線行為={:?}, 讀取策略={}",
        endpoint,
        config.command_timeout_secs,
        config.connection_timeout_secs,
        config.keep_alive.enabled,
        config.tcp_nodelay,
        config.tcp_user_timeout_secs,
        config.disconnected_behavior,
        config.read_from
    );
}

/// 由配置生成套接字選項，所有模式的數據節點連接共用
///
/// keepalive 細項未設置時沿用作業系統預設值。
pub(crate) fn tcp_settings(config: &RedisConfig) -> TcpSettings {
    let mut settings = TcpSettings::default().set_nodelay(config.tcp_nodelay);

    if config.keep_alive.enabled {
        let mut keepalive = TcpKeepalive::new();
        if let Some(idle) = config.keep_alive.idle_secs {
            keepalive = keepalive.with_time(Duration::from_secs(idle));
        }
        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        {
            if let Some(interval) = config.keep_alive.interval_secs {
                keepalive = keepalive.with_interval(Duration::from_secs(interval));
            }
            if let Some(count) = config.keep_alive.count {
                keepalive = keepalive.with_retries(count);
            }
        }
        settings = settings.set_keepalive(keepalive);
    }

    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    {
        if let Some(user_timeout) = config.tcp_user_timeout() {
            settings = settings.set_user_timeout(user_timeout);
        }
    }

    settings
}

/// 單節點連接配置，帶上套接字選項
pub(crate) fn async_connection_config(config: &RedisConfig) -> AsyncConnectionConfig {
    AsyncConnectionConfig::new().set_tcp_settings(tcp_settings(config))
}

/// 只有單節點模式支援斷線後自動重連，其他模式必須快速失敗
pub(crate) fn ensure_reject_on_disconnect(
    endpoint: &EndpointKey,
    config: &RedisConfig,
) -> Result<(), RedisClientError> {
    if config.disconnected_behavior != DisconnectedBehavior::Reject {
        error!("{} 不支援斷線行為 {:?}", endpoint, config.disconnected_behavior);
        return Err(RedisClientError::InvalidArgument(format!(
            "{} 模式只支援 disconnected_behavior = reject",
            endpoint.mode()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentMode;

    #[test]
    fn test_link_fails_fast_after_release() {
        let link = Link::new(EndpointKey::single(DeploymentMode::Standalone, "redis://a"), 7u32);
        assert_eq!(link.checkout().expect("連接應該可用"), 7);

        link.release().expect("首次關閉應該成功");
        assert!(link.is_released());
        assert!(matches!(link.checkout(), Err(RedisClientError::Closed(_))));
        assert!(matches!(link.release(), Err(RedisClientError::Closed(_))));
    }

    #[test]
    fn test_tcp_settings_follow_config() {
        let mut config = RedisConfig::default();
        config.keep_alive.idle_secs = Some(30);
        config.keep_alive.interval_secs = Some(5);
        config.keep_alive.count = Some(3);
        config.tcp_user_timeout_secs = Some(20);

        let settings = tcp_settings(&config);
        assert!(settings.nodelay());
        assert!(settings.keepalive().is_some());
        #[cfg(target_os = "linux")]
        assert_eq!(settings.user_timeout(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_tcp_settings_without_keepalive() {
        let mut config = RedisConfig::default();
        config.keep_alive.enabled = false;
        config.tcp_nodelay = false;

        let settings = tcp_settings(&config);
        assert!(!settings.nodelay());
        assert!(settings.keepalive().is_none());
        #[cfg(target_os = "linux")]
        assert_eq!(settings.user_timeout(), None);
    }

    #[test]
    fn test_reconnect_rejected_outside_standalone() {
        let endpoint = EndpointKey::list(DeploymentMode::Cluster, ["10.0.0.1:7001"].iter());
        assert!(ensure_reject_on_disconnect(&endpoint, &RedisConfig::default()).is_ok());

        let config = RedisConfig::default().with_disconnected_behavior(DisconnectedBehavior::Reconnect);
        assert!(matches!(
            ensure_reject_on_disconnect(&endpoint, &config),
            Err(RedisClientError::InvalidArgument(_))
        ));
    }
}
