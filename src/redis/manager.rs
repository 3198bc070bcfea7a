//! Redis連接管理器
//!
//! 進程啟動時構建一次並注入使用方；所有連接都經由註冊表建立，
//! 同一端點重複構建時返回同一個連接。

use std::sync::Arc;
use tracing::info;

use crate::config::{DeploymentMode, RedisConfig};
use crate::redis::client::{RedisClientError, RedisOperations};
use crate::redis::connection::{
    ClusterConnection, MasterReplicaConnection, SentinelConnection, StandaloneConnection,
};
use crate::redis::endpoint::{parse_node_list, EndpointKey};
use crate::redis::registry::{CloseReport, ConnectionRegistry};

/// 共享的連接句柄
pub type RedisHandle = Arc<dyn RedisOperations>;

pub struct RedisManager {
    config: RedisConfig,
    registry: ConnectionRegistry,
}

impl RedisManager {
    pub fn new(config: RedisConfig) -> Self {
        info!("初始化Redis連接管理器: 模式={}, 地址={}", config.mode, config.uri);
        Self {
            config,
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// 單節點連接
    pub async fn standalone(&self, uri: &str) -> Result<RedisHandle, RedisClientError> {
        let key = EndpointKey::single(DeploymentMode::Standalone, uri);
        self.registry
            .acquire(key, || async {
                let conn = StandaloneConnection::connect(uri, &self.config).await?;
                Ok(Arc::new(conn) as RedisHandle)
            })
            .await
    }

    /// 哨兵連接
    pub async fn sentinel(&self, uri: &str) -> Result<RedisHandle, RedisClientError> {
        let key = EndpointKey::single(DeploymentMode::Sentinel, uri);
        self.registry
            .acquire(key, || async {
                let conn = SentinelConnection::connect(uri, &self.config).await?;
                Ok(Arc::new(conn) as RedisHandle)
            })
            .await
    }

    /// 靜態主從連接，節點以逗號分隔
    pub async fn master_replica(&self, nodes: &str) -> Result<RedisHandle, RedisClientError> {
        let key = EndpointKey::list(DeploymentMode::MasterReplica, parse_node_list(nodes)?);
        self.registry
            .acquire(key, || async {
                let conn = MasterReplicaConnection::connect(nodes, &self.config).await?;
                Ok(Arc::new(conn) as RedisHandle)
            })
            .await
    }

    /// 集群連接，節點以逗號分隔
    pub async fn cluster(&self, nodes: &str) -> Result<RedisHandle, RedisClientError> {
        let key = EndpointKey::list(DeploymentMode::Cluster, parse_node_list(nodes)?);
        self.registry
            .acquire(key, || async {
                let conn = ClusterConnection::connect(nodes, &self.config).await?;
                Ok(Arc::new(conn) as RedisHandle)
            })
            .await
    }

    /// 按配置的部署模式連接配置中的地址
    pub async fn connect(&self) -> Result<RedisHandle, RedisClientError> {
        let uri = self.config.uri.clone();
        match self.config.mode {
            DeploymentMode::Standalone => self.standalone(&uri).await,
            DeploymentMode::Sentinel => self.sentinel(&uri).await,
            DeploymentMode::MasterReplica => self.master_replica(&uri).await,
            DeploymentMode::Cluster => self.cluster(&uri).await,
        }
    }

    /// 回收所有連接
    pub async fn close(&self) -> CloseReport {
        self.registry.close_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::test_config::RedisTestConfig;

    #[tokio::test]
    async fn test_invalid_endpoint_not_registered() {
        let manager = RedisManager::new(RedisConfig::default());
        let result = manager.standalone("not-a-redis-uri").await;
        assert!(matches!(result, Err(RedisClientError::InvalidEndpoint(_))));
        assert!(manager.registry().is_empty());

        let result = manager.cluster(" , ").await;
        assert!(matches!(result, Err(RedisClientError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_connect_follows_configured_mode() {
        let config = RedisConfig::new(DeploymentMode::Sentinel, "redis-sentinel://127.0.0.1:26379");
        let manager = RedisManager::new(config);
        // 缺少主節點名稱，在連接哨兵之前就會失敗
        let result = manager.connect().await;
        assert!(matches!(result, Err(RedisClientError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_repeated_standalone_build_shares_handle() {
        if !RedisTestConfig::redis_available_or_skip("test_repeated_standalone_build_shares_handle").await {
            return;
        }

        let config = RedisTestConfig::create_test_config();
        let manager = RedisManager::new(config.clone());
        let first = manager.standalone(&config.uri).await.expect("建立連接失敗");
        let second = manager.standalone(&config.uri).await.expect("建立連接失敗");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.registry().len(), 1);

        let report = manager.close().await;
        assert!(report.is_clean());
        assert_eq!(report.attempted, 1);
        assert!(first.is_closed());
        assert!(matches!(first.ping().await, Err(RedisClientError::Closed(_))));
        assert!(manager.registry().is_empty());
    }
}
