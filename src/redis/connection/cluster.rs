//! 集群連接
//!
//! 普通命令交給 redis 客戶端的集群連接按槽位路由；
//! `SCAN` 沒有全集群游標，因此依序直連每個主節點掃描。

use async_trait::async_trait;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection as AsyncClusterConnection;
use redis::{IntoConnectionInfo, RedisResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{DeploymentMode, ReadFrom, RedisConfig};
use crate::redis::client::{ManagedConnection, RedisClientError, RedisOperations};
use crate::redis::commands::{self, with_timeout};
use crate::redis::connection::{ensure_reject_on_disconnect, log_connection_options, tcp_settings, Link};
use crate::redis::endpoint::{parse_node_list, EndpointKey};
use crate::redis::scan::{ScanCursor, ScanPage, ScanSource};
use crate::redis::topology::ClusterTopology;

/// 集群連接
pub struct ClusterConnection {
    endpoint: EndpointKey,
    link: Link<AsyncClusterConnection>,
    topology: Arc<ClusterTopology>,
    command_timeout: Duration,
}

impl ClusterConnection {
    /// 建立集群連接
    ///
    /// 節點列表以逗號分隔，每項為 `host:port` 或完整的 `redis://` 地址，
    /// 例如 `192.168.11.124:7001,192.168.11.124:7002`。
    pub async fn connect(nodes: &str, config: &RedisConfig) -> Result<Self, RedisClientError> {
        let uris = parse_node_list(nodes)?;
        let endpoint = EndpointKey::list(DeploymentMode::Cluster, uris.iter());
        info!("[構建 ClusterConnection] 開始 {}", endpoint);
        log_connection_options(&endpoint, config);
        ensure_reject_on_disconnect(&endpoint, config)?;

        let seed = uris[0].as_str().into_connection_info().map_err(|err| {
            error!("無效的集群節點地址 {}: {}", uris[0], err);
            RedisClientError::InvalidEndpoint(format!("{}: {}", uris[0], err))
        })?;

        let mut builder = ClusterClientBuilder::new(uris.clone())
            .connection_timeout(config.connection_timeout())
            .response_timeout(config.command_timeout())
            .retries(config.cluster_retries)
            .tcp_settings(tcp_settings(config));
        if config.read_from != ReadFrom::Upstream {
            builder = builder.read_from_replicas();
        }
        let client = builder.build().map_err(|err| {
            error!("無法構建集群客戶端 {}: {}", endpoint, err);
            RedisClientError::InvalidEndpoint(format!("{}: {}", endpoint, err))
        })?;

        let mut conn = with_timeout(
            config.connection_timeout(),
            "建立集群連接",
            client.get_async_connection(),
        )
        .await?;
        debug!("成功建立集群連接 {}", endpoint);

        let topology = Arc::new(ClusterTopology::new(endpoint.clone(), seed, config));
        let primaries = topology.refresh(&mut conn).await?;
        info!("集群 {} 共 {} 個主節點", endpoint, primaries.len());
        topology.start(conn.clone());

        info!("[構建 ClusterConnection] 結束 {}", endpoint);
        Ok(Self {
            link: Link::new(endpoint.clone(), conn),
            endpoint,
            topology,
            command_timeout: config.command_timeout(),
        })
    }

    pub fn topology(&self) -> &Arc<ClusterTopology> {
        &self.topology
    }

    async fn execute<T, Fut>(&self, operation_name: &str, future: Fut) -> Result<T, RedisClientError>
    where
        Fut: Future<Output = RedisResult<T>>,
    {
        let result = with_timeout(self.command_timeout, operation_name, future).await;
        if let Err(err) = &result {
            if err.is_connection_failure() {
                warn!("{} 在集群 {} 失敗: {}", operation_name, self.endpoint, err);
                self.refresh_after_failure().await;
            }
        }
        result
    }

    /// 節點失敗後的自適應拓撲刷新
    async fn refresh_after_failure(&self) {
        if !self.topology.should_refresh_adaptively() {
            return;
        }
        let Ok(mut conn) = self.link.checkout() else {
            return;
        };
        match self.topology.refresh(&mut conn).await {
            Ok(primaries) => debug!("自適應刷新集群拓撲 {}: {} 個主節點", self.endpoint, primaries.len()),
            Err(err) => warn!("自適應刷新集群拓撲失敗 {}: {}", self.endpoint, err),
        }
    }
}

#[async_trait]
impl ManagedConnection for ClusterConnection {
    fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    async fn close(&self) -> Result<(), RedisClientError> {
        info!("[回收 ClusterConnection] {}", self.endpoint);
        self.link.release()?;
        self.topology.clear_links();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RedisClientError> {
        self.topology.stop();
        Ok(())
    }
}

#[async_trait]
impl ScanSource for ClusterConnection {
    async fn scan_page(
        &self,
        cursor: Option<&ScanCursor>,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, RedisClientError> {
        // 已關閉的連接不再建立節點直連
        self.link.checkout()?;

        let (nodes, index, start) = match cursor {
            None => {
                let mut nodes = self.topology.primaries();
                if nodes.is_empty() {
                    let mut conn = self.link.checkout()?;
                    nodes = self.topology.refresh(&mut conn).await?;
                }
                (nodes, 0, 0)
            }
            Some(cursor) => {
                let (nodes, index) = cursor
                    .shard()
                    .filter(|_| !cursor.is_finished())
                    .ok_or_else(|| RedisClientError::InvalidCursor(format!("游標不屬於集群掃描 {}", self.endpoint)))?;
                (nodes.clone(), index, cursor.resume_token())
            }
        };

        let addr = nodes
            .get(index)
            .cloned()
            .ok_or_else(|| RedisClientError::InvalidCursor(format!("節點索引越界: {}", index)))?;
        let mut conn = self.topology.node_connection(&addr).await?;
        let reply = with_timeout(
            self.command_timeout,
            "SCAN",
            commands::scan(&mut conn, start, pattern, count),
        )
        .await;

        match reply {
            Ok((next, keys)) => {
                debug!("掃描集群節點 {} ({}/{}): {}個鍵", addr, index + 1, nodes.len(), keys.len());
                Ok(ScanPage::new(keys, ScanCursor::sharded(nodes, index, next)))
            }
            Err(err) => {
                if err.is_connection_failure() {
                    warn!("掃描集群節點 {} 失敗: {}", addr, err);
                    self.topology.forget_node(&addr);
                    self.refresh_after_failure().await;
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl RedisOperations for ClusterConnection {
    async fn get(&self, key: &str) -> Result<Option<String>, RedisClientError> {
        let mut conn = self.link.checkout()?;
        self.execute("GET", commands::get(&mut conn, key)).await
    }

    async fn geo_add(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        member: &str,
    ) -> Result<bool, RedisClientError> {
        let mut conn = self.link.checkout()?;
        self.execute("GEOADD", commands::geo_add(&mut conn, key, longitude, latitude, member))
            .await
    }

    async fn nearest_member(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_meters: f64,
    ) -> Result<Option<String>, RedisClientError> {
        let mut conn = self.link.checkout()?;
        self.execute(
            "GEORADIUS",
            commands::nearest_member(&mut conn, key, longitude, latitude, radius_meters),
        )
        .await
    }

    async fn ping(&self) -> Result<String, RedisClientError> {
        let mut conn = self.link.checkout()?;
        self.execute("PING", commands::ping(&mut conn)).await
    }

    fn is_closed(&self) -> bool {
        self.link.is_released()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_node_list_rejected() {
        let config = RedisConfig::new(DeploymentMode::Cluster, "");
        let result = ClusterConnection::connect(" ,, ", &config).await;
        assert!(matches!(result, Err(RedisClientError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_construction_error() {
        let config = RedisConfig::new(DeploymentMode::Cluster, "127.0.0.1:1").with_timeouts(1, 1);
        let result = ClusterConnection::connect("127.0.0.1:1", &config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_behavior_rejected() {
        let config = RedisConfig::new(DeploymentMode::Cluster, "10.0.0.1:7001")
            .with_disconnected_behavior(crate::config::DisconnectedBehavior::Reconnect);
        let result = ClusterConnection::connect(&config.uri, &config).await;
        assert!(matches!(result, Err(RedisClientError::InvalidArgument(_))));
    }
}
