//! 靜態主從節點列表連接
//!
//! 構建時連接列表中的每個節點並以 `INFO replication` 判斷角色，
//! 列表中必須恰好有一個主節點。

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Client as RedisClient};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{DeploymentMode, RedisConfig};
use crate::redis::client::{ManagedConnection, RedisClientError};
use crate::redis::commands::{self, with_timeout, NodeRole};
use crate::redis::connection::{async_connection_config, ensure_reject_on_disconnect, log_connection_options};
use crate::redis::connection::replica_aware::{NodeResolver, ReplicaAwareConnection, ResolvedNode};
use crate::redis::endpoint::{parse_node_list, EndpointKey};

/// 靜態主從模式連接
pub type MasterReplicaConnection = ReplicaAwareConnection<MasterReplicaResolver>;

/// 單個數據節點；連接失效後在下次解析時重新建立
struct NodeSlot {
    label: String,
    client: RedisClient,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl NodeSlot {
    async fn connection(
        &self,
        connect_timeout: Duration,
        connection_config: &AsyncConnectionConfig,
    ) -> Result<ResolvedNode, RedisClientError> {
        let cached = self.conn.lock().clone();
        let conn = match cached {
            Some(conn) => conn,
            None => {
                let conn = with_timeout(
                    connect_timeout,
                    "建立Redis連接",
                    self.client.get_multiplexed_async_connection_with_config(connection_config),
                )
                .await?;
                *self.conn.lock() = Some(conn.clone());
                debug!("重新連接節點 {}", self.label);
                conn
            }
        };
        Ok(ResolvedNode {
            label: self.label.clone(),
            conn,
        })
    }

    fn reset(&self) {
        self.conn.lock().take();
    }
}

/// 按構建時發現的角色返回節點，副本之間輪換
pub struct MasterReplicaResolver {
    upstream: NodeSlot,
    replicas: Vec<NodeSlot>,
    next_replica: AtomicUsize,
    connect_timeout: Duration,
    connection_config: AsyncConnectionConfig,
}

impl MasterReplicaResolver {
    /// 連接每個節點並按角色分類
    ///
    /// 無法連接或無法判斷角色的節點只記錄警告並跳過。
    pub async fn discover(uris: &[String], config: &RedisConfig) -> Result<Self, RedisClientError> {
        let connect_timeout = config.connection_timeout();
        let connection_config = async_connection_config(config);
        let mut upstreams = Vec::new();
        let mut replicas = Vec::new();

        for uri in uris {
            let client = RedisClient::open(uri.as_str()).map_err(|err| {
                error!("無效的Redis地址 {}: {}", uri, err);
                RedisClientError::InvalidEndpoint(format!("{}: {}", uri, err))
            })?;
            let label = client.get_connection_info().addr.to_string();

            let mut conn = match with_timeout(
                connect_timeout,
                "建立Redis連接",
                client.get_multiplexed_async_connection_with_config(&connection_config),
            )
            .await
            {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("無法連接節點 {}，已跳過: {}", label, err);
                    continue;
                }
            };

            let role = match with_timeout(connect_timeout, "INFO replication", commands::replication_role(&mut conn)).await {
                Ok(Some(role)) => role,
                Ok(None) => {
                    warn!("節點 {} 未報告複製角色，已跳過", label);
                    continue;
                }
                Err(err) => {
                    warn!("無法查詢節點 {} 的角色，已跳過: {}", label, err);
                    continue;
                }
            };
            info!("節點 {} 角色: {}", label, role.as_str());

            let slot = NodeSlot {
                label,
                client,
                conn: Mutex::new(Some(conn)),
            };
            match role {
                NodeRole::Upstream => upstreams.push(slot),
                NodeRole::Replica => replicas.push(slot),
            }
        }

        Self::from_slots(upstreams, replicas, connect_timeout, connection_config)
    }

    fn from_slots(
        mut upstreams: Vec<NodeSlot>,
        replicas: Vec<NodeSlot>,
        connect_timeout: Duration,
        connection_config: AsyncConnectionConfig,
    ) -> Result<Self, RedisClientError> {
        if upstreams.len() > 1 {
            let labels: Vec<&str> = upstreams.iter().map(|slot| slot.label.as_str()).collect();
            return Err(RedisClientError::TopologyError(format!(
                "節點列表中有多個主節點: {}",
                labels.join(", ")
            )));
        }
        let upstream = upstreams
            .pop()
            .ok_or_else(|| RedisClientError::NoAvailableNode("節點列表中沒有可用的主節點".to_string()))?;
        if replicas.is_empty() {
            warn!("節點列表中沒有副本節點，讀命令將只發往主節點 {}", upstream.label);
        }

        Ok(Self {
            upstream,
            replicas,
            next_replica: AtomicUsize::new(0),
            connect_timeout,
            connection_config,
        })
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }
}

#[async_trait]
impl NodeResolver for MasterReplicaResolver {
    async fn resolve(&self, role: NodeRole) -> Result<ResolvedNode, RedisClientError> {
        match role {
            NodeRole::Upstream => self.upstream.connection(self.connect_timeout, &self.connection_config).await,
            NodeRole::Replica => {
                let start = self.next_replica.load(Ordering::Acquire);
                let mut last_error = None;
                for offset in 0..self.replicas.len() {
                    let index = (start + offset) % self.replicas.len();
                    match self.replicas[index].connection(self.connect_timeout, &self.connection_config).await {
                        Ok(node) => {
                            self.next_replica.store(index, Ordering::Release);
                            return Ok(node);
                        }
                        Err(err) => {
                            warn!("副本節點 {} 不可用: {}", self.replicas[index].label, err);
                            last_error = Some(err);
                        }
                    }
                }
                Err(last_error.unwrap_or_else(|| RedisClientError::NoAvailableNode("沒有副本節點".to_string())))
            }
        }
    }

    fn invalidate(&self, role: NodeRole, node: &ResolvedNode) {
        match role {
            NodeRole::Upstream => self.upstream.reset(),
            NodeRole::Replica => {
                if let Some(index) = self.replicas.iter().position(|slot| slot.label == node.label) {
                    self.replicas[index].reset();
                    if !self.replicas.is_empty() {
                        self.next_replica
                            .store((index + 1) % self.replicas.len(), Ordering::Release);
                    }
                }
            }
        }
    }

    fn release(&self) {
        self.upstream.reset();
        for slot in &self.replicas {
            slot.reset();
        }
    }
}

impl ReplicaAwareConnection<MasterReplicaResolver> {
    /// 建立靜態主從連接
    ///
    /// 節點列表以逗號分隔，每項為 `host:port` 或完整的 `redis://` 地址。
    pub async fn connect(nodes: &str, config: &RedisConfig) -> Result<Self, RedisClientError> {
        let uris = parse_node_list(nodes)?;
        let endpoint = EndpointKey::list(DeploymentMode::MasterReplica, uris.iter());
        info!("[構建 MasterReplicaConnection] 開始 {}", endpoint);
        log_connection_options(&endpoint, config);
        ensure_reject_on_disconnect(&endpoint, config)?;

        let resolver = MasterReplicaResolver::discover(&uris, config).await?;
        info!(
            "主從拓撲 {}: 主節點 {}, 副本 {} 個",
            endpoint,
            resolver.upstream.label,
            resolver.replica_count()
        );
        let connection =
            ReplicaAwareConnection::new(endpoint, resolver, config.read_from, config.command_timeout());
        connection.warm_up().await?;

        info!("[構建 MasterReplicaConnection] 結束 {}", connection.endpoint());
        Ok(connection)
    }
}
