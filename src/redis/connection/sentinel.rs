//! 經由哨兵發現主從節點的連接

use async_trait::async_trait;
use redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use redis::{AsyncConnectionConfig, RedisConnectionInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{DeploymentMode, RedisConfig};
use crate::redis::client::{ManagedConnection, RedisClientError};
use crate::redis::commands::{with_timeout, NodeRole};
use crate::redis::connection::{async_connection_config, ensure_reject_on_disconnect, log_connection_options};
use crate::redis::connection::replica_aware::{NodeResolver, ReplicaAwareConnection, ResolvedNode};
use crate::redis::endpoint::{EndpointKey, SentinelEndpoint};

/// 哨兵模式連接
pub type SentinelConnection = ReplicaAwareConnection<SentinelResolver>;

/// 向哨兵查詢當前主節點與副本節點
pub struct SentinelResolver {
    master_name: String,
    master: Mutex<SentinelClient>,
    replica: Mutex<SentinelClient>,
    connect_timeout: Duration,
    connection_config: AsyncConnectionConfig,
    /// 每次建立新節點連接遞增，用於區分先後連上的不同節點
    generation: AtomicU64,
}

impl SentinelResolver {
    /// 根據哨兵地址構建解析器
    ///
    /// 憑證與數據庫編號只用於數據節點，哨兵本身不需認證。
    pub fn new(
        endpoint: &SentinelEndpoint,
        connect_timeout: Duration,
        connection_config: AsyncConnectionConfig,
    ) -> Result<Self, RedisClientError> {
        if endpoint.tls {
            return Err(RedisClientError::InvalidEndpoint(format!(
                "未啟用TLS支持，無法連接 rediss-sentinel 地址: {}",
                endpoint.master_name
            )));
        }

        let build = |server_type: SentinelServerType| {
            SentinelClient::build(
                endpoint.sentinel_uris(),
                endpoint.master_name.clone(),
                Some(SentinelNodeConnectionInfo {
                    tls_mode: None,
                    redis_connection_info: Some(RedisConnectionInfo {
                        db: endpoint.db,
                        username: endpoint.username.clone(),
                        password: endpoint.password.clone(),
                        ..Default::default()
                    }),
                }),
                server_type,
            )
            .map_err(|err| {
                error!("無法構建哨兵客戶端 {}: {}", endpoint.master_name, err);
                RedisClientError::InvalidEndpoint(format!("{}: {}", endpoint.master_name, err))
            })
        };

        Ok(Self {
            master_name: endpoint.master_name.clone(),
            master: Mutex::new(build(SentinelServerType::Master)?),
            replica: Mutex::new(build(SentinelServerType::Replica)?),
            connect_timeout,
            connection_config,
            generation: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl NodeResolver for SentinelResolver {
    async fn resolve(&self, role: NodeRole) -> Result<ResolvedNode, RedisClientError> {
        let client = match role {
            NodeRole::Upstream => &self.master,
            NodeRole::Replica => &self.replica,
        };
        let mut client = client.lock().await;
        let conn = with_timeout(
            self.connect_timeout,
            "經由哨兵建立連接",
            client.get_async_connection_with_config(&self.connection_config),
        )
        .await?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let label = format!("{}:{}#{}", role.as_str(), self.master_name, generation);
        debug!("哨兵返回{}節點: {}", role.as_str(), label);
        Ok(ResolvedNode { label, conn })
    }

    fn invalidate(&self, role: NodeRole, node: &ResolvedNode) {
        warn!("{}節點 {} 失效，下次請求重新向哨兵查詢", role.as_str(), node.label);
    }
}

impl ReplicaAwareConnection<SentinelResolver> {
    /// 建立哨兵模式連接
    ///
    /// 地址格式: `redis-sentinel://[[username:]password@]host[:port][,host2[:port2]][/database]#masterId`
    pub async fn connect(uri: &str, config: &RedisConfig) -> Result<Self, RedisClientError> {
        let endpoint = EndpointKey::single(DeploymentMode::Sentinel, uri);
        info!("[構建 SentinelConnection] 開始 {}", endpoint);
        log_connection_options(&endpoint, config);
        ensure_reject_on_disconnect(&endpoint, config)?;

        let sentinel = SentinelEndpoint::parse(uri)?;
        let resolver =
            SentinelResolver::new(&sentinel, config.connection_timeout(), async_connection_config(config))?;
        let connection =
            ReplicaAwareConnection::new(endpoint, resolver, config.read_from, config.command_timeout());
        connection.warm_up().await?;

        info!("[構建 SentinelConnection] 結束 {}", connection.endpoint());
        Ok(connection)
    }
}
