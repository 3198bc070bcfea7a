use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager, ConnectionManagerConfig, MultiplexedConnection};
use redis::{Client as RedisClient, Cmd, Pipeline, RedisFuture, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{DeploymentMode, DisconnectedBehavior, RedisConfig};
use crate::redis::client::{ManagedConnection, RedisClientError, RedisOperations};
use crate::redis::commands::{self, with_timeout};
use crate::redis::connection::{async_connection_config, log_connection_options, tcp_settings, Link};
use crate::redis::endpoint::EndpointKey;
use crate::redis::scan::{ScanCursor, ScanPage, ScanSource};

/// 單節點底層連接
///
/// `Reject` 使用多路復用連接，斷線後命令直接失敗；
/// `Reconnect` 使用連接管理器，斷線後自動重連。
#[derive(Clone)]
pub enum StandaloneLink {
    Multiplexed(MultiplexedConnection),
    Managed(ConnectionManager),
}

impl ConnectionLike for StandaloneLink {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            StandaloneLink::Multiplexed(conn) => conn.req_packed_command(cmd),
            StandaloneLink::Managed(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            StandaloneLink::Multiplexed(conn) => conn.req_packed_commands(cmd, offset, count),
            StandaloneLink::Managed(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            StandaloneLink::Multiplexed(conn) => conn.get_db(),
            StandaloneLink::Managed(conn) => conn.get_db(),
        }
    }
}

/// 單節點連接
pub struct StandaloneConnection {
    endpoint: EndpointKey,
    link: Link<StandaloneLink>,
    command_timeout: Duration,
}

impl StandaloneConnection {
    /// 建立單節點連接
    ///
    /// 地址格式: `redis://[[username:]password@]host[:port][/database]`
    pub async fn connect(uri: &str, config: &RedisConfig) -> Result<Self, RedisClientError> {
        let endpoint = EndpointKey::single(DeploymentMode::Standalone, uri);
        info!("[構建 StandaloneConnection] 開始 {}", endpoint);
        log_connection_options(&endpoint, config);

        let client = RedisClient::open(uri.trim()).map_err(|err| {
            error!("無效的Redis地址 {}: {}", uri, err);
            RedisClientError::InvalidEndpoint(format!("{}: {}", uri, err))
        })?;

        let connect_timeout = config.connection_timeout();
        let link = match config.disconnected_behavior {
            DisconnectedBehavior::Reject => StandaloneLink::Multiplexed(
                with_timeout(
                    connect_timeout,
                    "建立Redis連接",
                    client.get_multiplexed_async_connection_with_config(&async_connection_config(config)),
                )
                .await?,
            ),
            DisconnectedBehavior::Reconnect => {
                let manager_config = ConnectionManagerConfig::new().set_tcp_settings(tcp_settings(config));
                StandaloneLink::Managed(
                    with_timeout(
                        connect_timeout,
                        "建立Redis連接",
                        ConnectionManager::new_with_config(client, manager_config),
                    )
                    .await?,
                )
            }
        };
        debug!("成功建立Redis連接 {}", endpoint);

        info!("[構建 StandaloneConnection] 結束 {}", endpoint);
        Ok(Self {
            link: Link::new(endpoint.clone(), link),
            endpoint,
            command_timeout: config.command_timeout(),
        })
    }
}

#[async_trait]
impl ManagedConnection for StandaloneConnection {
    fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    async fn close(&self) -> Result<(), RedisClientError> {
        info!("[回收 StandaloneConnection] {}", self.endpoint);
        self.link.release()
    }
}

#[async_trait]
impl ScanSource for StandaloneConnection {
    async fn scan_page(
        &self,
        cursor: Option<&ScanCursor>,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, RedisClientError> {
        let start = match cursor {
            None => 0,
            Some(cursor) if cursor.is_single_node() && !cursor.is_finished() => cursor.resume_token(),
            Some(_) => {
                return Err(RedisClientError::InvalidCursor(format!(
                    "游標不屬於單節點掃描 {}",
                    self.endpoint
                )))
            }
        };

        let mut conn = self.link.checkout()?;
        let (next, keys) = with_timeout(
            self.command_timeout,
            "SCAN",
            commands::scan(&mut conn, start, pattern, count),
        )
        .await?;
        Ok(ScanPage::from_reply(next, keys))
    }
}

#[async_trait]
impl RedisOperations for StandaloneConnection {
    async fn get(&self, key: &str) -> Result<Option<String>, RedisClientError> {
        let mut conn = self.link.checkout()?;
        debug!("Getting Redis key: {}", key);
        with_timeout(self.command_timeout, "GET", commands::get(&mut conn, key)).await
    }

    async fn geo_add(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        member: &str,
    ) -> Result<bool, RedisClientError> {
        let mut conn = self.link.checkout()?;
        with_timeout(
            self.command_timeout,
            "GEOADD",
            commands::geo_add(&mut conn, key, longitude, latitude, member),
        )
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
        with_timeout(
            self.command_timeout,
            "GEORADIUS",
            commands::nearest_member(&mut conn, key, longitude, latitude, radius_meters),
        )
        .await
    }

    async fn ping(&self) -> Result<String, RedisClientError> {
        let mut conn = self.link.checkout()?;
        debug!("Pinging Redis server");
        with_timeout(self.command_timeout, "PING", commands::ping(&mut conn)).await
    }

    fn is_closed(&self) -> bool {
        self.link.is_released()
    }
}
