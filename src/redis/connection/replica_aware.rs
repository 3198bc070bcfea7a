//! 主從感知連接
//!
//! 讀命令按讀取策略選擇節點角色並在連接失敗時回退，寫命令只發往主節點。
//! 節點的發現方式（哨兵或靜態列表）由 [`NodeResolver`] 決定。

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::RedisResult;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ReadFrom;
use crate::redis::client::{ManagedConnection, RedisClientError, RedisOperations};
use crate::redis::commands::{self, with_timeout, NodeRole};
use crate::redis::endpoint::EndpointKey;
use crate::redis::scan::{ScanCursor, ScanPage, ScanSource};

/// 已解析的節點連接
#[derive(Clone)]
pub struct ResolvedNode {
    /// 節點標識，用於日誌與固定掃描游標
    pub label: String,
    pub conn: MultiplexedConnection,
}

/// 節點解析器
#[async_trait]
pub trait NodeResolver: Send + Sync + 'static {
    /// 解析指定角色的節點
    async fn resolve(&self, role: NodeRole) -> Result<ResolvedNode, RedisClientError>;

    /// 節點連接失敗時通知解析器，下次解析可換用其他節點
    fn invalidate(&self, role: NodeRole, node: &ResolvedNode);

    /// 釋放解析器持有的連接
    fn release(&self) {}
}

/// 讀取策略對應的角色嘗試順序
pub fn read_roles(read_from: ReadFrom) -> &'static [NodeRole] {
    match read_from {
        ReadFrom::ReplicaPreferred => &[NodeRole::Replica, NodeRole::Upstream],
        ReadFrom::UpstreamPreferred => &[NodeRole::Upstream, NodeRole::Replica],
        ReadFrom::Upstream => &[NodeRole::Upstream],
        ReadFrom::Replica => &[NodeRole::Replica],
    }
}

/// 主從感知連接
pub struct ReplicaAwareConnection<R: NodeResolver> {
    endpoint: EndpointKey,
    resolver: R,
    read_from: ReadFrom,
    command_timeout: Duration,
    nodes: RwLock<HashMap<NodeRole, ResolvedNode>>,
    closed: AtomicBool,
}

impl<R: NodeResolver> ReplicaAwareConnection<R> {
    pub(crate) fn new(
        endpoint: EndpointKey,
        resolver: R,
        read_from: ReadFrom,
        command_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            resolver,
            read_from,
            command_timeout,
            nodes: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// 預先解析主節點，構建失敗直接返回
    pub(crate) async fn warm_up(&self) -> Result<(), RedisClientError> {
        let upstream = self.node(NodeRole::Upstream).await?;
        info!("主節點已就緒 {}: {}", self.endpoint, upstream.label);
        Ok(())
    }

    pub fn read_from(&self) -> ReadFrom {
        self.read_from
    }

    fn ensure_open(&self) -> Result<(), RedisClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RedisClientError::Closed(self.endpoint.to_string()));
        }
        Ok(())
    }

    async fn node(&self, role: NodeRole) -> Result<ResolvedNode, RedisClientError> {
        let cached = self.nodes.read().get(&role).cloned();
        if let Some(node) = cached {
            return Ok(node);
        }
        let node = self.resolver.resolve(role).await?;
        debug!("解析{}節點 {}: {}", role.as_str(), self.endpoint, node.label);
        self.ensure_open()?;
        Ok(self.nodes.write().entry(role).or_insert(node).clone())
    }

    fn forget(&self, role: NodeRole, node: &ResolvedNode) {
        let mut nodes = self.nodes.write();
        if nodes.get(&role).map(|cached| cached.label == node.label).unwrap_or(false) {
            nodes.remove(&role);
        }
        drop(nodes);
        self.resolver.invalidate(role, node);
    }

    async fn execute<T, F, Fut>(
        &self,
        roles: &[NodeRole],
        operation_name: &str,
        operation: F,
    ) -> Result<T, RedisClientError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut + Clone,
        Fut: Future<Output = RedisResult<T>>,
    {
        self.execute_on(roles, operation_name, operation)
            .await
            .map(|(value, _)| value)
    }

    /// 按角色順序執行命令，返回結果與實際執行的節點標識
    ///
    /// 連接層面的失敗會重新解析該角色一次，再失敗則嘗試下一個角色；命令錯誤直接返回。
    async fn execute_on<T, F, Fut>(
        &self,
        roles: &[NodeRole],
        operation_name: &str,
        operation: F,
    ) -> Result<(T, String), RedisClientError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut + Clone,
        Fut: Future<Output = RedisResult<T>>,
    {
        self.ensure_open()?;
        let mut last_error = None;

        for role in roles {
            for attempt in 1..=2 {
                let node = match self.node(*role).await {
                    Ok(node) => node,
                    Err(err) => {
                        warn!("無法解析{}節點 {}: {}", role.as_str(), self.endpoint, err);
                        last_error = Some(err);
                        break;
                    }
                };

                match with_timeout(self.command_timeout, operation_name, operation.clone()(node.conn.clone())).await {
                    Ok(value) => return Ok((value, node.label)),
                    Err(err) if err.is_connection_failure() => {
                        warn!(
                            "{} 在{}節點 {} 失敗 (嘗試 {}/2): {}",
                            operation_name,
                            role.as_str(),
                            node.label,
                            attempt,
                            err
                        );
                        self.forget(*role, &node);
                        last_error = Some(err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RedisClientError::NoAvailableNode(self.endpoint.to_string())))
    }
}

#[async_trait]
impl<R: NodeResolver> ManagedConnection for ReplicaAwareConnection<R> {
    fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    async fn close(&self) -> Result<(), RedisClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RedisClientError::Closed(self.endpoint.to_string()));
        }
        info!("[回收 ReplicaAwareConnection] {}", self.endpoint);
        self.nodes.write().clear();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RedisClientError> {
        self.resolver.release();
        Ok(())
    }
}

#[async_trait]
impl<R: NodeResolver> ScanSource for ReplicaAwareConnection<R> {
    async fn scan_page(
        &self,
        cursor: Option<&ScanCursor>,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, RedisClientError> {
        self.ensure_open()?;
        let pattern_owned = pattern.to_string();

        match cursor {
            None => {
                // 首批請求按讀取策略選節點，之後固定在該節點
                let ((next, keys), label) = self
                    .execute_on(read_roles(self.read_from), "SCAN", |mut conn| async move {
                        commands::scan(&mut conn, 0, &pattern_owned, count).await
                    })
                    .await?;
                Ok(ScanPage::new(keys, ScanCursor::pinned(label, next)))
            }
            Some(cursor) => {
                let label = cursor
                    .pinned_node()
                    .filter(|_| !cursor.is_finished())
                    .ok_or_else(|| RedisClientError::InvalidCursor(format!("游標不屬於主從掃描 {}", self.endpoint)))?;
                let node = self
                    .nodes
                    .read()
                    .values()
                    .find(|node| node.label == label)
                    .cloned()
                    .ok_or_else(|| {
                        RedisClientError::InvalidCursor(format!("掃描節點已變更: {}", label))
                    })?;
                let mut conn = node.conn.clone();
                let (next, keys) = with_timeout(
                    self.command_timeout,
                    "SCAN",
                    commands::scan(&mut conn, cursor.resume_token(), pattern, count),
                )
                .await?;
                Ok(ScanPage::new(keys, ScanCursor::pinned(label, next)))
            }
        }
    }
}

#[async_trait]
impl<R: NodeResolver> RedisOperations for ReplicaAwareConnection<R> {
    async fn get(&self, key: &str) -> Result<Option<String>, RedisClientError> {
        let key = key.to_string();
        self.execute(read_roles(self.read_from), "GET", |mut conn| async move {
            commands::get(&mut conn, &key).await
        })
        .await
    }

    async fn geo_add(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        member: &str,
    ) -> Result<bool, RedisClientError> {
        let key = key.to_string();
        let member = member.to_string();
        self.execute(&[NodeRole::Upstream], "GEOADD", |mut conn| async move {
            commands::geo_add(&mut conn, &key, longitude, latitude, &member).await
        })
        .await
    }

    async fn nearest_member(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_meters: f64,
    ) -> Result<Option<String>, RedisClientError> {
        let key = key.to_string();
        self.execute(read_roles(self.read_from), "GEORADIUS", |mut conn| async move {
            commands::nearest_member(&mut conn, &key, longitude, latitude, radius_meters).await
        })
        .await
    }

    async fn ping(&self) -> Result<String, RedisClientError> {
        self.execute(&[NodeRole::Upstream], "PING", |mut conn| async move {
            commands::ping(&mut conn).await
        })
        .await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
