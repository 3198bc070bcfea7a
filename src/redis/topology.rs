//! 集群拓撲追蹤
//!
//! 維護健康主節點列表供全集群掃描使用，並持有每個主節點的直連連接。
//! 列表由後台任務定期刷新，節點失敗時也可觸發自適應刷新。

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::{AsyncConnectionConfig, Client as RedisClient, ConnectionAddr, ConnectionInfo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{RedisConfig, TopologyRefreshConfig};
use crate::redis::client::RedisClientError;
use crate::redis::commands::{self, with_timeout};
use crate::redis::connection::async_connection_config;
use crate::redis::endpoint::{EndpointKey, NodeAddr};

pub struct ClusterTopology {
    endpoint: EndpointKey,
    /// 種子節點的連接資訊，直連各主節點時沿用其中的憑證
    seed: ConnectionInfo,
    settings: TopologyRefreshConfig,
    connect_timeout: Duration,
    command_timeout: Duration,
    /// 直連主節點時使用的套接字選項
    connection_config: AsyncConnectionConfig,
    primaries: RwLock<Arc<[NodeAddr]>>,
    node_links: DashMap<NodeAddr, MultiplexedConnection>,
    last_adaptive_refresh: Mutex<Option<Instant>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterTopology {
    pub fn new(endpoint: EndpointKey, seed: ConnectionInfo, config: &RedisConfig) -> Self {
        Self {
            endpoint,
            seed,
            settings: config.topology_refresh.clone(),
            connect_timeout: config.connection_timeout(),
            command_timeout: config.command_timeout(),
            connection_config: async_connection_config(config),
            primaries: RwLock::new(Arc::from(Vec::new())),
            node_links: DashMap::new(),
            last_adaptive_refresh: Mutex::new(None),
            refresh_task: Mutex::new(None),
        }
    }

    /// 當前主節點列表的快照
    pub fn primaries(&self) -> Arc<[NodeAddr]> {
        self.primaries.read().clone()
    }

    /// 替換主節點列表，返回列表是否有變化
    pub fn update(&self, mut nodes: Vec<NodeAddr>) -> bool {
        nodes.sort();
        nodes.dedup();

        let changed = {
            let mut primaries = self.primaries.write();
            if primaries[..] == nodes[..] {
                false
            } else {
                info!(
                    "集群拓撲變更 {}: {} 個主節點 -> {} 個主節點",
                    self.endpoint,
                    primaries.len(),
                    nodes.len()
                );
                *primaries = Arc::from(nodes.clone());
                true
            }
        };

        if changed && self.settings.close_stale_connections {
            let current: Vec<NodeAddr> = self.node_links.iter().map(|entry| entry.key().clone()).collect();
            for stale in stale_nodes(&current, &nodes) {
                debug!("關閉已不是主節點的連接 {}: {}", self.endpoint, stale);
                self.node_links.remove(&stale);
            }
        }
        changed
    }

    /// 查詢 `CLUSTER NODES` 並更新主節點列表
    pub async fn refresh<C>(&self, conn: &mut C) -> Result<Arc<[NodeAddr]>, RedisClientError>
    where
        C: ConnectionLike + Send,
    {
        let nodes = with_timeout(self.command_timeout, "CLUSTER NODES", commands::cluster_primaries(conn)).await?;
        if nodes.is_empty() {
            return Err(RedisClientError::TopologyError(format!(
                "集群沒有健康的主節點: {}",
                self.endpoint
            )));
        }
        self.update(nodes);
        Ok(self.primaries())
    }

    /// 節點失敗後是否應該立即刷新拓撲
    ///
    /// 兩次自適應刷新之間至少間隔 `adaptive_refresh_timeout`。
    pub fn should_refresh_adaptively(&self) -> bool {
        if !self.settings.adaptive_refresh {
            return false;
        }
        let mut last = self.last_adaptive_refresh.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.settings.adaptive_refresh_timeout() => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// 取得指定主節點的直連連接，不存在時建立
    pub async fn node_connection(&self, addr: &NodeAddr) -> Result<MultiplexedConnection, RedisClientError> {
        let cached = self.node_links.get(addr).map(|entry| entry.value().clone());
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let client = RedisClient::open(node_connection_info(&self.seed, addr))?;
        let conn = with_timeout(
            self.connect_timeout,
            "建立集群節點連接",
            client.get_multiplexed_async_connection_with_config(&self.connection_config),
        )
        .await?;
        debug!("建立集群節點連接 {}: {}", self.endpoint, addr);
        Ok(self.node_links.entry(addr.clone()).or_insert(conn).value().clone())
    }

    pub fn forget_node(&self, addr: &NodeAddr) {
        if self.node_links.remove(addr).is_some() {
            debug!("丟棄集群節點連接 {}: {}", self.endpoint, addr);
        }
    }

    /// 關閉所有節點直連連接
    pub fn clear_links(&self) {
        self.node_links.clear();
    }

    /// 啟動定期刷新任務；未配置刷新間隔時不啟動
    ///
    /// 任務只持有拓撲的弱引用，拓撲被釋放後自行結束。
    pub fn start<C>(self: &Arc<Self>, mut conn: C)
    where
        C: ConnectionLike + Send + 'static,
    {
        let Some(period) = self.settings.periodic_interval() else {
            debug!("未配置定期拓撲刷新: {}", self.endpoint);
            return;
        };

        let topology = Arc::downgrade(self);
        let endpoint = self.endpoint.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 首次 tick 立即完成，構建時已刷新過
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(topology) = topology.upgrade() else {
                    break;
                };
                if let Err(err) = topology.refresh(&mut conn).await {
                    warn!("定期刷新集群拓撲失敗 {}: {}", endpoint, err);
                }
            }
            debug!("拓撲刷新任務結束: {}", endpoint);
        });

        info!("啟動拓撲刷新任務 {}: 每 {} 秒", self.endpoint, period.as_secs());
        if let Some(previous) = self.refresh_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// 停止定期刷新任務
    pub fn stop(&self) -> bool {
        match self.refresh_task.lock().take() {
            Some(task) => {
                task.abort();
                info!("停止拓撲刷新任務: {}", self.endpoint);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.refresh_task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ClusterTopology {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.abort();
        }
    }
}

/// 已有連接中不再屬於主節點列表的節點
fn stale_nodes(current: &[NodeAddr], primaries: &[NodeAddr]) -> Vec<NodeAddr> {
    current
        .iter()
        .filter(|addr| !primaries.contains(addr))
        .cloned()
        .collect()
}

/// 以種子節點的憑證連接指定主節點；集群只使用 0 號數據庫
fn node_connection_info(seed: &ConnectionInfo, addr: &NodeAddr) -> ConnectionInfo {
    let mut info = seed.clone();
    info.addr = ConnectionAddr::Tcp(addr.host.clone(), addr.port);
    info.redis.db = 0;
    info
}
