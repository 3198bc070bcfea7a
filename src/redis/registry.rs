//! 連接註冊表
//!
//! 按端點鍵緩存已建立的連接，同一端點只建立一次；
//! 關閉時逐個回收，單個連接的失敗不影響其餘連接。

use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::redis::client::{ManagedConnection, RedisClientError, RedisOperations};
use crate::redis::endpoint::EndpointKey;

/// 回收階段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStage {
    /// 關閉連接
    Close,
    /// 停止客戶端
    Shutdown,
}

impl fmt::Display for CloseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseStage::Close => write!(f, "close"),
            CloseStage::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// 單個連接的回收失敗
#[derive(Debug, Clone)]
pub struct CloseFailure {
    pub endpoint: EndpointKey,
    pub stage: CloseStage,
    pub reason: String,
}

/// 回收結果
#[derive(Debug, Clone, Default)]
pub struct CloseReport {
    /// 嘗試回收的連接數
    pub attempted: usize,
    pub failures: Vec<CloseFailure>,
}

impl CloseReport {
    /// 所有連接都已順利回收
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 連接註冊表
pub struct ConnectionRegistry<H: ?Sized + ManagedConnection = dyn RedisOperations> {
    entries: DashMap<EndpointKey, Arc<OnceCell<Arc<H>>>>,
}

impl<H: ?Sized + ManagedConnection> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized + ManagedConnection> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// 取得端點對應的連接，不存在時以 `factory` 建立
    ///
    /// 同一端點的並發請求只會執行一次 `factory`，其餘請求等待並共享結果。
    /// 建立失敗時槽位保留為未初始化狀態，正在等待的請求或之後的請求
    /// 會在同一槽位上重新建立，因此每個端點始終只有一個槽位。
    pub async fn acquire<F, Fut>(&self, key: EndpointKey, factory: F) -> Result<Arc<H>, RedisClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<H>, RedisClientError>>,
    {
        let cell = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        if let Some(handle) = cell.get() {
            warn!("連接已存在，返回已建立的連接: {}", key);
            return Ok(handle.clone());
        }

        let mut created = false;
        let result = cell
            .get_or_try_init(|| {
                created = true;
                factory()
            })
            .await;

        match result {
            Ok(handle) => {
                if created {
                    info!("註冊連接: {}", key);
                } else {
                    warn!("連接已存在，返回已建立的連接: {}", key);
                }
                Ok(handle.clone())
            }
            Err(err) => {
                error!("建立連接失敗 {}: {}", key, err);
                Err(err)
            }
        }
    }

    /// 已註冊的連接
    pub fn get(&self, key: &EndpointKey) -> Option<Arc<H>> {
        self.entries.get(key).and_then(|entry| entry.value().get().cloned())
    }

    pub fn contains(&self, key: &EndpointKey) -> bool {
        self.get(key).is_some()
    }

    /// 已建立的連接數量
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已建立連接的端點鍵，按鍵排序
    pub fn keys(&self) -> Vec<EndpointKey> {
        let mut keys: Vec<EndpointKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// 回收所有連接
    ///
    /// 先關閉全部連接，再停止全部客戶端。失敗只記錄並寫入報告，
    /// 不中斷其餘連接的回收。只移除已建立的連接；仍在建立中的連接
    /// 保留在註冊表中，由下一次回收處理。
    pub async fn close_all(&self) -> CloseReport {
        let mut snapshot: Vec<(EndpointKey, Arc<OnceCell<Arc<H>>>, Arc<H>)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .get()
                    .map(|handle| (entry.key().clone(), entry.value().clone(), handle.clone()))
            })
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));

        let handles: Vec<(EndpointKey, Arc<H>)> = snapshot
            .into_iter()
            .map(|(key, cell, handle)| {
                self.entries.remove_if(&key, |_, existing| Arc::ptr_eq(existing, &cell));
                (key, handle)
            })
            .collect();

        info!("開始回收 {} 個Redis連接", handles.len());
        let mut report = CloseReport {
            attempted: handles.len(),
            failures: Vec::new(),
        };

        for (key, handle) in &handles {
            match handle.close().await {
                Ok(()) => debug!("已關閉連接: {}", key),
                Err(err) => {
                    warn!("關閉連接失敗 {}: {}", key, err);
                    report.failures.push(CloseFailure {
                        endpoint: key.clone(),
                        stage: CloseStage::Close,
                        reason: err.to_string(),
                    });
                }
            }
        }

        for (key, handle) in &handles {
            match handle.shutdown().await {
                Ok(()) => debug!("已停止客戶端: {}", key),
                Err(err) => {
                    warn!("停止客戶端失敗 {}: {}", key, err);
                    report.failures.push(CloseFailure {
                        endpoint: key.clone(),
                        stage: CloseStage::Shutdown,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            "Redis連接回收完成: {} 個連接, {} 個失敗",
            report.attempted,
            report.failures.len()
        );
        report
    }
}
