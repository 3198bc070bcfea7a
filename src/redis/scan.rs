//! 基於游標的鍵掃描
//!
//! 每輪請求一批匹配的鍵，逐個交給回調處理，直到服務器報告掃描結束。
//! 游標只能由服務器回應產生，調用方無法自行構造。

use async_trait::async_trait;
use std::error::Error as StdError;
use std::sync::Arc;
use tracing::debug;

use crate::redis::client::RedisClientError;
use crate::redis::endpoint::NodeAddr;

/// 掃描游標
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    position: CursorPosition,
    finished: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorPosition {
    /// 單節點
    Node { cursor: u64 },
    /// 固定在首批回應所在的節點
    Pinned { node: String, cursor: u64 },
    /// 集群：依序掃描每個主節點
    Sharded {
        nodes: Arc<[NodeAddr]>,
        index: usize,
        cursor: u64,
    },
}

impl ScanCursor {
    /// 服務器是否已報告掃描結束
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 下一次請求需要帶回給服務器的游標值
    pub fn resume_token(&self) -> u64 {
        match &self.position {
            CursorPosition::Node { cursor }
            | CursorPosition::Pinned { cursor, .. }
            | CursorPosition::Sharded { cursor, .. } => *cursor,
        }
    }

    /// 由單節點 SCAN 回應產生的游標
    fn from_node_reply(next: u64) -> Self {
        Self {
            position: CursorPosition::Node { cursor: next },
            finished: next == 0,
        }
    }

    pub(crate) fn pinned(node: impl Into<String>, next: u64) -> Self {
        Self {
            position: CursorPosition::Pinned {
                node: node.into(),
                cursor: next,
            },
            finished: next == 0,
        }
    }

    /// 集群游標；當前節點掃描完畢時移到下一個主節點
    pub(crate) fn sharded(nodes: Arc<[NodeAddr]>, index: usize, next: u64) -> Self {
        if next != 0 {
            return Self {
                position: CursorPosition::Sharded { nodes, index, cursor: next },
                finished: false,
            };
        }
        let next_index = index + 1;
        let finished = next_index >= nodes.len();
        Self {
            position: CursorPosition::Sharded {
                nodes,
                index: if finished { index } else { next_index },
                cursor: 0,
            },
            finished,
        }
    }

    /// 空集群或無需請求即可結束的掃描
    pub(crate) fn exhausted() -> Self {
        Self {
            position: CursorPosition::Node { cursor: 0 },
            finished: true,
        }
    }

    pub(crate) fn pinned_node(&self) -> Option<&str> {
        match &self.position {
            CursorPosition::Pinned { node, .. } => Some(node),
            _ => None,
        }
    }

    pub(crate) fn shard(&self) -> Option<(&Arc<[NodeAddr]>, usize)> {
        match &self.position {
            CursorPosition::Sharded { nodes, index, .. } => Some((nodes, *index)),
            _ => None,
        }
    }

    pub(crate) fn is_single_node(&self) -> bool {
        matches!(self.position, CursorPosition::Node { .. })
    }
}

/// 一次掃描請求的結果
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub keys: Vec<String>,
    pub cursor: ScanCursor,
}

impl ScanPage {
    /// 由單節點 `SCAN` 回應 `(next_cursor, keys)` 構建
    ///
    /// 只供 [`ScanSource`] 的實現包裝伺服器回應，調用方應透過 [`scan_keys`] 取得游標。
    #[doc(hidden)]
    pub fn from_reply(next: u64, keys: Vec<String>) -> Self {
        Self {
            keys,
            cursor: ScanCursor::from_node_reply(next),
        }
    }

    pub(crate) fn new(keys: Vec<String>, cursor: ScanCursor) -> Self {
        Self { keys, cursor }
    }
}

/// 掃描統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// 請求次數
    pub round_trips: usize,
    /// 交給回調的鍵數量
    pub keys: usize,
}

/// 能夠按頁返回匹配鍵的來源
#[async_trait]
pub trait ScanSource: Send + Sync {
    /// 請求一批鍵；`cursor` 為 None 時從頭開始
    async fn scan_page(
        &self,
        cursor: Option<&ScanCursor>,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, RedisClientError>;
}

/// 掃描所有匹配 `pattern` 的鍵
///
/// 每批鍵按服務器返回順序同步交給 `on_key`，處理完才請求下一批。
/// 回調返回錯誤時立即中止，錯誤以 [`RedisClientError::HandlerError`] 返回。
pub async fn scan_keys<S, F, E>(
    source: &S,
    pattern: &str,
    batch_size: usize,
    mut on_key: F,
) -> Result<ScanStats, RedisClientError>
where
    S: ScanSource + ?Sized,
    F: FnMut(String) -> Result<(), E>,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    if batch_size == 0 {
        return Err(RedisClientError::InvalidArgument("batch_size 必須大於 0".to_string()));
    }

    let mut stats = ScanStats::default();
    let mut cursor: Option<ScanCursor> = None;
    loop {
        let page = source.scan_page(cursor.as_ref(), pattern, batch_size).await?;
        stats.round_trips += 1;
        debug!(
            "掃描 [{}] 第{}批: {}個鍵, 結束: {}",
            pattern,
            stats.round_trips,
            page.keys.len(),
            page.cursor.is_finished()
        );

        for key in page.keys {
            on_key(key).map_err(|e| RedisClientError::HandlerError(e.into()))?;
            stats.keys += 1;
        }

        if page.cursor.is_finished() {
            return Ok(stats);
        }
        cursor = Some(page.cursor);
    }
}

/// 收集所有匹配的鍵，只適用於小鍵空間
pub async fn scan_collect<S>(
    source: &S,
    pattern: &str,
    batch_size: usize,
) -> Result<Vec<String>, RedisClientError>
where
    S: ScanSource + ?Sized,
{
    let mut keys = Vec::new();
    scan_keys(source, pattern, batch_size, |key| {
        keys.push(key);
        Ok::<_, RedisClientError>(())
    })
    .await?;
    Ok(keys)
}
