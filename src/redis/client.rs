use async_trait::async_trait;
use redis::RedisError;
use std::error::Error as StdError;
use thiserror::Error;

use crate::redis::endpoint::EndpointKey;
use crate::redis::scan::ScanSource;

/// Redis客戶端錯誤
#[derive(Error, Debug)]
pub enum RedisClientError {
    /// Redis連接或命令錯誤
    #[error("Redis連接錯誤: {0}")]
    ConnectionError(#[from] RedisError),

    /// 操作超時錯誤
    #[error("Redis操作超時: {0}")]
    TimeoutError(String),

    /// 連接地址格式錯誤
    #[error("無效的連接地址: {0}")]
    InvalidEndpoint(String),

    /// 參數錯誤
    #[error("無效的參數: {0}")]
    InvalidArgument(String),

    /// 連接已關閉
    #[error("連接已關閉: {0}")]
    Closed(String),

    /// 沒有可用節點
    #[error("沒有可用的Redis節點: {0}")]
    NoAvailableNode(String),

    /// 集群拓撲錯誤
    #[error("集群拓撲錯誤: {0}")]
    TopologyError(String),

    /// 掃描游標無效
    #[error("無效的掃描游標: {0}")]
    InvalidCursor(String),

    /// 掃描回調返回錯誤
    #[error("掃描回調失敗: {0}")]
    HandlerError(#[source] Box<dyn StdError + Send + Sync>),
}

impl RedisClientError {
    /// 是否為連接層面的失敗（斷線、拒絕連接、超時）
    ///
    /// 只有這類錯誤才會觸發讀取回退或拓撲刷新，命令本身的錯誤直接返回。
    pub fn is_connection_failure(&self) -> bool {
        match self {
            RedisClientError::ConnectionError(err) => {
                err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
            }
            RedisClientError::TimeoutError(_) => true,
            _ => false,
        }
    }
}

/// 由註冊表管理生命週期的連接
#[async_trait]
pub trait ManagedConnection: Send + Sync + 'static {
    /// 連接對應的端點鍵
    fn endpoint(&self) -> &EndpointKey;

    /// 關閉連接；重複關閉返回 [`RedisClientError::Closed`]
    async fn close(&self) -> Result<(), RedisClientError>;

    /// 停止客戶端的後台資源（例如拓撲刷新任務）
    async fn shutdown(&self) -> Result<(), RedisClientError> {
        Ok(())
    }
}

/// Redis操作特質
///
/// 每種部署模式的連接適配器都實現此特質，調用方只依賴這組能力。
#[async_trait]
pub trait RedisOperations: ManagedConnection + ScanSource {
    /// 獲取鍵對應的值
    async fn get(&self, key: &str) -> Result<Option<String>, RedisClientError>;

    /// 添加經緯度成員，返回是否為新增成員
    async fn geo_add(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        member: &str,
    ) -> Result<bool, RedisClientError>;

    /// 獲取指定經緯度半徑（米）內距離最近的一個成員
    async fn nearest_member(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_meters: f64,
    ) -> Result<Option<String>, RedisClientError>;

    /// 執行PING命令
    async fn ping(&self) -> Result<String, RedisClientError>;

    /// 連接是否已關閉
    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;

    #[test]
    fn test_connection_failure_classification() {
        let io: RedisError = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(RedisClientError::ConnectionError(io).is_connection_failure());

        let type_error: RedisError = (ErrorKind::TypeError, "WRONGTYPE").into();
        assert!(!RedisClientError::ConnectionError(type_error).is_connection_failure());

        assert!(RedisClientError::TimeoutError("GET".to_string()).is_connection_failure());
        assert!(!RedisClientError::Closed("standalone:redis://x".to_string()).is_connection_failure());
    }
}
