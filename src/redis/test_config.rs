//! 集中化的 Redis 測試配置
//!
//! 提供一致的測試環境配置，支援不同部署環境（本地開發、Docker 容器）。
//! 需要真實 Redis 的測試在服務不可用時跳過。

use crate::config::types::{DeploymentMode, RedisConfig};
use crate::redis::client::RedisOperations;
use crate::redis::connection::StandaloneConnection;

/// Redis 測試配置建構器
pub struct RedisTestConfig;

impl RedisTestConfig {
    /// 獲取測試用 Redis URL
    ///
    /// 優先級：
    /// 1. REDIS_TEST_URL 環境變數
    /// 2. 檢測 Docker 環境使用 redis:6379
    /// 3. 預設 localhost:6379
    pub fn get_test_url() -> String {
        if let Ok(url) = std::env::var("REDIS_TEST_URL") {
            return url;
        }

        if Self::is_docker_environment() {
            "redis://redis:6379".to_string()
        } else {
            "redis://localhost:6379".to_string()
        }
    }

    /// 檢測是否在 Docker 環境中執行
    fn is_docker_environment() -> bool {
        std::env::var("DOCKER_CONTAINER").is_ok() || std::path::Path::new("/.dockerenv").exists()
    }

    /// 建立標準測試 Redis 配置
    pub fn create_test_config() -> RedisConfig {
        RedisConfig::new(DeploymentMode::Standalone, Self::get_test_url()).with_timeouts(2, 5)
    }

    /// 檢查 Redis 是否可用於測試
    pub async fn is_redis_available() -> bool {
        let config = Self::create_test_config();
        match StandaloneConnection::connect(&config.uri, &config).await {
            Ok(conn) => conn.ping().await.map(|pong| pong == "PONG").unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Redis 可用時返回 true；不可用時記錄並返回 false，由測試自行跳過
    pub async fn redis_available_or_skip(test_name: &str) -> bool {
        if Self::is_redis_available().await {
            return true;
        }
        eprintln!("跳過 Redis 測試 '{}' - Redis 環境不可用", test_name);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_test_url_with_env_var() {
        std::env::set_var("REDIS_TEST_URL", "redis://custom:1234");

        let url = RedisTestConfig::get_test_url();
        assert_eq!(url, "redis://custom:1234");

        std::env::remove_var("REDIS_TEST_URL");
    }

    #[test]
    #[serial]
    fn test_create_test_config() {
        let config = RedisTestConfig::create_test_config();
        assert!(config.uri.starts_with("redis://"));
        assert_eq!(config.mode, DeploymentMode::Standalone);
        assert_eq!(config.connection_timeout_secs, 2);
    }
}
