//! 日誌初始化
//!
//! 根據 [`LogConfig`] 安裝全局 tracing 訂閱器。`RUST_LOG` 環境變數存在時優先使用。

use anyhow::{anyhow, Result};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::LogConfig;

/// 將配置中的日誌級別轉換為 tracing 級別
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO, // 默認為INFO
    }
}

/// 初始化日誌系統
pub fn init_logging(log_config: &LogConfig) -> Result<()> {
    let level = parse_level(&log_config.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    let result = if log_config.format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.map_err(|e| anyhow!("設置日誌系統失敗: {}", e))?;

    info!("日誌系統初始化完成");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("unknown"), Level::INFO);
    }
}
