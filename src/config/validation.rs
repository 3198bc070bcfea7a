//! 連接配置的驗證規則
//!
//! 欄位名一律使用配置文件中的完整路徑（例如 `redis.keep_alive.idle_secs`），
//! 與環境變數覆蓋 `REDIS_UTIL__REDIS__KEEP_ALIVE__IDLE_SECS` 一一對應。

use thiserror::Error;

/// 配置驗證錯誤，載入時轉為 `config::ConfigError::Message`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// 地址等必填欄位為空
    #[error("缺少必要配置項: {0}")]
    MissingField(String),

    /// 協議前綴、日誌格式等取值不合法
    #[error("無效的配置值: {0}")]
    InvalidValue(String),

    /// 超時、批量大小等數值越界，範圍含兩端
    #[error("配置範圍錯誤: {field} 的值 {value} 不在範圍 {min}..={max} 內")]
    RangeError {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    /// 細項設置了但所屬開關未開啟，例如 keepalive 細項
    #[error("依賴錯誤: {dependent} 依賴於 {dependency} 的配置")]
    DependencyError {
        dependent: String,
        dependency: String,
    },
}

/// 每個配置區段各自實現，上層區段依序調用子區段
pub trait Validator {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// 各區段共用的欄位檢查
pub struct ValidationUtils;

impl ValidationUtils {
    /// 數值在 `min..=max` 之內
    pub fn in_range<T>(value: T, min: T, max: T, field_name: &str) -> Result<(), ValidationError>
    where
        T: PartialOrd + ToString,
    {
        if value < min || value > max {
            return Err(ValidationError::RangeError {
                field: field_name.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    /// 取值屬於允許的選項之一
    pub fn one_of<T>(value: &T, options: &[T], field_name: &str) -> Result<(), ValidationError>
    where
        T: PartialEq + ToString,
    {
        if !options.contains(value) {
            return Err(ValidationError::InvalidValue(format!(
                "{} 的值 {} 不是有效選項: {:?}",
                field_name,
                value.to_string(),
                options.iter().map(ToString::to_string).collect::<Vec<_>>()
            )));
        }
        Ok(())
    }

    /// 去除空白後不為空
    pub fn not_empty(value: &str, field_name: &str) -> Result<(), ValidationError> {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField(field_name.to_string()));
        }
        Ok(())
    }

    /// 地址以允許的協議前綴開頭，例如哨兵模式只接受 `redis-sentinel://`
    pub fn has_scheme(value: &str, schemes: &[&str], field_name: &str) -> Result<(), ValidationError> {
        let value = value.trim();
        if !schemes.iter().any(|scheme| value.starts_with(&format!("{}://", scheme))) {
            return Err(ValidationError::InvalidValue(format!(
                "{} 的地址 {} 必須以 {} 開頭",
                field_name,
                value,
                schemes.iter().map(|scheme| format!("{}://", scheme)).collect::<Vec<_>>().join(" / ")
            )));
        }
        Ok(())
    }

    /// 設置了 `dependent` 時 `dependency` 必須開啟
    pub fn check_dependency(
        is_set: bool,
        is_enabled: bool,
        dependent: &str,
        dependency: &str,
    ) -> Result<(), ValidationError> {
        if is_set && !is_enabled {
            return Err(ValidationError::DependencyError {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }
        Ok(())
    }
}
