use config::{Config, ConfigError, Environment as ConfigEnvironment, File};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::types::ApplicationConfig;
use crate::config::validation::Validator;

/// 環境類型枚舉
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// 從環境變數取得當前環境設定
    pub fn from_env() -> Self {
        match env::var("REDIS_UTIL_ENV")
            .unwrap_or_else(|_| "development".into())
            .to_lowercase()
            .as_str()
        {
            "production" => Environment::Production,
            _ => Environment::Development,
        }
    }

    /// 轉換為配置文件名
    pub fn as_filename(&self) -> &'static str {
        match self {
            Environment::Development => "development.toml",
            Environment::Production => "production.toml",
        }
    }
}

/// 配置加載器，負責根據環境加載適當的配置
pub struct ConfigLoader;

impl ConfigLoader {
    /// 載入指定環境的配置
    ///
    /// 配置文件不存在時只使用環境變數與預設值。
    pub fn load(env: Environment) -> Result<Config, ConfigError> {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load_from_dir(Path::new(&config_dir), env)
    }

    /// 從指定目錄載入配置
    pub fn load_from_dir(config_dir: &Path, env: Environment) -> Result<Config, ConfigError> {
        let config_path: PathBuf = config_dir.join(env.as_filename());
        debug!("載入配置文件: {}", config_path.display());

        Config::builder()
            .add_source(File::from(config_path).required(false))
            // 環境變數優先級高於文件配置
            .add_source(
                ConfigEnvironment::with_prefix("REDIS_UTIL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
    }
}

impl ApplicationConfig {
    /// 從環境變數指定的環境加載配置
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let env = Environment::from_env();
        debug!("從環境加載配置: {:?}", env);
        Self::load(env)
    }

    /// 從指定環境加載配置
    pub fn load(env: Environment) -> Result<Self, ConfigError> {
        Self::from_source(ConfigLoader::load(env)?)
    }

    /// 反序列化並驗證已構建的配置來源
    pub fn from_source(source: Config) -> Result<Self, ConfigError> {
        let app_config: ApplicationConfig = source.try_deserialize()?;

        if let Err(err) = app_config.validate() {
            warn!("配置驗證失敗: {}", err);
            return Err(ConfigError::Message(err.to_string()));
        }
        debug!("配置驗證通過");

        Ok(app_config)
    }
}
