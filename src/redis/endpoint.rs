//! 連接地址解析與端點鍵
//!
//! 支持的地址格式：
//!
//! ```text
//! redis://[[username:]password@]host[:port][/database]
//! rediss://[[username:]password@]host[:port][/database]
//! redis-sentinel://[[username:]password@]host[:port][,host2[:port2]][/database]#masterId
//! 192.168.11.124:7001,192.168.11.124:7002          (集群或主從節點列表)
//! redis://10.0.0.1:6379,redis://10.0.0.2:6379       (完整地址列表)
//! ```

use std::fmt;

use crate::config::DeploymentMode;
use crate::redis::client::RedisClientError;

const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// 端點鍵，用於連接去重
///
/// 單地址以原字串表示，地址列表以 JSON 陣列表示；部署模式也屬於鍵的一部分。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    mode: DeploymentMode,
    addresses: Vec<String>,
    list: bool,
}

impl EndpointKey {
    /// 單地址端點
    pub fn single(mode: DeploymentMode, uri: impl AsRef<str>) -> Self {
        Self {
            mode,
            addresses: vec![uri.as_ref().trim().to_string()],
            list: false,
        }
    }

    /// 有序地址列表端點，空白項會被忽略
    pub fn list<I, S>(mode: DeploymentMode, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addresses = uris
            .into_iter()
            .map(|uri| uri.as_ref().trim().to_string())
            .filter(|uri| !uri.is_empty())
            .collect();
        Self {
            mode,
            addresses,
            list: true,
        }
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.list {
            let rendered = serde_json::to_string(&self.addresses).map_err(|_| fmt::Error)?;
            write!(f, "{}:{}", self.mode, rendered)
        } else {
            write!(f, "{}:{}", self.mode, self.addresses.join(","))
        }
    }
}

/// 節點地址
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 解析 `host[:port]`，缺省端口使用 `default_port`
    pub fn parse(input: &str, default_port: u16) -> Result<Self, RedisClientError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RedisClientError::InvalidEndpoint("節點地址為空".to_string()));
        }

        // [::1]:6379
        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| RedisClientError::InvalidEndpoint(input.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, input)?,
                None if tail.is_empty() => default_port,
                None => return Err(RedisClientError::InvalidEndpoint(input.to_string())),
            };
            return Ok(Self::new(host, port));
        }

        match input.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self::new(host, parse_port(port, input)?)),
            Some(_) => Err(RedisClientError::InvalidEndpoint(input.to_string())),
            None => Ok(Self::new(input, default_port)),
        }
    }

    /// 轉為 redis 連接地址
    pub fn to_uri(&self) -> String {
        if self.host.contains(':') {
            format!("redis://[{}]:{}", self.host, self.port)
        } else {
            format!("redis://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16, RedisClientError> {
    port.parse::<u16>()
        .map_err(|_| RedisClientError::InvalidEndpoint(format!("無效的端口: {}", input)))
}

/// 解析逗號分隔的節點列表
///
/// `host:port` 形式的項轉為 `redis://host:port`，完整地址原樣保留。
pub fn parse_node_list(nodes: &str) -> Result<Vec<String>, RedisClientError> {
    let uris = nodes
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            if item.contains("://") {
                Ok(item.to_string())
            } else {
                NodeAddr::parse(item, DEFAULT_REDIS_PORT).map(|addr| addr.to_uri())
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    if uris.is_empty() {
        return Err(RedisClientError::InvalidEndpoint(format!("節點列表為空: {:?}", nodes)));
    }
    Ok(uris)
}

/// 哨兵地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelEndpoint {
    pub sentinels: Vec<NodeAddr>,
    pub master_name: String,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
}

impl SentinelEndpoint {
    /// 解析 `redis-sentinel://[[username:]password@]host[:port][,host2[:port2]][/database]#masterId`
    pub fn parse(uri: &str) -> Result<Self, RedisClientError> {
        let uri = uri.trim();
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| RedisClientError::InvalidEndpoint(format!("缺少協議: {}", uri)))?;
        let tls = match scheme {
            "redis-sentinel" => false,
            "rediss-sentinel" => true,
            other => {
                return Err(RedisClientError::InvalidEndpoint(format!(
                    "哨兵地址協議必須為 redis-sentinel: {}",
                    other
                )))
            }
        };

        let (body, master_name) = rest
            .split_once('#')
            .ok_or_else(|| RedisClientError::InvalidEndpoint(format!("缺少主節點名稱 #masterId: {}", uri)))?;
        let master_name = master_name.trim();
        if master_name.is_empty() {
            return Err(RedisClientError::InvalidEndpoint(format!("主節點名稱為空: {}", uri)));
        }

        let (authority, db) = match body.split_once('/') {
            Some((authority, db)) if !db.is_empty() => {
                let db = db.parse::<i64>().map_err(|_| {
                    RedisClientError::InvalidEndpoint(format!("無效的數據庫編號: {}", db))
                })?;
                (authority, db)
            }
            Some((authority, _)) => (authority, 0),
            None => (body, 0),
        };

        let (credentials, hosts) = match authority.rsplit_once('@') {
            Some((credentials, hosts)) => (Some(credentials), hosts),
            None => (None, authority),
        };
        let (username, password) = match credentials {
            Some(credentials) => match credentials.split_once(':') {
                Some((user, pass)) => (non_empty(user), non_empty(pass)),
                None => (None, non_empty(credentials)),
            },
            None => (None, None),
        };

        let sentinels = hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(|host| NodeAddr::parse(host, DEFAULT_SENTINEL_PORT))
            .collect::<Result<Vec<_>, _>>()?;
        if sentinels.is_empty() {
            return Err(RedisClientError::InvalidEndpoint(format!("哨兵節點列表為空: {}", uri)));
        }

        Ok(Self {
            sentinels,
            master_name: master_name.to_string(),
            db,
            username,
            password,
            tls,
        })
    }

    /// 哨兵節點的連接地址
    pub fn sentinel_uris(&self) -> Vec<String> {
        self.sentinels
            .iter()
            .map(|node| {
                let uri = node.to_uri();
                if self.tls {
                    uri.replacen("redis://", "rediss://", 1)
                } else {
                    uri
                }
            })
            .collect()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
