//! 各連接適配器共用的命令封裝
//!
//! 所有函數都只是對 redis 客戶端命令接口的直接調用，外加超時控制。

use redis::aio::ConnectionLike;
use redis::{cmd, AsyncCommands, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::redis::client::RedisClientError;
use crate::redis::endpoint::NodeAddr;

/// 在超時限制內執行 redis 調用
pub(crate) async fn with_timeout<T, F>(
    limit: Duration,
    operation: &str,
    future: F,
) -> Result<T, RedisClientError>
where
    F: Future<Output = RedisResult<T>>,
{
    match timeout(limit, future).await {
        Ok(result) => result.map_err(RedisClientError::ConnectionError),
        Err(_) => Err(RedisClientError::TimeoutError(format!(
            "{} ({}秒)",
            operation,
            limit.as_secs()
        ))),
    }
}

pub(crate) async fn get<C>(conn: &mut C, key: &str) -> RedisResult<Option<String>>
where
    C: ConnectionLike + Send + Sync,
{
    conn.get::<_, Option<String>>(key).await
}

/// `SCAN cursor MATCH pattern COUNT count`
pub(crate) async fn scan<C>(
    conn: &mut C,
    cursor: u64,
    pattern: &str,
    count: usize,
) -> RedisResult<(u64, Vec<String>)>
where
    C: ConnectionLike + Send,
{
    cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(count)
        .query_async::<(u64, Vec<String>)>(conn)
        .await
}

/// `GEOADD key longitude latitude member`，返回是否新增
pub(crate) async fn geo_add<C>(
    conn: &mut C,
    key: &str,
    longitude: f64,
    latitude: f64,
    member: &str,
) -> RedisResult<bool>
where
    C: ConnectionLike + Send,
{
    let added = cmd("GEOADD")
        .arg(key)
        .arg(longitude)
        .arg(latitude)
        .arg(member)
        .query_async::<i64>(conn)
        .await?;
    Ok(added > 0)
}

/// `GEORADIUS key longitude latitude radius m COUNT 1 ASC`
pub(crate) async fn nearest_member<C>(
    conn: &mut C,
    key: &str,
    longitude: f64,
    latitude: f64,
    radius_meters: f64,
) -> RedisResult<Option<String>>
where
    C: ConnectionLike + Send,
{
    let members = cmd("GEORADIUS")
        .arg(key)
        .arg(longitude)
        .arg(latitude)
        .arg(radius_meters)
        .arg("m")
        .arg("COUNT")
        .arg(1)
        .arg("ASC")
        .query_async::<Vec<String>>(conn)
        .await?;
    Ok(members.into_iter().next())
}

pub(crate) async fn ping<C>(conn: &mut C) -> RedisResult<String>
where
    C: ConnectionLike + Send,
{
    cmd("PING").query_async::<String>(conn).await
}

/// 節點在複製關係中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Upstream,
    Replica,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Upstream => "upstream",
            NodeRole::Replica => "replica",
        }
    }
}

/// `INFO replication`
pub(crate) async fn replication_role<C>(conn: &mut C) -> RedisResult<Option<NodeRole>>
where
    C: ConnectionLike + Send,
{
    let info = cmd("INFO")
        .arg("replication")
        .query_async::<String>(conn)
        .await?;
    Ok(parse_replication_role(&info))
}

/// 從 `INFO replication` 的輸出中取出 `role:` 行
pub fn parse_replication_role(info: &str) -> Option<NodeRole> {
    info.lines()
        .filter_map(|line| line.trim().strip_prefix("role:"))
        .find_map(|role| match role.trim() {
            "master" => Some(NodeRole::Upstream),
            "slave" | "replica" => Some(NodeRole::Replica),
            _ => None,
        })
}

/// `CLUSTER NODES`
pub(crate) async fn cluster_primaries<C>(conn: &mut C) -> RedisResult<Vec<NodeAddr>>
where
    C: ConnectionLike + Send,
{
    let nodes = cmd("CLUSTER")
        .arg("NODES")
        .query_async::<String>(conn)
        .await?;
    Ok(parse_cluster_primaries(&nodes))
}

/// 從 `CLUSTER NODES` 輸出中取出健康的主節點地址，按地址排序
///
/// 行格式: `<id> <ip:port@cport[,hostname]> <flags> <master> <ping-sent> <pong-recv> <config-epoch> <link-state> <slot> ...`
pub fn parse_cluster_primaries(output: &str) -> Vec<NodeAddr> {
    let mut primaries: Vec<NodeAddr> = output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 8 {
                return None;
            }
            let flags: Vec<&str> = parts[2].split(',').collect();
            let unusable = ["fail", "fail?", "noaddr", "handshake"];
            if !flags.contains(&"master") || flags.iter().any(|flag| unusable.contains(flag)) {
                return None;
            }
            let addr = parts[1].split('@').next()?;
            let (host, port) = addr.rsplit_once(':')?;
            if host.is_empty() {
                return None;
            }
            let port = port.parse::<u16>().ok()?;
            Some(NodeAddr::new(host, port))
        })
        .collect();
    primaries.sort();
    primaries.dedup();
    primaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::{Cmd, ErrorKind, Pipeline, RedisFuture, Value};
    use std::collections::VecDeque;

    /// 記錄送出的命令參數並依序返回預設回覆
    #[derive(Default)]
    struct RecordingConnection {
        replies: VecDeque<Value>,
        sent: Vec<Vec<String>>,
    }

    impl RecordingConnection {
        fn replying(replies: Vec<Value>) -> Self {
            Self {
                replies: replies.into(),
                sent: Vec::new(),
            }
        }
    }

    /// 把 RESP 編碼的命令還原為參數列表
    fn unpack(packed: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(packed);
        text.split("\r\n")
            .skip(1)
            .filter(|part| !part.is_empty())
            .skip(1)
            .step_by(2)
            .map(str::to_string)
            .collect()
    }

    impl ConnectionLike for RecordingConnection {
        fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
            self.sent.push(unpack(&cmd.get_packed_command()));
            let reply = self.replies.pop_front();
            Box::pin(async move { reply.ok_or_else(|| (ErrorKind::IoError, "沒有預設回覆").into()) })
        }

        fn req_packed_commands<'a>(
            &'a mut self,
            _cmd: &'a Pipeline,
            _offset: usize,
            _count: usize,
        ) -> RedisFuture<'a, Vec<Value>> {
            Box::pin(async { Err((ErrorKind::IoError, "不支援管線").into()) })
        }

        fn get_db(&self) -> i64 {
            0
        }
    }

    fn bulk(text: &str) -> Value {
        Value::BulkString(text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_scan_arguments_and_reply() {
        let mut conn = RecordingConnection::replying(vec![Value::Array(vec![
            bulk("17"),
            Value::Array(vec![bulk("user:1"), bulk("user:2")]),
        ])]);

        let (next, keys) = scan(&mut conn, 0, "user:*", 500).await.expect("SCAN失敗");

        assert_eq!(conn.sent, vec![vec!["SCAN", "0", "MATCH", "user:*", "COUNT", "500"]]);
        assert_eq!(next, 17);
        assert_eq!(keys, vec!["user:1".to_string(), "user:2".to_string()]);
    }

    #[tokio::test]
    async fn test_nearest_member_arguments() {
        let mut conn = RecordingConnection::replying(vec![Value::Array(vec![bulk("tiananmen")])]);

        let nearest = nearest_member(&mut conn, "places", 116.25, 39.5, 1500.5)
            .await
            .expect("GEORADIUS失敗");

        assert_eq!(nearest.as_deref(), Some("tiananmen"));
        assert_eq!(
            conn.sent,
            vec![vec!["GEORADIUS", "places", "116.25", "39.5", "1500.5", "m", "COUNT", "1", "ASC"]]
        );
    }

    #[tokio::test]
    async fn test_nearest_member_empty_reply_is_none() {
        let mut conn = RecordingConnection::replying(vec![Value::Array(vec![])]);
        let nearest = nearest_member(&mut conn, "places", 0.5, 0.5, 10.5)
            .await
            .expect("GEORADIUS失敗");
        assert_eq!(nearest, None);
    }

    #[tokio::test]
    async fn test_geo_add_and_ping_replies() {
        let mut conn = RecordingConnection::replying(vec![
            Value::Int(1),
            Value::Int(0),
            Value::SimpleString("PONG".to_string()),
        ]);

        assert!(geo_add(&mut conn, "places", 116.25, 39.5, "gate").await.expect("GEOADD失敗"));
        assert!(!geo_add(&mut conn, "places", 116.25, 39.5, "gate").await.expect("GEOADD失敗"));
        assert_eq!(ping(&mut conn).await.expect("PING失敗"), "PONG");
        assert_eq!(conn.sent[0], vec!["GEOADD", "places", "116.25", "39.5", "gate"]);
        assert_eq!(conn.sent[2], vec!["PING"]);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_errors() {
        let mut conn = RecordingConnection::default();
        let result = with_timeout(Duration::from_secs(1), "PING", ping(&mut conn)).await;
        assert!(matches!(result, Err(RedisClientError::ConnectionError(_))));

        let result = with_timeout(
            Duration::from_millis(10),
            "SCAN",
            std::future::pending::<RedisResult<()>>(),
        )
        .await;
        assert!(matches!(result, Err(RedisClientError::TimeoutError(_))));
    }

    #[test]
    fn test_parse_replication_role() {
        let master = "# Replication\r\nrole:master\r\nconnected_slaves:2\r\n";
        assert_eq!(parse_replication_role(master), Some(NodeRole::Upstream));

        let replica = "# Replication\r\nrole:slave\r\nmaster_host:10.0.0.1\r\n";
        assert_eq!(parse_replication_role(replica), Some(NodeRole::Replica));

        assert_eq!(parse_replication_role("# Replication\r\n"), None);
    }

    #[test]
    fn test_parse_cluster_primaries() {
        let output = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004,host-4 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
6ec23923021cf3ffec47632106199cb7f496ce01 127.0.0.1:30005@31005 master,fail - 1426238316232 0 5 disconnected
broken line
";
        let primaries = parse_cluster_primaries(output);
        assert_eq!(
            primaries,
            vec![
                NodeAddr::new("127.0.0.1", 30001),
                NodeAddr::new("127.0.0.1", 30002),
                NodeAddr::new("127.0.0.1", 30003),
            ]
        );
    }
}
