//! 整合測試共用的記憶體後端
//!
//! 模擬 Redis 的 SCAN 分頁、GEO 查詢與關閉行為，不需要真實服務。

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use redis_util::config::DeploymentMode;
use redis_util::redis::{
    EndpointKey, ManagedConnection, RedisClientError, RedisOperations, ScanCursor, ScanPage,
    ScanSource,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Redis GEO 使用的地球半徑（米）
const EARTH_RADIUS_METERS: f64 = 6_372_797.560856;

pub fn standalone_key(uri: &str) -> EndpointKey {
    EndpointKey::single(DeploymentMode::Standalone, uri)
}

/// 記憶體中的 Redis 連接
pub struct MemoryConnection {
    endpoint: EndpointKey,
    values: Mutex<BTreeMap<String, String>>,
    geo: Mutex<BTreeMap<String, Vec<(String, f64, f64)>>>,
    closed: AtomicBool,
    fail_close: bool,
    pub round_trips: AtomicUsize,
    pub closes: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MemoryConnection {
    pub fn new(endpoint: EndpointKey) -> Self {
        Self {
            endpoint,
            values: Mutex::new(BTreeMap::new()),
            geo: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            fail_close: false,
            round_trips: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// 關閉時總是返回錯誤的連接
    pub fn failing_close(endpoint: EndpointKey) -> Self {
        Self {
            fail_close: true,
            ..Self::new(endpoint)
        }
    }

    pub fn with_keys<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut values = self.values.lock();
            for key in keys {
                values.insert(key.into(), "1".to_string());
            }
        }
        self
    }

    fn ensure_open(&self) -> Result<(), RedisClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RedisClientError::Closed(self.endpoint.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ManagedConnection for MemoryConnection {
    fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    async fn close(&self) -> Result<(), RedisClientError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(RedisClientError::Closed(format!("模擬關閉失敗: {}", self.endpoint)));
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RedisClientError::Closed(self.endpoint.to_string()));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RedisClientError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ScanSource for MemoryConnection {
    /// 游標為鍵空間中的位置，`count` 為每次檢查的鍵數，與服務器的語義一致
    async fn scan_page(
        &self,
        cursor: Option<&ScanCursor>,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, RedisClientError> {
        self.ensure_open()?;
        self.round_trips.fetch_add(1, Ordering::SeqCst);

        let start = cursor.map(ScanCursor::resume_token).unwrap_or(0) as usize;
        let values = self.values.lock();
        let keys: Vec<String> = values
            .keys()
            .skip(start)
            .take(count)
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        let end = start + count;
        let next = if end >= values.len() { 0 } else { end as u64 };
        Ok(ScanPage::from_reply(next, keys))
    }
}

#[async_trait]
impl RedisOperations for MemoryConnection {
    async fn get(&self, key: &str) -> Result<Option<String>, RedisClientError> {
        self.ensure_open()?;
        Ok(self.values.lock().get(key).cloned())
    }

    async fn geo_add(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        member: &str,
    ) -> Result<bool, RedisClientError> {
        self.ensure_open()?;
        let mut geo = self.geo.lock();
        let members = geo.entry(key.to_string()).or_default();
        match members.iter_mut().find(|(name, _, _)| name == member) {
            Some(existing) => {
                existing.1 = longitude;
                existing.2 = latitude;
                Ok(false)
            }
            None => {
                members.push((member.to_string(), longitude, latitude));
                Ok(true)
            }
        }
    }

    async fn nearest_member(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_meters: f64,
    ) -> Result<Option<String>, RedisClientError> {
        self.ensure_open()?;
        let geo = self.geo.lock();
        let nearest = geo.get(key).and_then(|members| {
            members
                .iter()
                .map(|(name, lon, lat)| (name, haversine_meters(longitude, latitude, *lon, *lat)))
                .filter(|(_, distance)| *distance <= radius_meters)
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(name, _)| name.clone())
        });
        Ok(nearest)
    }

    async fn ping(&self) -> Result<String, RedisClientError> {
        self.ensure_open()?;
        Ok("PONG".to_string())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// 支持 `*` 與 `?` 的 glob 匹配
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

pub fn haversine_meters(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
}
