// Cache Port
//
// Typed operations over an abstract KV store. Production uses Redis with
// multiplexed async connections and pipelining; tests substitute the
// in-memory implementation. The cache only ever holds derived views with
// TTLs: losing it never loses data.

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::AppMetrics;

/// Response deadline for any single cache operation.
pub const CACHE_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reserved key namespaces and derivation helpers. Every cache key the
/// service writes goes through one of these.
pub mod keys {
    use crate::models::StatsPeriod;

    pub fn app_by_id(id: &str) -> String {
        format!("app:id:{id}")
    }

    pub fn app_by_api_key(api_key: &str) -> String {
        format!("app:apikey:{api_key}")
    }

    pub fn session(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    pub fn stats(app_id: &str, period: StatsPeriod, bucket: &str) -> String {
        format!("stats:{app_id}:{}:{bucket}", period.as_str())
    }

    pub fn stats_pattern(app_id: &str) -> String {
        format!("stats:{app_id}:*")
    }

    pub fn pageviews(app_id: &str) -> String {
        format!("pageview:{app_id}")
    }

    pub fn referrers(app_id: &str) -> String {
        format!("referrer:{app_id}")
    }

    pub fn devices(app_id: &str) -> String {
        format!("device:{app_id}")
    }

    pub fn countries(app_id: &str) -> String {
        format!("country:{app_id}")
    }

    pub fn webhook_rate(webhook_id: &str) -> String {
        format!("ratelimit:webhook:{webhook_id}")
    }
}

/// Default TTLs in seconds.
pub mod ttl {
    pub const APP: u64 = 3600;
    pub const COUNTERS: u64 = 86400;
    pub const RATE_WINDOW: u64 = 60;
}

/// Abstract KV store port. String values in and out; the typed JSON
/// layer sits on top in [`Cache`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;
    async fn delete(&self, keys: &[String]) -> Result<u64>;
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<u64>;

    async fn lpush(&self, key: &str, value: &str) -> Result<i64>;
    async fn rpush(&self, key: &str, value: &str) -> Result<i64>;
    async fn lpop(&self, key: &str) -> Result<Option<String>>;
    async fn rpop(&self, key: &str) -> Result<Option<String>>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn sadd(&self, key: &str, member: &str) -> Result<i64>;
    async fn srem(&self, key: &str, member: &str) -> Result<i64>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64>;
    async fn zrem(&self, key: &str, member: &str) -> Result<u64>;
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// Enumerate keys matching a glob pattern. Backed by SCAN, never
    /// KEYS, on Redis.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Pipeline: set many (key, value, ttl) entries in one round trip.
    async fn set_batch(&self, entries: &[(String, String, u64)]) -> Result<()>;

    /// Pipeline: bump many (zset key, member) counters in one round trip.
    async fn zincr_batch(&self, bumps: &[(String, String)]) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

// ============================================================================
// Redis implementation
// ============================================================================

/// RedisCache using multiple MultiplexedConnection instances. Each
/// connection pipelines internally; multiple connections spread load
/// across request tasks.
pub struct RedisCache {
    connections: Vec<MultiplexedConnection>,
    conn_count: usize,
    metrics: Arc<AppMetrics>,
}

impl RedisCache {
    pub async fn new(redis_url: &str, pool_size: u32, metrics: Arc<AppMetrics>) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn_count = pool_size.max(1) as usize;

        let mut connections = Vec::with_capacity(conn_count);
        for _ in 0..conn_count {
            let conn = client
                .get_multiplexed_async_connection_with_timeouts(
                    CACHE_OP_TIMEOUT,
                    Duration::from_secs(5),
                )
                .await?;
            connections.push(conn);
        }

        // Test first connection
        let mut test_conn = connections[0].clone();
        let _: String = redis::cmd("PING").query_async(&mut test_conn).await?;

        info!("Redis established with {} multiplexed connections", conn_count);
        Ok(Self {
            connections,
            conn_count,
            metrics,
        })
    }

    /// Round-robin a connection across tasks.
    fn get_conn(&self) -> MultiplexedConnection {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let idx = COUNTER.fetch_add(1, Ordering::Relaxed) % self.conn_count;
        self.connections[idx].clone()
    }

    fn record<T>(&self, op: &str, start: Instant, result: Result<T>) -> Result<T> {
        let elapsed = start.elapsed().as_secs_f64();
        match &result {
            Ok(_) => self.metrics.record_cache_operation(op, "success", elapsed),
            Err(_) => self.metrics.record_cache_operation(op, "error", elapsed),
        }
        result
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => {
                let result = if value.is_some() { "hit" } else { "miss" };
                self.metrics
                    .record_cache_operation("get", result, start.elapsed().as_secs_f64());
                Ok(value)
            }
            Err(e) => {
                self.metrics
                    .record_cache_operation("get", "error", start.elapsed().as_secs_f64());
                Err(e.into())
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = match ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await,
            None => conn.set::<_, _, ()>(key, value).await,
        };
        self.record("set", start, res.map_err(Into::into))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.del::<_, u64>(keys).await;
        self.record("del", start, res.map_err(Into::into))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.exists::<_, bool>(key).await;
        self.record("exists", start, res.map_err(Into::into))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.hget::<_, _, Option<String>>(key, field).await;
        self.record("hget", start, res.map_err(Into::into))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.hset::<_, _, _, ()>(key, field, value).await;
        self.record("hset", start, res.map_err(Into::into))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.hgetall::<_, HashMap<String, String>>(key).await;
        self.record("hgetall", start, res.map_err(Into::into))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<u64> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.hdel::<_, _, u64>(key, field).await;
        self.record("hdel", start, res.map_err(Into::into))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.lpush::<_, _, i64>(key, value).await;
        self.record("lpush", start, res.map_err(Into::into))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<i64> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.rpush::<_, _, i64>(key, value).await;
        self.record("rpush", start, res.map_err(Into::into))
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.lpop::<_, Option<String>>(key, None).await;
        self.record("lpop", start, res.map_err(Into::into))
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.rpop::<_, Option<String>>(key, None).await;
        self.record("rpop", start, res.map_err(Into::into))
    }

    async fn lrange(&self, key: &str, start_idx: isize, stop: isize) -> Result<Vec<String>> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.lrange::<_, Vec<String>>(key, start_idx, stop).await;
        self.record("lrange", start, res.map_err(Into::into))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<i64> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.sadd::<_, _, i64>(key, member).await;
        self.record("sadd", start, res.map_err(Into::into))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<i64> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.srem::<_, _, i64>(key, member).await;
        self.record("srem", start, res.map_err(Into::into))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.smembers::<_, Vec<String>>(key).await;
        self.record("smembers", start, res.map_err(Into::into))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.sismember::<_, _, bool>(key, member).await;
        self.record("sismember", start, res.map_err(Into::into))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.zadd::<_, _, _, ()>(key, member, score).await;
        self.record("zadd", start, res.map_err(Into::into))
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = redis::cmd("ZINCRBY")
            .arg(key)
            .arg(delta)
            .arg(member)
            .query_async::<f64>(&mut conn)
            .await;
        self.record("zincrby", start, res.map_err(Into::into))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.zrem::<_, _, u64>(key, member).await;
        self.record("zrem", start, res.map_err(Into::into))
    }

    async fn zrange(&self, key: &str, start_idx: isize, stop: isize) -> Result<Vec<String>> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.zrange::<_, Vec<String>>(key, start_idx, stop).await;
        self.record("zrange", start, res.map_err(Into::into))
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start_idx: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn
            .zrange_withscores::<_, Vec<(String, f64)>>(key, start_idx, stop)
            .await;
        self.record("zrange_withscores", start, res.map_err(Into::into))
    }

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.incr::<_, _, i64>(key, delta).await;
        self.record("incr", start, res.map_err(Into::into))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.expire::<_, bool>(key, ttl_secs as i64).await;
        self.record("expire", start, res.map_err(Into::into))
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let start = Instant::now();
        let mut conn = self.get_conn();
        let res = conn.ttl::<_, i64>(key).await;
        self.record("ttl", start, res.map_err(Into::into))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        // SCAN instead of KEYS (non-blocking)
        let start = Instant::now();
        let mut conn = self.get_conn();
        let mut cursor: u64 = 0;
        let mut all_keys: Vec<String> = Vec::new();

        let res = loop {
            let scan = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await;
            match scan {
                Ok((new_cursor, keys)) => {
                    all_keys.extend(keys);
                    cursor = new_cursor;
                    if cursor == 0 {
                        break Ok(all_keys);
                    }
                }
                Err(e) => break Err(e.into()),
            }
        };
        self.record("scan", start, res)
    }

    async fn set_batch(&self, entries: &[(String, String, u64)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let mut conn = self.get_conn();

        let mut pipe = redis::pipe();
        for (key, value, ttl) in entries {
            pipe.set_ex(key, value, *ttl).ignore();
        }
        let res = pipe.query_async::<()>(&mut conn).await;
        self.record("batch_set", start, res.map_err(Into::into))
    }

    async fn zincr_batch(&self, bumps: &[(String, String)]) -> Result<()> {
        if bumps.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let mut conn = self.get_conn();

        let mut pipe = redis::pipe();
        for (key, member) in bumps {
            pipe.cmd("ZINCRBY").arg(key).arg(1.0f64).arg(member).ignore();
            pipe.expire(key, ttl::COUNTERS as i64).ignore();
        }
        let res = pipe.query_async::<()>(&mut conn).await;
        self.record("batch_zincr", start, res.map_err(Into::into))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

// ============================================================================
// Typed layer
// ============================================================================

/// Typed JSON wrapper over the cache port. A cache hit that cannot be
/// decoded is treated as a miss, never an error.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(v) => Ok(Some(v)),
                Err(e) => {
                    warn!("undecodable cache entry at {key}, treating as miss: {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, &raw, Some(ttl_secs)).await
    }

    pub async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.store.delete(keys).await
    }

    /// Delete every key under a pattern; returns the number removed.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let keys = self.store.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.store.delete(&keys).await
    }
}

// ============================================================================
// In-memory implementation (tests and local development)
// ============================================================================

mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashSet, VecDeque};
    use std::sync::Mutex;
    use std::time::Instant as StdInstant;

    #[derive(Debug, Clone)]
    enum Value {
        Str(String),
        Hash(HashMap<String, String>),
        List(VecDeque<String>),
        Set(HashSet<String>),
        ZSet(BTreeMap<String, f64>),
        Counter(i64),
    }

    #[derive(Debug, Clone)]
    struct Entry {
        value: Value,
        expires_at: Option<StdInstant>,
    }

    impl Entry {
        fn live(&self) -> bool {
            match self.expires_at {
                Some(at) => StdInstant::now() < at,
                None => true,
            }
        }
    }

    /// In-memory CacheStore with lazy expiry. Same observable semantics
    /// as the Redis implementation for everything the services use.
    #[derive(Default)]
    pub struct MemoryCache {
        entries: Mutex<HashMap<String, Entry>>,
    }

    impl MemoryCache {
        pub fn new() -> Self {
            Self::default()
        }

        fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> R) -> R {
            let mut guard = self.entries.lock().expect("memory cache poisoned");
            guard.retain(|_, e| e.live());
            f(&mut guard)
        }
    }

    fn glob_match(pattern: &str, key: &str) -> bool {
        // Supports the '*' wildcard only, which is all the service uses
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 1 {
            return pattern == key;
        }
        let mut rest = key;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            if i == 0 {
                match rest.strip_prefix(part) {
                    Some(r) => rest = r,
                    None => return false,
                }
            } else if i == parts.len() - 1 {
                return rest.ends_with(part);
            } else {
                match rest.find(part) {
                    Some(pos) => rest = &rest[pos + part.len()..],
                    None => return false,
                }
            }
        }
        true
    }

    #[async_trait]
    impl CacheStore for MemoryCache {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.with_entries(|m| {
                Ok(m.get(key).and_then(|e| match &e.value {
                    Value::Str(s) => Some(s.clone()),
                    Value::Counter(n) => Some(n.to_string()),
                    _ => None,
                }))
            })
        }

        async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
            self.with_entries(|m| {
                m.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str(value.to_string()),
                        expires_at: ttl_secs
                            .map(|t| StdInstant::now() + Duration::from_secs(t)),
                    },
                );
                Ok(())
            })
        }

        async fn delete(&self, keys: &[String]) -> Result<u64> {
            self.with_entries(|m| {
                let mut removed = 0;
                for key in keys {
                    if m.remove(key).is_some() {
                        removed += 1;
                    }
                }
                Ok(removed)
            })
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.with_entries(|m| Ok(m.contains_key(key)))
        }

        async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
            self.with_entries(|m| {
                Ok(m.get(key).and_then(|e| match &e.value {
                    Value::Hash(h) => h.get(field).cloned(),
                    _ => None,
                }))
            })
        }

        async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
            self.with_entries(|m| {
                let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                });
                if let Value::Hash(h) = &mut entry.value {
                    h.insert(field.to_string(), value.to_string());
                }
                Ok(())
            })
        }

        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
            self.with_entries(|m| {
                Ok(match m.get(key) {
                    Some(Entry {
                        value: Value::Hash(h),
                        ..
                    }) => h.clone(),
                    _ => HashMap::new(),
                })
            })
        }

        async fn hdel(&self, key: &str, field: &str) -> Result<u64> {
            self.with_entries(|m| {
                if let Some(Entry {
                    value: Value::Hash(h),
                    ..
                }) = m.get_mut(key)
                {
                    return Ok(h.remove(field).map(|_| 1).unwrap_or(0));
                }
                Ok(0)
            })
        }

        async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
            self.with_entries(|m| {
                let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                });
                if let Value::List(l) = &mut entry.value {
                    l.push_front(value.to_string());
                    return Ok(l.len() as i64);
                }
                Ok(0)
            })
        }

        async fn rpush(&self, key: &str, value: &str) -> Result<i64> {
            self.with_entries(|m| {
                let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                });
                if let Value::List(l) = &mut entry.value {
                    l.push_back(value.to_string());
                    return Ok(l.len() as i64);
                }
                Ok(0)
            })
        }

        async fn lpop(&self, key: &str) -> Result<Option<String>> {
            self.with_entries(|m| {
                if let Some(Entry {
                    value: Value::List(l),
                    ..
                }) = m.get_mut(key)
                {
                    return Ok(l.pop_front());
                }
                Ok(None)
            })
        }

        async fn rpop(&self, key: &str) -> Result<Option<String>> {
            self.with_entries(|m| {
                if let Some(Entry {
                    value: Value::List(l),
                    ..
                }) = m.get_mut(key)
                {
                    return Ok(l.pop_back());
                }
                Ok(None)
            })
        }

        async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
            self.with_entries(|m| {
                if let Some(Entry {
                    value: Value::List(l),
                    ..
                }) = m.get(key)
                {
                    let len = l.len() as isize;
                    let norm = |i: isize| -> isize {
                        if i < 0 {
                            (len + i).max(0)
                        } else {
                            i.min(len - 1)
                        }
                    };
                    if len == 0 {
                        return Ok(Vec::new());
                    }
                    let (s, e) = (norm(start), norm(stop));
                    if s > e {
                        return Ok(Vec::new());
                    }
                    return Ok(l
                        .iter()
                        .skip(s as usize)
                        .take((e - s + 1) as usize)
                        .cloned()
                        .collect());
                }
                Ok(Vec::new())
            })
        }

        async fn sadd(&self, key: &str, member: &str) -> Result<i64> {
            self.with_entries(|m| {
                let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                });
                if let Value::Set(s) = &mut entry.value {
                    return Ok(s.insert(member.to_string()) as i64);
                }
                Ok(0)
            })
        }

        async fn srem(&self, key: &str, member: &str) -> Result<i64> {
            self.with_entries(|m| {
                if let Some(Entry {
                    value: Value::Set(s),
                    ..
                }) = m.get_mut(key)
                {
                    return Ok(s.remove(member) as i64);
                }
                Ok(0)
            })
        }

        async fn smembers(&self, key: &str) -> Result<Vec<String>> {
            self.with_entries(|m| {
                Ok(match m.get(key) {
                    Some(Entry {
                        value: Value::Set(s),
                        ..
                    }) => s.iter().cloned().collect(),
                    _ => Vec::new(),
                })
            })
        }

        async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
            self.with_entries(|m| {
                Ok(matches!(
                    m.get(key),
                    Some(Entry {
                        value: Value::Set(s),
                        ..
                    }) if s.contains(member)
                ))
            })
        }

        async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
            self.with_entries(|m| {
                let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                    value: Value::ZSet(BTreeMap::new()),
                    expires_at: None,
                });
                if let Value::ZSet(z) = &mut entry.value {
                    z.insert(member.to_string(), score);
                }
                Ok(())
            })
        }

        async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
            self.with_entries(|m| {
                let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                    value: Value::ZSet(BTreeMap::new()),
                    expires_at: None,
                });
                if let Value::ZSet(z) = &mut entry.value {
                    let score = z.entry(member.to_string()).or_insert(0.0);
                    *score += delta;
                    return Ok(*score);
                }
                Ok(0.0)
            })
        }

        async fn zrem(&self, key: &str, member: &str) -> Result<u64> {
            self.with_entries(|m| {
                if let Some(Entry {
                    value: Value::ZSet(z),
                    ..
                }) = m.get_mut(key)
                {
                    return Ok(z.remove(member).map(|_| 1).unwrap_or(0));
                }
                Ok(0)
            })
        }

        async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
            let with_scores = self.zrange_withscores(key, start, stop).await?;
            Ok(with_scores.into_iter().map(|(m, _)| m).collect())
        }

        async fn zrange_withscores(
            &self,
            key: &str,
            start: isize,
            stop: isize,
        ) -> Result<Vec<(String, f64)>> {
            self.with_entries(|m| {
                if let Some(Entry {
                    value: Value::ZSet(z),
                    ..
                }) = m.get(key)
                {
                    // Sort ascending by score, ties by member, like Redis
                    let mut pairs: Vec<(String, f64)> =
                        z.iter().map(|(k, v)| (k.clone(), *v)).collect();
                    pairs.sort_by(|a, b| {
                        a.1.partial_cmp(&b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(&b.0))
                    });
                    let len = pairs.len() as isize;
                    if len == 0 {
                        return Ok(Vec::new());
                    }
                    let norm = |i: isize| -> isize {
                        if i < 0 {
                            (len + i).max(0)
                        } else {
                            i.min(len - 1)
                        }
                    };
                    let (s, e) = (norm(start), norm(stop));
                    if s > e {
                        return Ok(Vec::new());
                    }
                    return Ok(pairs[s as usize..=(e as usize)].to_vec());
                }
                Ok(Vec::new())
            })
        }

        async fn incrby(&self, key: &str, delta: i64) -> Result<i64> {
            self.with_entries(|m| {
                let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                    value: Value::Counter(0),
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::Counter(n) => {
                        *n += delta;
                        Ok(*n)
                    }
                    Value::Str(s) => {
                        let n = s.parse::<i64>().unwrap_or(0) + delta;
                        entry.value = Value::Counter(n);
                        Ok(n)
                    }
                    _ => Ok(0),
                }
            })
        }

        async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
            self.with_entries(|m| {
                if let Some(entry) = m.get_mut(key) {
                    entry.expires_at = Some(StdInstant::now() + Duration::from_secs(ttl_secs));
                    return Ok(true);
                }
                Ok(false)
            })
        }

        async fn ttl(&self, key: &str) -> Result<i64> {
            self.with_entries(|m| {
                Ok(match m.get(key) {
                    Some(Entry {
                        expires_at: Some(at),
                        ..
                    }) => {
                        let now = StdInstant::now();
                        if *at > now {
                            (*at - now).as_secs() as i64
                        } else {
                            -2
                        }
                    }
                    Some(_) => -1,
                    None => -2,
                })
            })
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
            self.with_entries(|m| {
                Ok(m.keys()
                    .filter(|k| glob_match(pattern, k))
                    .cloned()
                    .collect())
            })
        }

        async fn set_batch(&self, entries: &[(String, String, u64)]) -> Result<()> {
            for (key, value, ttl) in entries {
                self.set(key, value, Some(*ttl)).await?;
            }
            Ok(())
        }

        async fn zincr_batch(&self, bumps: &[(String, String)]) -> Result<()> {
            for (key, member) in bumps {
                self.zincrby(key, member, 1.0).await?;
            }
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn string_ops_and_ttl() {
            let c = MemoryCache::new();
            c.set("k", "v", Some(60)).await.unwrap();
            assert_eq!(c.get("k").await.unwrap().as_deref(), Some("v"));
            assert!(c.exists("k").await.unwrap());
            assert!(c.ttl("k").await.unwrap() > 0);
            assert_eq!(c.delete(&["k".to_string()]).await.unwrap(), 1);
            assert_eq!(c.get("k").await.unwrap(), None);
            assert_eq!(c.ttl("k").await.unwrap(), -2);
        }

        #[tokio::test]
        async fn counters_are_commutative() {
            let c = MemoryCache::new();
            assert_eq!(c.incrby("n", 1).await.unwrap(), 1);
            assert_eq!(c.incrby("n", 5).await.unwrap(), 6);
            assert_eq!(c.incrby("n", -2).await.unwrap(), 4);
        }

        #[tokio::test]
        async fn zset_ordering_and_range() {
            let c = MemoryCache::new();
            c.zincrby("z", "b", 2.0).await.unwrap();
            c.zincrby("z", "a", 2.0).await.unwrap();
            c.zincrby("z", "c", 5.0).await.unwrap();
            let all = c.zrange_withscores("z", 0, -1).await.unwrap();
            assert_eq!(
                all,
                vec![
                    ("a".to_string(), 2.0),
                    ("b".to_string(), 2.0),
                    ("c".to_string(), 5.0)
                ]
            );
            // Top entry by score
            let top = c.zrange("z", -1, -1).await.unwrap();
            assert_eq!(top, vec!["c".to_string()]);
        }

        #[tokio::test]
        async fn pattern_enumeration() {
            let c = MemoryCache::new();
            c.set("stats:t1:daily:2026-01-01", "{}", Some(60)).await.unwrap();
            c.set("stats:t1:weekly:2026-W01", "{}", Some(60)).await.unwrap();
            c.set("stats:t2:daily:2026-01-01", "{}", Some(60)).await.unwrap();
            let mut keys = c.keys("stats:t1:*").await.unwrap();
            keys.sort();
            assert_eq!(
                keys,
                vec![
                    "stats:t1:daily:2026-01-01".to_string(),
                    "stats:t1:weekly:2026-W01".to_string()
                ]
            );
        }

        #[tokio::test]
        async fn hash_and_list_and_set_ops() {
            let c = MemoryCache::new();
            c.hset("h", "f", "1").await.unwrap();
            assert_eq!(c.hget("h", "f").await.unwrap().as_deref(), Some("1"));
            assert_eq!(c.hgetall("h").await.unwrap().len(), 1);
            assert_eq!(c.hdel("h", "f").await.unwrap(), 1);

            c.rpush("l", "a").await.unwrap();
            c.rpush("l", "b").await.unwrap();
            c.lpush("l", "z").await.unwrap();
            assert_eq!(
                c.lrange("l", 0, -1).await.unwrap(),
                vec!["z".to_string(), "a".to_string(), "b".to_string()]
            );
            assert_eq!(c.lpop("l").await.unwrap().as_deref(), Some("z"));
            assert_eq!(c.rpop("l").await.unwrap().as_deref(), Some("b"));

            c.sadd("s", "m").await.unwrap();
            assert!(c.sismember("s", "m").await.unwrap());
            assert_eq!(c.smembers("s").await.unwrap(), vec!["m".to_string()]);
            assert_eq!(c.srem("s", "m").await.unwrap(), 1);
        }

        #[test]
        fn glob_matching() {
            assert!(glob_match("stats:t1:*", "stats:t1:daily:x"));
            assert!(!glob_match("stats:t1:*", "stats:t2:daily:x"));
            assert!(glob_match("exact", "exact"));
            assert!(!glob_match("exact", "exact2"));
            assert!(glob_match("*:suffix", "any:suffix"));
        }
    }
}

pub use memory::MemoryCache;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn typed_layer_treats_undecodable_hit_as_miss() {
        let store = Arc::new(MemoryCache::new());
        store.set("k", "not json", Some(60)).await.unwrap();
        let cache = Cache::new(store);
        let got: Option<Vec<i64>> = cache.get_json("k").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn typed_round_trip_and_pattern_delete() {
        let cache = Cache::new(Arc::new(MemoryCache::new()));
        cache.put_json("stats:t:daily:d", &vec![1, 2, 3], 60).await.unwrap();
        let got: Option<Vec<i64>> = cache.get_json("stats:t:daily:d").await.unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));
        assert_eq!(cache.delete_pattern("stats:t:*").await.unwrap(), 1);
        let got: Option<Vec<i64>> = cache.get_json("stats:t:daily:d").await.unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn key_namespaces_are_stable() {
        use crate::models::StatsPeriod;
        assert_eq!(keys::app_by_id("t"), "app:id:t");
        assert_eq!(keys::app_by_api_key("K"), "app:apikey:K");
        assert_eq!(
            keys::stats("t", StatsPeriod::Daily, "2026-08-30"),
            "stats:t:daily:2026-08-30"
        );
        assert_eq!(keys::stats_pattern("t"), "stats:t:*");
        assert_eq!(keys::webhook_rate("w"), "ratelimit:webhook:w");
    }
}
