use crate::config::Config;
use anyhow::{Context, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::fs::Metadata;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Front-end response cache: rendered bodies on disk, keyed by request path.
#[derive(Clone)]
pub struct ResponseCache {
    pub dir: PathBuf,
    pub ttl: Duration,
    pub max_size_bytes: u64,
    pub touch_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub hash: String,
    pub path: PathBuf,
}

impl ResponseCache {
    pub fn new(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("create cache dir {}", config.cache_dir.display()))?;
        Ok(Self {
            dir: config.cache_dir.clone(),
            ttl: config.cache_ttl,
            max_size_bytes: config.cache_max_size_bytes,
            touch_interval: config.cache_touch_interval,
        })
    }

    /// Entries live at `<dir>/<first two hex chars>/<sha256>.jpg`.
    pub fn key_for(&self, request_path: &str) -> CacheKey {
        let hash = hex::encode(Sha256::digest(request_path.as_bytes()));
        let path = self.dir.join(&hash[0..2]).join(format!("{hash}.jpg"));
        CacheKey { hash, path }
    }

    /// Reads a fresh body. Expired entries are deleted and reported as misses; hits refresh
    /// the mtime at most once per touch interval.
    pub async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let metadata = match tokio::fs::metadata(&key.path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let age = age_of(&metadata);
        if age > self.ttl {
            debug!(hash = %key.hash, age_secs = age.as_secs(), "response cache entry expired");
            let _ = tokio::fs::remove_file(&key.path).await;
            return Ok(None);
        }
        let bytes = match tokio::fs::read(&key.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if self.touch_interval.is_zero() || age >= self.touch_interval {
            self.touch(&key.path).await;
        }
        debug!(size = bytes.len(), hash = %key.hash, "response cache hit");
        Ok(Some(bytes))
    }

    /// Stages the body in a temp file inside the shard and renames it into place, so a
    /// concurrent `load` sees either nothing or the whole body.
    pub async fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        let path = key.path.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let shard = path.parent().context("cache entry has no shard directory")?;
            std::fs::create_dir_all(shard)?;
            let mut staged = tempfile::NamedTempFile::new_in(shard)?;
            staged.write_all(&bytes)?;
            staged.persist(&path)?;
            Ok(())
        })
        .await
        .context("cache store task")?
    }

    pub async fn size_bytes(&self) -> Result<u64> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            Ok(cached_files(&dir)?
                .iter()
                .map(|(_, metadata)| metadata.len())
                .sum())
        })
        .await?
    }

    pub async fn evict_loop(self, interval: Duration) {
        loop {
            match self.evict_once().await {
                Ok(sweep) if sweep.expired > 0 || sweep.evicted > 0 => {
                    info!(
                        expired = sweep.expired,
                        evicted = sweep.evicted,
                        remaining_bytes = sweep.remaining_bytes,
                        "response cache swept"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = ?err, "cache eviction error"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn evict_once(&self) -> Result<Sweep> {
        let dir = self.dir.clone();
        let ttl = self.ttl;
        let budget = self.max_size_bytes;
        tokio::task::spawn_blocking(move || sweep(&dir, ttl, budget))
            .await
            .context("sweep response cache")?
    }

    async fn touch(&self, path: &Path) {
        let path = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&path, FileTime::from_system_time(SystemTime::now()))
        })
        .await;
        if let Ok(Err(err)) = result {
            debug!(error = %err, "response cache touch failed");
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Sweep {
    expired: usize,
    evicted: usize,
    remaining_bytes: u64,
}

/// Drops expired entries, then the least recently used ones until the total fits `budget`.
fn sweep(dir: &Path, ttl: Duration, budget: u64) -> Result<Sweep> {
    let mut result = Sweep::default();
    let mut live = Vec::new();
    for (path, metadata) in cached_files(dir)? {
        let age = age_of(&metadata);
        if age > ttl {
            if std::fs::remove_file(&path).is_ok() {
                result.expired += 1;
            }
            continue;
        }
        result.remaining_bytes += metadata.len();
        live.push((age, metadata.len(), path));
    }

    // Oldest first.
    live.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, len, path) in live {
        if result.remaining_bytes <= budget {
            break;
        }
        if std::fs::remove_file(&path).is_ok() {
            result.remaining_bytes = result.remaining_bytes.saturating_sub(len);
            result.evicted += 1;
        }
    }
    Ok(result)
}

/// Regular files one level below the shard directories. Symlinks and stray top-level files
/// are not cache entries.
fn cached_files(dir: &Path) -> Result<Vec<(PathBuf, Metadata)>> {
    let shards = match std::fs::read_dir(dir) {
        Ok(shards) => shards,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut files = Vec::new();
    for shard in shards {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(shard.path())? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                files.push((entry.path(), metadata));
            }
        }
    }
    Ok(files)
}

/// Clock skew (mtime in the future) counts as brand new.
fn age_of(metadata: &Metadata) -> Duration {
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

type Flights = Arc<DashMap<String, Arc<Notify>>>;

/// Coalesces concurrent renders of the same request path: the first caller leads, later
/// callers follow and wait for the leader to finish.
#[derive(Clone, Default)]
pub struct Singleflight {
    flights: Flights,
}

pub enum Flight {
    Leader(FlightLeader),
    Follower(FlightFollower),
}

impl Singleflight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> Flight {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(entry) => Flight::Follower(FlightFollower {
                key: key.to_string(),
                done: entry.get().clone(),
                flights: self.flights.clone(),
            }),
            Entry::Vacant(entry) => {
                let done = Arc::new(Notify::new());
                entry.insert(done.clone());
                Flight::Leader(FlightLeader {
                    key: key.to_string(),
                    done,
                    flights: self.flights.clone(),
                })
            }
        }
    }
}

/// Held while rendering. Dropping it ends the flight and wakes every follower.
pub struct FlightLeader {
    key: String,
    done: Arc<Notify>,
    flights: Flights,
}

impl Drop for FlightLeader {
    fn drop(&mut self) {
        self.flights
            .remove_if(&self.key, |_, done| Arc::ptr_eq(done, &self.done));
        self.done.notify_waiters();
    }
}

pub struct FlightFollower {
    key: String,
    done: Arc<Notify>,
    flights: Flights,
}

impl FlightFollower {
    /// Returns false if the leader is still running after `timeout`.
    pub async fn wait(self, timeout: Duration) -> bool {
        let finished = self.done.notified();
        tokio::pin!(finished);
        finished.as_mut().enable();
        let still_running = self
            .flights
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &self.done));
        if !still_running {
            return true;
        }
        tokio::time::timeout(timeout, finished).await.is_ok()
    }
}
