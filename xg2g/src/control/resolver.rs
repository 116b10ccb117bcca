//! Recording resolution.
//!
//! A logical recording identifier (a receiver path, or an Enigma2 service
//! reference whose last field is a path) is turned into a local file path
//! by an ordered list of prefix rules. The first matching rule wins.
//!
//! Durations are probed lazily and kept in a [`DurationStore`] until it is
//! explicitly invalidated.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::executor::Prober;
use crate::metrics::MetricsCollector;
use crate::{Error, Result};

/// One configured prefix substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    /// Identifier reported in [`RecordingRef::rule_id`]. Defaults to the rule's position.
    #[serde(default)]
    pub id: Option<String>,
    /// Prefix as seen by the receiver, e.g. `/media/hdd/movie`.
    #[serde(alias = "logical_prefix")]
    pub receiver_root: String,
    /// Prefix on this host, e.g. `/mnt/recordings`.
    #[serde(alias = "physical_prefix")]
    pub local_root: String,
}

#[derive(Debug, Clone)]
struct MappingRule {
    id: String,
    receiver_root: String,
    local_root: PathBuf,
}

/// A resolved recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingRef {
    pub logical_id: String,
    pub path: PathBuf,
    pub duration: Option<Duration>,
    pub rule_id: String,
}

/// Ordered prefix rules.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    rules: Vec<MappingRule>,
}

impl PathMapper {
    /// Validate and normalize the configured mappings.
    pub fn new(mappings: &[PathMapping]) -> Result<Self> {
        let mut rules = Vec::with_capacity(mappings.len());
        for (index, mapping) in mappings.iter().enumerate() {
            let receiver_root = normalize_root(&mapping.receiver_root).ok_or_else(|| {
                Error::config(format!(
                    "path mapping {index}: receiver_root '{}' must be an absolute, non-root path",
                    mapping.receiver_root
                ))
            })?;
            let local_root = normalize_root(&mapping.local_root).ok_or_else(|| {
                Error::config(format!(
                    "path mapping {index}: local_root '{}' must be an absolute, non-root path",
                    mapping.local_root
                ))
            })?;
            rules.push(MappingRule {
                id: mapping.id.clone().unwrap_or_else(|| format!("rule-{index}")),
                receiver_root,
                local_root: PathBuf::from(local_root),
            });
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Map a receiver path. Returns the rule id, the rule's local root and
    /// the mapped path.
    fn map(&self, receiver_path: &str) -> Result<(&MappingRule, PathBuf)> {
        let clean = clean_absolute(receiver_path).ok_or_else(|| {
            Error::unresolvable(format!(
                "'{receiver_path}' is not an absolute path without '..'"
            ))
        })?;

        for rule in &self.rules {
            let Some(rest) = clean.strip_prefix(rule.receiver_root.as_str()) else {
                continue;
            };
            if rest.is_empty() {
                return Ok((rule, rule.local_root.clone()));
            }
            if let Some(relative) = rest.strip_prefix('/') {
                return Ok((rule, rule.local_root.join(relative)));
            }
        }

        Err(Error::unresolvable(format!("no path mapping matches '{clean}'")))
    }
}

/// Trim trailing slashes, require an absolute path, and reject `/`.
fn normalize_root(root: &str) -> Option<String> {
    let trimmed = root.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let cleaned = clean_absolute(trimmed)?;
    (cleaned != "/").then_some(cleaned)
}

/// Lexically clean an absolute POSIX path. `None` for relative paths and
/// paths containing `..`.
fn clean_absolute(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            other => parts.push(other),
        }
    }
    Some(format!("/{}", parts.join("/")))
}

/// Take the path out of an Enigma2 service reference, or return the
/// identifier itself when it already is a path.
pub fn extract_receiver_path(logical_id: &str) -> &str {
    if logical_id.starts_with('/') {
        return logical_id;
    }
    match logical_id.rsplit_once(':') {
        Some((_, path)) if path.starts_with('/') => path,
        _ => logical_id,
    }
}

/// Duration cache keyed by logical identifier. Entries never expire.
#[derive(Debug, Default)]
pub struct DurationStore {
    entries: DashMap<String, Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, logical_id: &str) -> Option<Duration> {
        let found = self.entries.get(logical_id).map(|d| *d);
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a duration unless one is already cached. Returns the cached value.
    pub fn insert(&self, logical_id: &str, duration: Duration) -> Duration {
        *self
            .entries
            .entry(logical_id.to_string())
            .or_insert(duration)
    }

    /// Drop one entry, e.g. after the recording was replaced.
    pub fn invalidate(&self, logical_id: &str) -> bool {
        self.entries.remove(logical_id).is_some()
    }

    /// Drop everything, e.g. after a library rescan.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Turns logical recording identifiers into [`RecordingRef`]s.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, logical_id: &str) -> Result<RecordingRef>;
}

/// [`Resolver`] backed by a [`PathMapper`] and an optional duration cache.
pub struct RecordingsResolver {
    mapper: PathMapper,
    durations: Option<Arc<DurationStore>>,
    prober: Option<Arc<dyn Prober>>,
    require_existing: bool,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RecordingsResolver {
    pub fn new(mapper: PathMapper) -> Self {
        Self {
            mapper,
            durations: None,
            prober: None,
            require_existing: false,
            metrics: None,
        }
    }

    /// Cache durations, probing on a miss.
    pub fn with_durations(mut self, store: Arc<DurationStore>, prober: Arc<dyn Prober>) -> Self {
        self.durations = Some(store);
        self.prober = Some(prober);
        self
    }

    /// Require the mapped file to exist inside its local root.
    pub fn with_require_existing(mut self, require_existing: bool) -> Self {
        self.require_existing = require_existing;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn durations(&self) -> Option<&Arc<DurationStore>> {
        self.durations.as_ref()
    }

    async fn confine(local_root: &Path, path: &Path) -> Result<()> {
        let root = tokio::fs::canonicalize(local_root)
            .await
            .map_err(|e| Error::io_path("resolve mapping root", local_root, e))?;
        let target = tokio::fs::canonicalize(path).await.map_err(|e| {
            Error::unresolvable(format!("{} is not accessible: {e}", path.display()))
        })?;
        if !target.starts_with(&root) {
            return Err(Error::unresolvable(format!(
                "{} escapes its mapping root",
                path.display()
            )));
        }
        Ok(())
    }

    async fn duration_for(&self, logical_id: &str, path: &Path) -> Option<Duration> {
        let store = self.durations.as_ref()?;
        if let Some(duration) = store.get(logical_id) {
            if let Some(metrics) = &self.metrics {
                metrics.record_duration_cache(true);
            }
            return Some(duration);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_duration_cache(false);
        }

        let prober = self.prober.as_ref()?;
        match prober.probe(path).await {
            Ok(info) => {
                let duration = info.duration?;
                Some(store.insert(logical_id, duration))
            }
            Err(e) => {
                warn!(logical_id, path = %path.display(), "Duration probe failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Resolver for RecordingsResolver {
    async fn resolve(&self, logical_id: &str) -> Result<RecordingRef> {
        let receiver_path = extract_receiver_path(logical_id);
        let (rule, path) = self.mapper.map(receiver_path)?;

        if self.require_existing {
            Self::confine(&rule.local_root, &path).await?;
        }

        let duration = self.duration_for(logical_id, &path).await;
        debug!(logical_id, rule = %rule.id, path = %path.display(), "Resolved recording");

        Ok(RecordingRef {
            logical_id: logical_id.to_string(),
            path,
            duration,
            rule_id: rule.id.clone(),
        })
    }
}
