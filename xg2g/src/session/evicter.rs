//! Periodic reclamation of finished sessions.
//!
//! Every cycle removes terminal sessions that have been idle (no update and no
//! client read) for longer than the retention window, deleting their output
//! directory first. A directory that cannot be deleted keeps its session in the
//! store so the next cycle retries. When free space under the sessions root
//! drops below `min_free_bytes`, the least recently active terminal sessions go
//! first regardless of age. Optionally, directories under the sessions root
//! that no session owns are removed once they are older than the window.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::Session;
use super::store::SessionStore;
use crate::metrics::MetricsCollector;
use crate::utils::fs;

/// Evicter timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvicterConfig {
    pub interval: Duration,
    pub retention: Duration,
    pub sweep_orphans: bool,
    /// Free bytes to keep on the sessions volume. `0` disables the pressure pass.
    #[serde(default)]
    pub min_free_bytes: u64,
}

impl Default for EvicterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(15 * 60),
            sweep_orphans: true,
            min_free_bytes: 0,
        }
    }
}

/// Outcome of one eviction cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub evicted: usize,
    pub failed: usize,
    pub orphans_removed: usize,
    /// Sessions evicted early by the low-space pass; included in `evicted`.
    pub pressure_evicted: usize,
}

/// Free bytes on the volume holding a path.
pub type FreeSpaceFn = Arc<dyn Fn(&Path) -> Option<u64> + Send + Sync>;

pub struct CacheEvicter {
    store: Arc<SessionStore>,
    config: EvicterConfig,
    metrics: Option<Arc<MetricsCollector>>,
    free_space: FreeSpaceFn,
}

impl CacheEvicter {
    pub fn new(store: Arc<SessionStore>, config: EvicterConfig) -> Self {
        Self {
            store,
            config,
            metrics: None,
            free_space: Arc::new(|path: &Path| {
                fs::disk_space(path).map(|(available, _)| available)
            }),
        }
    }

    pub fn with_free_space(mut self, free_space: FreeSpaceFn) -> Self {
        self.free_space = free_space;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run cycles every `interval` until `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.interval.as_secs(),
                retention_secs = self.config.retention.as_secs(),
                "Session evicter started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session evicter shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.evict_once().await;
                    }
                }
            }
        })
    }

    pub async fn evict_once(&self) -> EvictionReport {
        self.evict_at(Utc::now()).await
    }

    /// One cycle, treating `now` as the current time.
    pub async fn evict_at(&self, now: DateTime<Utc>) -> EvictionReport {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut report = EvictionReport::default();

        let expired: Vec<_> = self
            .store
            .list()
            .into_iter()
            .filter(|s| s.is_terminal() && s.last_activity_at() < cutoff)
            .collect();

        for session in expired {
            if self.evict(&session, &mut report).await {
                debug!(session_id = %session.id, state = %session.state, "Session evicted");
            }
        }

        if self.config.min_free_bytes > 0 {
            self.relieve_pressure(&mut report).await;
        }

        if self.config.sweep_orphans {
            report.orphans_removed = self.sweep_orphans(cutoff).await;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_eviction(&report);
        }
        if report.evicted > 0 || report.failed > 0 || report.orphans_removed > 0 {
            info!(
                evicted = report.evicted,
                pressure_evicted = report.pressure_evicted,
                failed = report.failed,
                orphans = report.orphans_removed,
                "Eviction cycle finished"
            );
        }
        report
    }

    /// Delete the output directory, then drop the session. Returns whether
    /// the session left the store.
    async fn evict(&self, session: &Session, report: &mut EvictionReport) -> bool {
        match fs::remove_dir_all_if_exists(&session.output_dir).await {
            Ok(_) => {
                let removed = self.store.remove_if_terminal(&session.id).is_some();
                if removed {
                    report.evicted += 1;
                }
                removed
            }
            Err(e) => {
                report.failed += 1;
                warn!(session_id = %session.id, "Eviction failed, retrying next cycle: {}", e);
                false
            }
        }
    }

    async fn free_bytes(&self) -> Option<u64> {
        let root = self.store.sessions_root().to_path_buf();
        let free_space = self.free_space.clone();
        tokio::task::spawn_blocking(move || free_space(&root))
            .await
            .ok()
            .flatten()
    }

    /// Evict terminal sessions, least recently active first, until the
    /// volume has `min_free_bytes` free again. Active sessions are never
    /// touched.
    async fn relieve_pressure(&self, report: &mut EvictionReport) {
        let min_free = self.config.min_free_bytes;
        let Some(mut free) = self.free_bytes().await else {
            debug!("Free space unknown, skipping pressure eviction");
            return;
        };
        if free >= min_free {
            return;
        }

        let mut candidates: Vec<Session> = self
            .store
            .list()
            .into_iter()
            .filter(Session::is_terminal)
            .collect();
        candidates.sort_by_key(Session::last_activity_at);
        warn!(
            free_bytes = free,
            min_free_bytes = min_free,
            candidates = candidates.len(),
            "Low disk space on sessions volume"
        );

        for session in candidates {
            if free >= min_free {
                break;
            }
            if self.evict(&session, report).await {
                report.pressure_evicted += 1;
                info!(session_id = %session.id, "Session evicted for disk space");
            }
            free = self.free_bytes().await.unwrap_or(free);
        }

        if free < min_free {
            warn!(free_bytes = free, "Disk space still low after evicting all finished sessions");
        }
    }

    async fn sweep_orphans(&self, cutoff: DateTime<Utc>) -> usize {
        let root = self.store.sessions_root();
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(path = %root.display(), "Failed to list sessions root: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %root.display(), "Failed to read sessions root: {}", e);
                    break;
                }
            };

            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.store.contains(&name) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let modified: DateTime<Utc> = match metadata.modified() {
                Ok(modified) => modified.into(),
                Err(_) => continue,
            };
            if modified >= cutoff {
                continue;
            }

            match fs::remove_dir_all_if_exists(&entry.path()).await {
                Ok(true) => {
                    removed += 1;
                    debug!(path = %entry.path().display(), "Removed orphaned session directory");
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to remove orphaned session directory: {}", e),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::intent::{Intent, OutputProfile, TargetRef};
    use crate::session::model::SessionState;

    fn intent() -> Intent {
        Intent::new(
            TargetRef::Live {
                service_ref: "1:0:1:445D:453:1:C00000:0:0:0:".into(),
            },
            OutputProfile::Passthrough,
        )
    }

    fn evicter(store: Arc<SessionStore>, sweep_orphans: bool) -> CacheEvicter {
        CacheEvicter::new(
            store,
            EvicterConfig {
                interval: Duration::from_secs(60),
                retention: Duration::from_secs(600),
                sweep_orphans,
                min_free_bytes: 0,
            },
        )
    }

    async fn session_with_dir(store: &SessionStore, state: SessionState) -> String {
        let session = store.create(intent());
        tokio::fs::create_dir_all(&session.output_dir).await.unwrap();
        tokio::fs::write(session.output_dir.join("index.m3u8"), b"#EXTM3U")
            .await
            .unwrap();
        if state != SessionState::Starting {
            store
                .update_state(&session.id, SessionState::Running, None)
                .unwrap();
        }
        if state.is_terminal() {
            store.update_state(&session.id, state, None).unwrap();
        }
        session.id
    }

    #[tokio::test]
    async fn test_evicts_only_expired_terminal_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let running = session_with_dir(&store, SessionState::Running).await;
        let starting = session_with_dir(&store, SessionState::Starting).await;
        let completed = session_with_dir(&store, SessionState::Completed).await;
        let stalled = session_with_dir(&store, SessionState::Stalled).await;
        let evicter = evicter(store.clone(), false);

        let report = evicter.evict_once().await;
        assert_eq!(report.evicted, 0, "nothing is past retention yet");

        let later = Utc::now() + chrono::Duration::hours(2);
        let report = evicter.evict_at(later).await;
        assert_eq!(report.evicted, 2);
        assert!(store.get(&completed).is_none());
        assert!(store.get(&stalled).is_none());
        assert!(!dir.path().join(&completed).exists());

        assert!(store.get(&running).is_some());
        assert!(store.get(&starting).is_some());
        assert!(dir.path().join(&running).exists());
    }

    #[tokio::test]
    async fn test_client_reads_keep_finished_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let id = session_with_dir(&store, SessionState::Completed).await;
        let finished_at = store.get(&id).unwrap().updated_at;

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.touch(&id);
        let read_at = store.get(&id).unwrap().last_access_at.unwrap();
        assert!(read_at > finished_at);

        // Past retention counted from completion, within it counted from the read.
        let evicter = evicter(store.clone(), false);
        let now = read_at + chrono::Duration::seconds(600) - chrono::Duration::milliseconds(1);
        let report = evicter.evict_at(now).await;
        assert_eq!(report.evicted, 0);
        assert!(store.get(&id).is_some());
        assert!(dir.path().join(&id).exists());

        let report = evicter
            .evict_at(read_at + chrono::Duration::seconds(601))
            .await;
        assert_eq!(report.evicted, 1);
        assert!(store.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_low_disk_space_evicts_least_recently_active_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let running = session_with_dir(&store, SessionState::Running).await;
        let oldest = session_with_dir(&store, SessionState::Completed).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let middle = session_with_dir(&store, SessionState::Failed).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newest = session_with_dir(&store, SessionState::Completed).await;

        // Space recovers once only two sessions remain.
        let watched = store.clone();
        let free_space: FreeSpaceFn =
            Arc::new(move |_: &Path| Some(if watched.len() > 2 { 10 } else { 1_000 }));
        let evicter = CacheEvicter::new(
            store.clone(),
            EvicterConfig {
                interval: Duration::from_secs(60),
                retention: Duration::from_secs(600),
                sweep_orphans: false,
                min_free_bytes: 100,
            },
        )
        .with_free_space(free_space);

        let report = evicter.evict_once().await;
        assert_eq!(report.evicted, 2);
        assert_eq!(report.pressure_evicted, 2);
        assert!(store.get(&oldest).is_none());
        assert!(store.get(&middle).is_none());
        assert!(store.get(&newest).is_some());
        assert!(store.get(&running).is_some());
        assert!(dir.path().join(&running).exists());
    }

    #[tokio::test]
    async fn test_low_disk_space_never_touches_active_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let running = session_with_dir(&store, SessionState::Running).await;
        let starting = session_with_dir(&store, SessionState::Starting).await;

        let evicter = CacheEvicter::new(
            store.clone(),
            EvicterConfig {
                min_free_bytes: 100,
                sweep_orphans: false,
                ..EvicterConfig::default()
            },
        )
        .with_free_space(Arc::new(|_: &Path| Some(0)));

        let report = evicter.evict_once().await;
        assert_eq!(report.evicted, 0);
        assert_eq!(store.len(), 2);
        assert!(store.get(&running).is_some());
        assert!(store.get(&starting).is_some());
    }

    #[tokio::test]
    async fn test_missing_directory_still_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let id = store.create(intent()).id;
        store.update_state(&id, SessionState::Cancelled, None).unwrap();

        let report = evicter(store.clone(), false)
            .evict_at(Utc::now() + chrono::Duration::hours(1))
            .await;
        assert_eq!(report.evicted, 1);
        assert!(store.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_delete_is_retried_next_cycle() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let id = session_with_dir(&store, SessionState::Failed).await;
        let out = dir.path().join(&id);

        // A read-only directory cannot have its entries removed.
        std::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o555)).unwrap();
        let evicter = evicter(store.clone(), false);
        let later = Utc::now() + chrono::Duration::hours(1);

        let first = evicter.evict_at(later).await;
        let blocked = first.failed == 1;
        if blocked {
            assert_eq!(first.evicted, 0);
            assert!(store.get(&id).is_some());
        }

        std::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o755)).unwrap();
        let second = evicter.evict_at(later).await;
        if blocked {
            assert_eq!(second.evicted, 1);
        }
        assert!(store.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_orphan_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let live = session_with_dir(&store, SessionState::Running).await;
        tokio::fs::create_dir_all(dir.path().join("orphan-1"))
            .await
            .unwrap();

        let evicter = evicter(store.clone(), true);
        let report = evicter.evict_once().await;
        assert_eq!(report.orphans_removed, 0, "fresh orphans are kept");

        let report = evicter
            .evict_at(Utc::now() + chrono::Duration::hours(1))
            .await;
        assert_eq!(report.orphans_removed, 1);
        assert!(!dir.path().join("orphan-1").exists());
        assert!(dir.path().join(&live).exists());
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let cancel = CancellationToken::new();
        let handle = Arc::new(evicter(store, true)).start(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
