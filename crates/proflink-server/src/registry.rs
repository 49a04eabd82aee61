use crate::artifacts::{self, Staged};
use crate::config::RelayConfig;
use crate::error::PoolError;
use crate::proxy::ProfileRoute;
use crate::{port, probe, viewer};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use proflink_store::DynArtifactStore;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// One live viewer bound to a route key. The staging directory and the
/// process are owned exclusively; both are released through `teardown`.
pub struct Session {
    pub key: String,
    pub port: u16,
    /// Token the viewer announced during discovery; None means the viewer
    /// never became ready and dispatches to it are refused.
    pub session_id: Option<String>,
    pid: i32,
    created_at: Instant,
    staged: Mutex<Option<Staged>>,
    ttl_timer: AbortHandle,
}

impl Session {
    /// Release everything the session owns. Safe to call once; the registry
    /// guarantees it runs at most once per session by removing the map entry
    /// first.
    fn teardown(&self) {
        self.ttl_timer.abort();
        if self.pid > 0 {
            if let Err(err) = kill(Pid::from_raw(self.pid), Signal::SIGTERM) {
                tracing::debug!(pid = self.pid, %err, "viewer process already gone");
            }
        }
        let staged = self.staged.lock().unwrap().take();
        if let Some(staged) = staged {
            let path = staged.dir.path().to_path_buf();
            if let Err(err) = staged.dir.close() {
                tracing::warn!(path = %path.display(), %err, "failed to remove staging dir");
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("port", &self.port)
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .finish()
    }
}

/// What a creation factory hands back for registration.
pub(crate) struct SessionParts {
    pub staged: Staged,
    pub port: u16,
    pub child: Child,
    pub session_id: Option<String>,
}

enum Slot {
    /// Creation in flight. Waiters clone the receiver and wake when the
    /// creator drops its sender, whatever the outcome.
    Creating { rx: watch::Receiver<()>, nonce: u64 },
    Ready(Arc<Session>),
}

/// Snapshot row for the management API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub port: u16,
    pub ready: bool,
    pub age_secs: u64,
}

/// The one piece of shared mutable state: route key to live session.
///
/// Creation is single-flighted per key, so concurrent first requests launch
/// exactly one viewer. Teardown has a single code path regardless of what
/// triggered it (ttl expiry, process exit, shutdown), and the map entry is
/// removed before any resource is released, so lookups never observe a
/// session mid-teardown.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RelayConfig,
    store: DynArtifactStore,
    client: Client,
    sessions: Mutex<HashMap<String, Slot>>,
    next_nonce: AtomicU64,
}

impl SessionRegistry {
    pub fn new(config: RelayConfig, store: DynArtifactStore, client: Client) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                store,
                client,
                sessions: Mutex::new(HashMap::new()),
                next_nonce: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn http_client(&self) -> &Client {
        &self.inner.client
    }

    /// Return the live session for a route, creating it if needed.
    pub async fn get_or_create(&self, route: &ProfileRoute) -> Result<Arc<Session>, PoolError> {
        self.get_or_create_with(&route.key, || self.create_session(route))
            .await
    }

    /// Single-flight wrapper around an arbitrary creation factory. Only the
    /// first caller for a vacant key runs its factory; the rest wait and
    /// share the result. A failed or abandoned creation vacates the key, and
    /// each waiter then retries with its own factory.
    pub(crate) async fn get_or_create_with<F, Fut>(
        &self,
        key: &str,
        factory: F,
    ) -> Result<Arc<Session>, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SessionParts, PoolError>>,
    {
        let (tx, nonce) = loop {
            let mut rx = {
                let mut map = self.inner.sessions.lock().unwrap();
                match map.get(key) {
                    Some(Slot::Ready(session)) => return Ok(session.clone()),
                    Some(Slot::Creating { rx, .. }) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(());
                        let nonce = self.inner.next_nonce.fetch_add(1, Ordering::Relaxed);
                        map.insert(key.to_string(), Slot::Creating { rx, nonce });
                        break (tx, nonce);
                    }
                }
            };
            // Someone else is creating; wake on completion and re-check.
            let _ = rx.changed().await;
        };

        // The guard vacates the slot if creation fails or this task is
        // dropped mid-flight; dropping `tx` afterwards wakes the waiters.
        let mut guard = CreationGuard {
            registry: self,
            key,
            nonce,
            armed: true,
        };
        let parts = factory().await?;
        let session = self.register(key, parts);
        guard.armed = false;
        drop(tx);
        Ok(session)
    }

    /// The real factory: stage artifacts, pick a port, launch, discover.
    /// A discovery timeout still registers the session (without a token) so
    /// repeated requests do not pile up fresh viewer processes; the ttl
    /// timer disposes of it.
    async fn create_session(&self, route: &ProfileRoute) -> Result<SessionParts, PoolError> {
        tracing::info!(key = %route.key, "creating viewer session");
        let staged = artifacts::materialize(
            self.inner.store.as_ref(),
            &route.query,
            &self.inner.config.work_root,
        )
        .await?;
        let port = port::allocate().await?;
        let child = viewer::launch(
            &self.inner.config.viewer_bin,
            &staged.target,
            port,
            staged.dir.path(),
        )?;
        let session_id = match probe::discover_session(
            &self.inner.client,
            port,
            self.inner.config.probe_timeout,
            self.inner.config.probe_interval,
        )
        .await
        {
            Ok(token) => {
                tracing::info!(key = %route.key, port, token = %token, "viewer ready");
                Some(token)
            }
            Err(err) => {
                tracing::warn!(key = %route.key, port, %err, "viewer never became ready");
                None
            }
        };
        Ok(SessionParts {
            staged,
            port,
            child,
            session_id,
        })
    }

    /// Wire up the ttl timer and exit watcher, then publish the session.
    fn register(&self, key: &str, parts: SessionParts) -> Arc<Session> {
        let SessionParts {
            staged,
            port,
            mut child,
            session_id,
        } = parts;
        let pid = child.id().map(|pid| pid as i32).unwrap_or(0);

        let ttl = self.inner.config.session_ttl;
        let ttl_task = tokio::spawn({
            let registry = self.clone();
            let key = key.to_string();
            async move {
                tokio::time::sleep(ttl).await;
                registry.evict(&key, "ttl expired");
            }
        });

        let session = Arc::new(Session {
            key: key.to_string(),
            port,
            session_id,
            pid,
            created_at: Instant::now(),
            staged: Mutex::new(Some(staged)),
            ttl_timer: ttl_task.abort_handle(),
        });
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(key.to_string(), Slot::Ready(session.clone()));

        // The watcher owns the child for its whole life; wait() also reaps
        // it, so no zombie outlives the session.
        tokio::spawn({
            let registry = self.clone();
            let key = key.to_string();
            async move {
                match child.wait().await {
                    Ok(status) => tracing::info!(key = %key, %status, "viewer exited"),
                    Err(err) => tracing::warn!(key = %key, %err, "viewer wait failed"),
                }
                registry.evict(&key, "process exit");
            }
        });
        session
    }

    /// Remove and tear down one session. Returns false when the key holds no
    /// ready session, which makes concurrent triggers (ttl timer, process
    /// exit, shutdown) collapse into one teardown.
    pub fn evict(&self, key: &str, reason: &str) -> bool {
        let session = {
            let mut map = self.inner.sessions.lock().unwrap();
            match map.get(key) {
                Some(Slot::Ready(session)) => {
                    let session = session.clone();
                    map.remove(key);
                    session
                }
                _ => return false,
            }
        };
        tracing::info!(key, reason, "evicting session");
        session.teardown();
        true
    }

    /// Tear down every live session. In-flight creations are left to their
    /// own guards.
    pub fn shutdown(&self) {
        let keys: Vec<String> = {
            let map = self.inner.sessions.lock().unwrap();
            map.keys().cloned().collect()
        };
        for key in keys {
            self.evict(&key, "shutdown");
        }
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let map = self.inner.sessions.lock().unwrap();
        let mut sessions: Vec<SessionInfo> = map
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(session) => Some(SessionInfo {
                    key: session.key.clone(),
                    port: session.port,
                    ready: session.session_id.is_some(),
                    age_secs: session.created_at.elapsed().as_secs(),
                }),
                Slot::Creating { .. } => None,
            })
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }
}

struct CreationGuard<'a> {
    registry: &'a SessionRegistry,
    key: &'a str,
    nonce: u64,
    armed: bool,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut map = self.registry.inner.sessions.lock().unwrap();
        if matches!(map.get(self.key), Some(Slot::Creating { nonce, .. }) if *nonce == self.nonce) {
            map.remove(self.key);
        }
    }
}
