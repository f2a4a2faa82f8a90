//! Session Pool
//!
//! Bounded set of authenticated sessions shared by concurrent callers.
//!
//! # Acquisition
//!
//! ```text
//! get_connection ──► acquisition retrier (PoolExhausted only)
//!                      │
//!                      ├─ lock: evict expired/dead free sessions, claim first free
//!                      ├─ unlocked: ping claimed session ─ fail ─► evict, rescan
//!                      │            (claim undone if the caller goes away)
//!                      ├─ lock: reserve creation slot (sessions + creating < max)
//!                      ├─ unlocked: creation retrier ─► auth_methods + connect
//!                      └─ lock: track new session as in use
//! ```
//!
//! The state lock is never held across an `.await`. Evicted sessions are
//! always closed outside of it.

mod entry;
mod sweeper;

pub use entry::PooledSession;

use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::entry::PoolEntry;
use crate::auth::AuthProvider;
use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, Error, Result};
use crate::retry::Retrier;
use crate::transport::{Connector, RemoteFs};

/// Pool snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub creating: usize,
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub closed: bool,
}

struct PoolState<S> {
    sessions: Vec<PoolEntry<S>>,
    creating: usize,
    closed: bool,
}

impl<S: RemoteFs> PoolState<S> {
    /// Remove free sessions that are idle-expired or have a dead handle.
    fn take_unhealthy(&mut self, now: Instant, idle_timeout: Duration) -> Vec<PooledSession<S>> {
        let mut evicted = Vec::new();
        self.sessions.retain(|entry| {
            if entry.in_use {
                return true;
            }
            if entry.idle_expired(now, idle_timeout) || !entry.session.handles_alive() {
                evicted.push(entry.session.clone());
                return false;
            }
            true
        });
        evicted
    }

    fn claim_free(&mut self, now: Instant) -> Option<PooledSession<S>> {
        let entry = self.sessions.iter_mut().find(|e| !e.in_use)?;
        entry.in_use = true;
        entry.last_used_at = now;
        Some(entry.session.clone())
    }

    fn remove(&mut self, id: uuid::Uuid) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|e| e.session.id() != id);
        self.sessions.len() != before
    }
}

pub(crate) struct PoolInner<C: Connector> {
    connector: C,
    auth: AuthProvider,
    state: Mutex<PoolState<C::Session>>,
    max_connections: usize,
    idle_timeout: Duration,
    creation: Retrier,
    acquisition: Retrier,
    sweeper_stop: CancellationToken,
}

/// Releases the reserved creation slot unless the new session got tracked.
struct CreationSlot<'a, S> {
    state: &'a Mutex<PoolState<S>>,
    armed: bool,
}

impl<S> Drop for CreationSlot<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock();
            state.creating = state.creating.saturating_sub(1);
        }
    }
}

/// Session claimed for a health check. Dropped while still armed, the
/// claim is undone by evicting the session and closing it in the background.
struct ClaimGuard<'a, C: Connector> {
    inner: &'a PoolInner<C>,
    session: PooledSession<C::Session>,
    armed: bool,
}

impl<C: Connector> ClaimGuard<'_, C> {
    fn keep(mut self) -> PooledSession<C::Session> {
        self.armed = false;
        self.session.clone()
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn evict(mut self) {
        self.inner.state.lock().remove(self.session.id());
        self.session.close().await;
        self.armed = false;
    }
}

impl<C: Connector> Drop for ClaimGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Claim on session {} abandoned, evicting it", self.session.id());
            self.inner.state.lock().remove(self.session.id());
            spawn_close(self.session.clone());
        }
    }
}

/// Sessions already removed from the pool state and waiting to be closed.
/// Whatever is still pending on drop is closed in the background.
struct PendingClose<S: RemoteFs + 'static> {
    sessions: Vec<PooledSession<S>>,
}

impl<S: RemoteFs + 'static> PendingClose<S> {
    fn new(sessions: Vec<PooledSession<S>>) -> Self {
        Self { sessions }
    }

    async fn close_all(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        while let Some(session) = self.sessions.last().cloned() {
            errors.extend(session.close().await);
            self.sessions.pop();
        }
        errors
    }
}

impl<S: RemoteFs + 'static> Drop for PendingClose<S> {
    fn drop(&mut self) {
        for session in self.sessions.drain(..) {
            spawn_close(session);
        }
    }
}

fn spawn_close<S: RemoteFs + 'static>(session: PooledSession<S>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                session.close().await;
            });
        }
        Err(_) => warn!("No runtime left to close session {}", session.id()),
    }
}

impl<C: Connector> PoolInner<C> {
    /// One acquisition attempt.
    async fn try_acquire(&self, ctx: CancellationToken) -> Result<PooledSession<C::Session>> {
        loop {
            let (evicted, claimed) = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(ConnectionError::PoolClosed.into());
                }
                let now = Instant::now();
                let evicted = state.take_unhealthy(now, self.idle_timeout);
                (evicted, state.claim_free(now))
            };

            // Claim first so a drop during eviction still hands it back
            let claim = claimed.map(|session| ClaimGuard {
                inner: self,
                session,
                armed: true,
            });

            for session in &evicted {
                debug!("Evicting session {} (idle or dead)", session.id());
            }
            PendingClose::new(evicted).close_all().await;

            let Some(claim) = claim else {
                break;
            };

            let session = claim.session.clone();
            let ping = tokio::select! {
                result = session.ping() => result,
                _ = ctx.cancelled() => {
                    debug!("Health check of session {} cancelled", session.id());
                    return Err(Error::Cancelled);
                }
            };

            match ping {
                Ok(()) => {
                    let tracked = {
                        let state = self.state.lock();
                        !state.closed
                            && state
                                .sessions
                                .iter()
                                .any(|e| e.in_use && e.session.id() == session.id())
                    };
                    if tracked {
                        debug!("Reusing session {}", session.id());
                        return Ok(claim.keep());
                    }
                    // close() took the entry and closes it
                    claim.disarm();
                    info!("Pool closed during health check of session {}", session.id());
                    return Err(ConnectionError::PoolClosed.into());
                }
                Err(e) => {
                    warn!("Session {} failed health check: {}", session.id(), e);
                    claim.evict().await;
                }
            }
        }

        let mut slot = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConnectionError::PoolClosed.into());
            }
            if state.sessions.len() + state.creating >= self.max_connections {
                return Err(ConnectionError::PoolExhausted {
                    max: self.max_connections,
                }
                .into());
            }
            state.creating += 1;
            CreationSlot {
                state: &self.state,
                armed: true,
            }
        };

        let session = tokio::select! {
            result = self.create_session(&ctx) => result?,
            _ = ctx.cancelled() => {
                debug!("Session creation cancelled");
                return Err(Error::Cancelled);
            }
        };
        let pooled = PooledSession::new(session);

        let closed = {
            let mut state = self.state.lock();
            state.creating = state.creating.saturating_sub(1);
            slot.armed = false;
            if !state.closed {
                state.sessions.push(PoolEntry::claimed(pooled.clone()));
            }
            state.closed
        };

        if closed {
            info!("Pool closed while creating session {}, discarding it", pooled.id());
            PendingClose::new(vec![pooled]).close_all().await;
            return Err(ConnectionError::PoolClosed.into());
        }

        info!("Created session {}", pooled.id());
        Ok(pooled)
    }

    async fn create_session(&self, ctx: &CancellationToken) -> Result<C::Session> {
        self.creation
            .execute_with_retry(
                ctx,
                |_| async move {
                    let credentials = self.auth.auth_methods().await?;
                    self.connector.connect(self.auth.username(), &credentials).await
                },
                |attempt, e: &Error| {
                    if e.is_fatal() {
                        return false;
                    }
                    debug!("Session creation attempt {} failed: {}", attempt, e);
                    true
                },
            )
            .await
    }

    fn release(&self, session: &PooledSession<C::Session>) -> Result<()> {
        let mut state = self.state.lock();
        match state
            .sessions
            .iter_mut()
            .find(|e| e.session.id() == session.id())
        {
            Some(entry) if entry.in_use => {
                entry.in_use = false;
                entry.last_used_at = Instant::now();
                debug!("Released session {}", session.id());
                Ok(())
            }
            _ => Err(ConnectionError::ConnectionNotFound.into()),
        }
    }

    async fn sweep_idle(&self) {
        let expired: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let now = Instant::now();
            let idle_timeout = self.idle_timeout;
            let mut expired = Vec::new();
            state.sessions.retain(|entry| {
                if entry.idle_expired(now, idle_timeout) {
                    expired.push(entry.session.clone());
                    false
                } else {
                    true
                }
            });
            expired
        };

        if !expired.is_empty() {
            info!("Sweeping {} idle session(s)", expired.len());
        }
        PendingClose::new(expired).close_all().await;
    }
}

impl<C: Connector> Drop for PoolInner<C> {
    fn drop(&mut self) {
        self.sweeper_stop.cancel();
    }
}

/// Bounded, concurrency-safe session pool. Cloning shares the pool.
pub struct SessionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for SessionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> SessionPool<C> {
    /// Build the pool and start its idle sweeper. Must be called within a
    /// tokio runtime.
    pub fn new(connector: C, auth: AuthProvider, config: &ConnectionConfig) -> Result<Self> {
        let config = config.clone().merged_with_defaults();
        let creation = Retrier::new(config.retry.clone())?;
        let acquisition = Retrier::new(config.acquire_retry.clone())?;
        let idle_timeout = config.idle_timeout();

        let inner = Arc::new(PoolInner {
            connector,
            auth,
            state: Mutex::new(PoolState {
                sessions: Vec::new(),
                creating: 0,
                closed: false,
            }),
            max_connections: config.max_connections,
            idle_timeout,
            creation,
            acquisition,
            sweeper_stop: CancellationToken::new(),
        });

        sweeper::spawn(
            Arc::downgrade(&inner),
            inner.sweeper_stop.clone(),
            sweeper::sweep_interval(idle_timeout),
        );

        info!(
            "Session pool ready (max_connections: {}, idle_timeout: {:?})",
            config.max_connections, idle_timeout
        );
        Ok(Self { inner })
    }

    /// Borrow a healthy session, creating one if there is room. Waits with
    /// backoff while the pool is full.
    pub async fn get_connection(&self, ctx: &CancellationToken) -> Result<PooledSession<C::Session>> {
        self.inner
            .acquisition
            .execute_with_retry(
                ctx,
                |ctx| async move { self.inner.try_acquire(ctx).await },
                |_, e: &Error| e.is_pool_exhausted(),
            )
            .await
    }

    /// Return a session obtained from [`get_connection`](Self::get_connection).
    pub fn release_connection(&self, session: &PooledSession<C::Session>) -> Result<()> {
        self.inner.release(session)
    }

    /// [`get_connection`](Self::get_connection) with automatic release on drop.
    pub async fn lease(&self, ctx: &CancellationToken) -> Result<SessionLease<C>> {
        let session = self.get_connection(ctx).await?;
        Ok(SessionLease {
            pool: self.clone(),
            session,
        })
    }

    /// Close every tracked session. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let sessions = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.sessions)
        };

        self.inner.sweeper_stop.cancel();
        info!("Closing session pool ({} session(s))", sessions.len());

        let errors = PendingClose::new(sessions.into_iter().map(|e| e.session).collect())
            .close_all()
            .await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConnectionError::Close(errors).into())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Whether both handles share one underlying pool.
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let in_use = state.sessions.iter().filter(|e| e.in_use).count();
        PoolStats {
            total: state.sessions.len(),
            in_use,
            idle: state.sessions.len() - in_use,
            creating: state.creating,
            max_connections: self.inner.max_connections,
            idle_timeout_ms: self.inner.idle_timeout.as_millis() as u64,
            closed: state.closed,
        }
    }
}

/// Session borrowed for the lifetime of this guard
pub struct SessionLease<C: Connector> {
    pool: SessionPool<C>,
    session: PooledSession<C::Session>,
}

impl<C: Connector> SessionLease<C> {
    pub fn id(&self) -> uuid::Uuid {
        self.session.id()
    }
}

impl<C: Connector> Deref for SessionLease<C> {
    type Target = C::Session;

    fn deref(&self) -> &C::Session {
        &self.session
    }
}

impl<C: Connector> Drop for SessionLease<C> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release_connection(&self.session) {
            // Expected after the pool was closed underneath the lease
            debug!("Lease for session {} not released: {}", self.session.id(), e);
        }
    }
}
