//! Pooled session handles and bookkeeping

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::RemoteFs;

/// A session owned by the pool. Cloning shares the same session.
pub struct PooledSession<S> {
    id: Uuid,
    session: Arc<S>,
}

impl<S> PooledSession<S> {
    pub(crate) fn new(session: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: Arc::new(session),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<S> Clone for PooledSession<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            session: self.session.clone(),
        }
    }
}

impl<S> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S> fmt::Debug for PooledSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession").field("id", &self.id).finish()
    }
}

impl<S: RemoteFs> PooledSession<S> {
    /// Close transport, then protocol. Both run even if the first fails;
    /// returns the collected error messages.
    pub(crate) async fn close(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = self.session.close_transport().await {
            warn!("Session {}: failed to close transport: {}", self.id, e);
            errors.push(format!("session {}: transport: {}", self.id, e));
        }
        if let Err(e) = self.session.close_protocol().await {
            warn!("Session {}: failed to close protocol: {}", self.id, e);
            errors.push(format!("session {}: protocol: {}", self.id, e));
        }

        debug!("Session {} closed", self.id);
        errors
    }

    pub(crate) fn handles_alive(&self) -> bool {
        self.session.transport_alive() && self.session.protocol_alive()
    }
}

pub(crate) struct PoolEntry<S> {
    pub session: PooledSession<S>,
    pub in_use: bool,
    pub last_used_at: Instant,
}

impl<S> PoolEntry<S> {
    pub fn claimed(session: PooledSession<S>) -> Self {
        Self {
            session,
            in_use: true,
            last_used_at: Instant::now(),
        }
    }

    pub fn idle_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        !self.in_use && now.saturating_duration_since(self.last_used_at) > idle_timeout
    }
}
