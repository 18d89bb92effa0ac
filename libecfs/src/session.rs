//! Lazily established, shared backend session.
//!
//! A [`Session`] owns the one authenticated backend handle of the process.
//! The first caller logs in; callers arriving while that login is in flight
//! wait for it and reuse its result instead of logging in again.  Once
//! established the handle is an [`Arc`] clone away, so backend calls on it
//! run concurrently.  A handle that the backend rejects as expired is dropped
//! with [`Session::invalidate`] and the next caller logs in afresh.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, Connector};

pub struct Session<C: Connector> {
    connector: C,
    current: Mutex<Option<Arc<C::Backend>>>,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            current: Mutex::new(None),
        }
    }

    /// Return the established backend handle, logging in if there is none.
    pub async fn backend(&self) -> Result<Arc<C::Backend>, BackendError> {
        // The lock is held across the login so concurrent first users queue
        // behind a single attempt.
        let mut current = self.current.lock().await;
        if let Some(backend) = current.as_ref() {
            return Ok(Arc::clone(backend));
        }

        debug!("establishing backend session");
        let backend = self.connector.connect().await.inspect_err(|e| {
            warn!(error = %e, "backend login failed");
        })?;
        info!("backend session established");
        *current = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Drop `stale` if it is still the current handle.
    ///
    /// A session re-established after `stale` was handed out is kept.
    pub async fn invalidate(&self, stale: &Arc<C::Backend>) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|b| Arc::ptr_eq(b, stale)) {
            info!("backend session invalidated");
            *current = None;
        }
    }

    /// Whether a handle is currently cached.
    pub async fn is_established(&self) -> bool {
        self.current.lock().await.is_some()
    }
}
