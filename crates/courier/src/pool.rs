//! Fixed capacity pool of job handlers
//!
//! Leasing blocks while every handler is busy. Dropping a [`Lease`] returns
//! the handler and wakes exactly one waiting lessee. This is the only
//! backpressure a pipeline applies to its transport.

use crate::error::{JobError, Result};
use crate::job::JobHandler;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct HandlerPool {
    inner: Arc<Inner>,
}

struct Inner {
    idle: Mutex<Vec<Arc<dyn JobHandler>>>,
    available: Semaphore,
    capacity: usize,
}

impl HandlerPool {
    pub fn new(handlers: Vec<Arc<dyn JobHandler>>) -> Self {
        let capacity = handlers.len();
        Self {
            inner: Arc::new(Inner {
                idle: Mutex::new(handlers),
                available: Semaphore::new(capacity),
                capacity,
            }),
        }
    }

    /// `size` slots sharing one handler instance
    pub fn uniform<H: JobHandler + 'static>(handler: H, size: usize) -> Self {
        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        Self::new(vec![handler; size])
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Handlers not currently leased
    pub fn available(&self) -> usize {
        self.inner.available.available_permits()
    }

    pub async fn lease(&self) -> Result<Lease> {
        let permit = self
            .inner
            .available
            .acquire()
            .await
            .map_err(|_| JobError::BackendError("Handler pool closed".to_string()))?;
        permit.forget();

        let handler = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match handler {
            Some(handler) => Ok(Lease {
                pool: self.clone(),
                handler: Some(handler),
            }),
            None => {
                self.inner.available.add_permits(1);
                Err(JobError::BackendError(
                    "Handler pool is out of sync with its permits".to_string(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for HandlerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive use of one handler, returned to the pool on drop
pub struct Lease {
    pool: HandlerPool,
    handler: Option<Arc<dyn JobHandler>>,
}

impl Deref for Lease {
    type Target = dyn JobHandler;

    fn deref(&self) -> &Self::Target {
        match &self.handler {
            Some(handler) => handler.as_ref(),
            None => unreachable!("lease handler is only taken on drop"),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            self.pool
                .inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handler);
            self.pool.inner.available.add_permits(1);
        }
    }
}
