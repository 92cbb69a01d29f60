//! Exclusivity gate
//!
//! One gate exists per adapter. Every multi-step radio operation (discovery
//! restart, connect sequences, GATT walks) runs while holding it, so at most
//! one such sequence is in flight per adapter. Waiters are served in FIFO
//! order.

use crate::domain::error::{BridgeError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Proof of holding the gate; released on drop
#[derive(Debug)]
pub struct GateToken {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct ExclusivityGate {
    semaphore: Arc<Semaphore>,
    name: Arc<str>,
}

impl ExclusivityGate {
    pub fn new(name: &str) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            name: Arc::from(name),
        }
    }

    /// Wait until the gate is free and take it.
    ///
    /// Fails with [`BridgeError::GateClosed`] once the owning adapter is gone.
    pub async fn acquire(&self) -> Result<GateToken> {
        trace!("Waiting for gate {}", self.name);
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::GateClosed)?;
        trace!("Acquired gate {}", self.name);
        Ok(GateToken { _permit: permit })
    }

    /// Take the gate only if nobody holds it
    pub fn try_acquire(&self) -> Option<GateToken> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GateToken { _permit: permit })
    }

    /// Run `operation` while holding the gate.
    ///
    /// The gate is released when the operation finishes, whether it succeeded
    /// or not.
    pub async fn exclusive<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _token = self.acquire().await?;
        operation.await
    }

    /// Refuse current waiters and all future acquisitions
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_gate_serializes_sequences_in_fifo_order() {
        let gate = ExclusivityGate::new("hci0");
        let active = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let gate = gate.clone();
            let active = active.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gate.exclusive(async {
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    order.lock().unwrap().push(i);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
            // Make sure each task is queued before the next one is spawned
            tokio::task::yield_now().await;
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_gate_released_on_failure() {
        let gate = ExclusivityGate::new("hci0");
        let result: Result<()> = gate
            .exclusive(async { Err(BridgeError::Protocol("boom".into())) })
            .await;
        assert!(result.is_err());
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_try_acquire_skips_when_held() {
        let gate = ExclusivityGate::new("kettle");
        let token = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(token);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_closed_gate_refuses_waiters() {
        let gate = ExclusivityGate::new("hci0");
        let token = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        gate.close();
        assert!(matches!(waiter.await.unwrap(), Err(BridgeError::GateClosed)));
        drop(token);
        assert!(gate.try_acquire().is_none());
        assert!(matches!(gate.acquire().await, Err(BridgeError::GateClosed)));
    }
}
