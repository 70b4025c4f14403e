//! Lease-based distributed lock
//!
//! Multiple server processes contend for a single lease key in the shared
//! backing store; the one whose identity is stored in the key is the
//! active leader. Ownership is proven only by value equality, so a holder
//! that has been superseded can never extend or delete the new holder's
//! lease. Correctness rests entirely on the store's atomic conditional
//! operations, never on connection affinity or in-process locking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cofre_common::{CofreError, Result};

use crate::config::LockConfig;

/// Atomic primitives a backing store must expose for leasing.
///
/// Every operation here must be a single indivisible step against the
/// store; a non-atomic check-then-act would let a second holder's claim
/// interleave with a renewal and silently double-grant the lease.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claim the key with the holder's identity and an expiry, only if it
    /// does not already exist. Returns whether the claim succeeded.
    async fn try_acquire(&self, key: &str, identity: &str, ttl: Duration) -> Result<bool>;

    /// Extend the expiry to the full TTL, only if the stored value still
    /// equals `identity`. Returns `false` when the key is absent or held
    /// by someone else.
    async fn renew_if_owner(&self, key: &str, identity: &str, ttl: Duration) -> Result<bool>;

    /// Delete the key, only if the stored value still equals `identity`.
    /// Returns `false` when the key is absent or held by someone else.
    async fn release_if_owner(&self, key: &str, identity: &str) -> Result<bool>;

    /// Current holder identity, or `None` when the key is absent.
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Smallest expiry unit the store can express. Lease durations are
    /// rounded up to a multiple of this before use.
    fn ttl_granularity(&self) -> Duration {
        Duration::from_millis(1)
    }
}

/// Lifecycle of one lock instance. `Released` and `Lost` are terminal; a
/// fresh lock must be requested to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Released,
    Lost,
}

/// A capability object for one lease key.
///
/// A process may hold several locks for distinct keys, but only one
/// process globally holds the lease for a given key at a time.
pub struct LeaseLock {
    store: Arc<dyn LeaseStore>,
    key: String,
    identity: String,
    config: LockConfig,
    state: Arc<Mutex<LockState>>,
    stop_renewal: Mutex<Option<oneshot::Sender<()>>>,
}

impl LeaseLock {
    pub(crate) fn new(
        store: Arc<dyn LeaseStore>,
        key: String,
        identity: String,
        config: LockConfig,
    ) -> Self {
        let config = config.aligned(store.ttl_granularity());
        Self {
            store,
            key,
            identity,
            config,
            state: Arc::new(Mutex::new(LockState::Idle)),
            stop_renewal: Mutex::new(None),
        }
    }

    /// The fully namespaced lease key this lock contends for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state of this instance's state machine.
    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    /// Acquire the lease, blocking until it can be claimed or `cancel`
    /// fires.
    ///
    /// Returns `Ok(Some(receiver))` once held: the receiver yields `()`
    /// if the lease is ever lost, and closes without a value after a
    /// voluntary [`unlock`](Self::unlock). Cancellation during the wait
    /// returns `Ok(None)` with no side effects; the acquisition was
    /// abandoned, not failed. A transport error aborts the call.
    pub async fn lock(&self, cancel: CancellationToken) -> Result<Option<mpsc::Receiver<()>>> {
        {
            let mut state = self.state.lock();
            match *state {
                LockState::Idle => *state = LockState::Acquiring,
                other => {
                    return Err(CofreError::IllegalArgument(format!(
                        "lock '{}' already used (state {:?}); request a fresh lock",
                        self.key, other
                    )));
                }
            }
        }

        loop {
            if cancel.is_cancelled() {
                *self.state.lock() = LockState::Idle;
                return Ok(None);
            }

            match self
                .store
                .try_acquire(&self.key, &self.identity, self.config.lease_ttl)
                .await
            {
                Ok(true) => break,
                Ok(false) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            *self.state.lock() = LockState::Idle;
                            return Ok(None);
                        }
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                    }
                }
                Err(err) => {
                    *self.state.lock() = LockState::Idle;
                    return Err(err);
                }
            }
        }

        debug!(key = %self.key, identity = %self.identity, "lease claimed");
        *self.state.lock() = LockState::Held;
        Ok(Some(self.spawn_renewal()))
    }

    /// Release the lease.
    ///
    /// Fails with [`CofreError::NotLockOwner`] when the stored value no
    /// longer matches this holder's identity; the other holder's lease is
    /// left untouched. Racing against a concurrent loss notification is
    /// safe: both paths settle on a terminal state and the loss signal
    /// fires at most once.
    pub async fn unlock(&self) -> Result<()> {
        if let Some(stop) = self.stop_renewal.lock().take() {
            let _ = stop.send(());
        }

        let released = self
            .store
            .release_if_owner(&self.key, &self.identity)
            .await?;

        let mut state = self.state.lock();
        if released {
            *state = LockState::Released;
            Ok(())
        } else {
            *state = LockState::Lost;
            Err(CofreError::NotLockOwner(self.key.clone()))
        }
    }

    /// Read-only inspection of the lease key: whether it is held, and by
    /// which identity. Never mutates state.
    pub async fn value(&self) -> Result<(bool, String)> {
        match self.store.read(&self.key).await? {
            Some(holder) => Ok((true, holder)),
            None => Ok((false, String::new())),
        }
    }

    fn spawn_renewal(&self) -> mpsc::Receiver<()> {
        let (loss_tx, loss_rx) = mpsc::channel(1);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.stop_renewal.lock() = Some(stop_tx);

        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        let key = self.key.clone();
        let identity = self.identity.clone();
        let ttl = self.config.lease_ttl;
        let interval = self.config.renew_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        debug!(key = %key, "lease renewal stopped after release");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match store.renew_if_owner(&key, &identity, ttl).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(key = %key, "lease no longer held, signalling loss");
                                signal_loss(&state, &loss_tx);
                                return;
                            }
                            Err(err) => {
                                // An ambiguous renewal outcome means the
                                // lease may already be gone; treat it as
                                // lost rather than retrying.
                                warn!(key = %key, error = %err, "lease renewal failed, signalling loss");
                                signal_loss(&state, &loss_tx);
                                return;
                            }
                        }
                    }
                }
            }
        });

        loss_rx
    }
}

fn signal_loss(state: &Mutex<LockState>, loss_tx: &mpsc::Sender<()>) {
    {
        let mut state = state.lock();
        if *state == LockState::Held {
            *state = LockState::Lost;
        }
    }
    // Capacity-1 channel, sent once right before the task exits.
    let _ = loss_tx.try_send(());
}
