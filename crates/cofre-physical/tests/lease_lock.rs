//! Lock coordination scenarios across concurrent holders.
//!
//! Everything here runs against the in-memory backend with short lease
//! durations; the same contract is exercised against a live server in
//! `redis_backend.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use cofre_common::CofreError;
use cofre_physical::{HaBackend, LockState, MemoryBackend};

fn short_conf() -> HashMap<String, String> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    [
        ("leader_ttl", "400"),
        ("leader_ttl_renew_interval", "100"),
        ("leader_lock_retry_interval", "50"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(&short_conf()).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_holder_among_concurrent_acquirers() {
    let backend = backend();
    let holders = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let backend = Arc::clone(&backend);
        let holders = Arc::clone(&holders);
        tasks.push(tokio::spawn(async move {
            let lock = backend
                .lock_with("leader", &format!("node-{}", i))
                .unwrap();
            let loss = lock.lock(CancellationToken::new()).await.unwrap();
            assert!(loss.is_some());

            let concurrent = holders.fetch_add(1, Ordering::SeqCst);
            assert_eq!(concurrent, 0, "a second holder observed the lease held");
            tokio::time::sleep(Duration::from_millis(20)).await;
            holders.fetch_sub(1, Ordering::SeqCst);

            lock.unlock().await.unwrap();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_blocked_acquirer_wins_within_one_retry_interval() {
    let backend = backend();

    let holder = backend.lock_with("leader", "node-1").unwrap();
    holder.lock(CancellationToken::new()).await.unwrap();

    let contender = backend.lock_with("leader", "node-2").unwrap();
    let waiting = tokio::spawn(async move {
        contender.lock(CancellationToken::new()).await.unwrap();
        Instant::now()
    });

    // Let the contender settle into its retry wait before releasing.
    tokio::time::sleep(Duration::from_millis(75)).await;
    holder.unlock().await.unwrap();
    let released_at = Instant::now();

    let acquired_at = tokio::time::timeout(Duration::from_millis(500), waiting)
        .await
        .expect("contender did not acquire after release")
        .unwrap();

    // One retry interval (50ms) plus scheduling slack.
    assert!(acquired_at.duration_since(released_at) < Duration::from_millis(200));
}

#[tokio::test]
async fn test_blocked_acquirer_is_cancellable() {
    let backend = backend();

    let holder = backend.lock_with("leader", "node-1").unwrap();
    holder.lock(CancellationToken::new()).await.unwrap();

    let contender = backend.lock_with("leader", "node-2").unwrap();
    let cancel = CancellationToken::new();
    let waiting = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let got = contender.lock(cancel).await.unwrap();
            assert!(got.is_none());
            assert_eq!(contender.state(), LockState::Idle);
        })
    };

    tokio::time::sleep(Duration::from_millis(75)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_millis(500), waiting)
        .await
        .expect("cancelled acquirer did not return")
        .unwrap();
}

#[tokio::test]
async fn test_forced_expiry_signals_loss_within_renew_interval() {
    let backend = backend();

    let lock = backend.lock_with("leader", "node-1").unwrap();
    let mut loss = lock
        .lock(CancellationToken::new())
        .await
        .unwrap()
        .expect("free lease must be claimed");

    // Simulate the store expiring the record while the holder is
    // partitioned away.
    assert!(backend.force_expire("leader"));
    let expired_at = Instant::now();

    let signal = tokio::time::timeout(Duration::from_millis(400), loss.recv())
        .await
        .expect("loss was not signalled after forced expiry");
    assert_eq!(signal, Some(()));

    // renew_interval (100ms) plus one round-trip's worth of slack.
    assert!(expired_at.elapsed() < Duration::from_millis(300));
    assert_eq!(lock.state(), LockState::Lost);
}

#[tokio::test]
async fn test_unlock_after_reassignment_is_not_owner() {
    let backend = backend();

    let first = backend.lock_with("leader", "node-1").unwrap();
    first.lock(CancellationToken::new()).await.unwrap();

    // The lease silently expires and another identity claims it.
    assert!(backend.force_expire("leader"));
    let second = backend.lock_with("leader", "node-2").unwrap();
    second.lock(CancellationToken::new()).await.unwrap();

    let err = first.unlock().await.unwrap_err();
    assert!(matches!(err, CofreError::NotLockOwner(_)));

    // The new holder's lease was not deleted.
    let (held, identity) = second.value().await.unwrap();
    assert!(held);
    assert_eq!(identity, "node-2");

    second.unlock().await.unwrap();
}

#[tokio::test]
async fn test_loss_channel_closes_after_voluntary_release() {
    let backend = backend();

    let lock = backend.lock_with("leader", "node-1").unwrap();
    let mut loss = lock
        .lock(CancellationToken::new())
        .await
        .unwrap()
        .expect("free lease must be claimed");

    lock.unlock().await.unwrap();

    // The renewal task exits without firing; the channel just closes.
    let signal = tokio::time::timeout(Duration::from_millis(400), loss.recv())
        .await
        .expect("renewal task did not stop after release");
    assert_eq!(signal, None);
}
