//! Per-chunk single-flight.
//!
//! The first reader of an uncached chunk installs a shared future keyed by
//! the chunk digest; readers arriving while it runs await the same future
//! and observe the same outcome, success or error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use lazysnap_oci::Digest;

use crate::error::Result;

type Flight = Shared<BoxFuture<'static, Result<Arc<[u8]>>>>;

#[derive(Default)]
pub struct FetchGroup {
    inflight: Mutex<HashMap<Digest, (u64, Flight)>>,
    next_id: AtomicU64,
    started: AtomicU64,
}

impl FetchGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `start()` for `key` unless a flight for it is already running, in
    /// which case join that one instead.
    pub async fn run<F>(&self, key: &Digest, start: F) -> Result<Arc<[u8]>>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Arc<[u8]>>>,
    {
        let (id, flight) = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            match inflight.get(key) {
                Some((id, flight)) => (*id, flight.clone()),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight = start().shared();
                    inflight.insert(key.clone(), (id, flight.clone()));
                    self.started.fetch_add(1, Ordering::Relaxed);
                    (id, flight)
                }
            }
        };

        let result = flight.await;

        // A later flight for the same key may already have replaced ours.
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(inflight.get(key), Some((current, _)) if *current == id) {
            inflight.remove(key);
        }
        result
    }

    /// Number of flights currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Number of flights started over the group's lifetime.
    pub fn flights_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use futures_util::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn bytes(b: &[u8]) -> Arc<[u8]> {
        Arc::from(b)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_flight() {
        let group = FetchGroup::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = Digest::sha256(b"chunk");

        let readers = (0..8).map(|_| {
            let calls = calls.clone();
            group.run(&key, move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(bytes(b"payload"))
                }
                .boxed()
            })
        });
        let results = join_all(readers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.flights_started(), 1);
        for r in results {
            assert_eq!(&*r.unwrap(), b"payload");
        }
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_are_shared_and_not_sticky() {
        let group = FetchGroup::new();
        let key = Digest::sha256(b"chunk");

        let failing = || {
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err::<Arc<[u8]>, _>(Error::Store("disk full".into()))
            }
            .boxed()
        };
        let (a, b) = tokio::join!(group.run(&key, failing), group.run(&key, failing));
        assert!(a.is_err() && b.is_err());
        assert_eq!(group.flights_started(), 1);

        // The failed flight is gone; the next caller starts afresh.
        let ok = group
            .run(&key, || async { Ok(bytes(b"ok")) }.boxed())
            .await
            .unwrap();
        assert_eq!(&*ok, b"ok");
        assert_eq!(group.flights_started(), 2);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let group = FetchGroup::new();
        let a = Digest::sha256(b"a");
        let b = Digest::sha256(b"b");
        let (ra, rb) = tokio::join!(
            group.run(&a, || async { Ok(bytes(b"a")) }.boxed()),
            group.run(&b, || async { Ok(bytes(b"b")) }.boxed()),
        );
        assert_eq!(&*ra.unwrap(), b"a");
        assert_eq!(&*rb.unwrap(), b"b");
        assert_eq!(group.flights_started(), 2);
    }
}
