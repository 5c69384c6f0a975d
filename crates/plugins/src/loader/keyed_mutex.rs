// Keyed async mutex
//
// Contract: operations sharing a key run strictly one at a time in
// submission order (tokio's Mutex is fair/FIFO); distinct keys never
// block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, creating its entry lazily. Entries
    /// nobody else holds are pruned on the way in.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        entry.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_operations_are_serialized_in_order() {
        let mutex = Arc::new(KeyedMutex::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let mutex = Arc::clone(&mutex);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                // Stagger submissions so the queue order is deterministic.
                tokio::time::sleep(Duration::from_millis(u64::from(i) * 10)).await;
                let _guard = mutex.lock("k").await;
                tokio::time::sleep(Duration::from_millis(30)).await;
                log.lock().expect("log mutex").push(i);
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        let order = log.lock().expect("log mutex").clone();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let mutex = Arc::new(KeyedMutex::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let mutex = Arc::clone(&mutex);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = mutex.lock(&format!("k{i}")).await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert!(peak.load(Ordering::SeqCst) > 1, "keys blocked each other");
    }
}
