//! Process-wide per-device command locks.
//!
//! Concurrent install-type commands against the same device interleave badly
//! on some vendors, so the install path serialises on an advisory per-device
//! mutex. The registry is keyed by device serial, populated lazily, and never
//! torn down; one lock per ever-seen device id is an acceptable leak since
//! device sets are small and long-lived.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

static LOCKS: OnceLock<StdMutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();

/// Acquires the advisory lock for `device_id`, waiting if another task holds
/// it. The lock is released when the returned guard drops.
pub(crate) async fn lock_device(device_id: &str) -> OwnedMutexGuard<()> {
    let lock = {
        let registry = LOCKS.get_or_init(|| StdMutex::new(HashMap::new()));
        let mut map = registry.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(device_id.to_owned()).or_default())
    };
    lock.lock_owned().await
}

#[cfg(test)]
mod tests {
    use super::lock_device;

    #[tokio::test]
    async fn same_device_id_serialises() {
        let guard = lock_device("serial-1").await;
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            lock_device("serial-1"),
        )
        .await;
        assert!(second.is_err(), "second acquisition should block");
        drop(guard);
        let third = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            lock_device("serial-1"),
        )
        .await;
        assert!(third.is_ok(), "lock should be free after guard drop");
    }

    #[tokio::test]
    async fn different_device_ids_do_not_contend() {
        let _guard = lock_device("serial-a").await;
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            lock_device("serial-b"),
        )
        .await;
        assert!(other.is_ok(), "distinct devices must not share a lock");
    }
}
