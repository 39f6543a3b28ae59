use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Callbacks never run under these locks, so a poisoned lock only means an
// internal panic and the guarded data is still consistent.

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}

/// Installs a `tracing` subscriber printing to stderr, filtered by `RUST_LOG`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_payloads() {
        let static_str = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        let owned = std::panic::catch_unwind(|| panic!("owned {}", 7)).unwrap_err();
        let other = std::panic::catch_unwind(|| std::panic::panic_any(42_u8)).unwrap_err();

        assert_eq!(panic_message(&*static_str), "static");
        assert_eq!(panic_message(&*owned), "owned 7");
        assert_eq!(panic_message(&*other), "unknown panic payload");
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let data = std::sync::Arc::new(RwLock::new(vec![1]));
        let clone = data.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.write().unwrap();
            panic!("poison");
        })
        .join();

        assert!(data.is_poisoned());
        write(&data).push(2);
        assert_eq!(*read(&data), vec![1, 2]);
    }
}
