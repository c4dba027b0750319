pub mod exclusive_lock;

pub use exclusive_lock::{ExclusiveLock, LockGuard, LockStats};
