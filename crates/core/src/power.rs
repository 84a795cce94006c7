//! Process-wide power lock

/// Exclusive platform power resource, acquired and released by name
pub trait PowerLock: Send + Sync {
    /// Acquire the lock named `name`; returns false if the platform refused
    fn acquire(&self, name: &str) -> bool;

    /// Release the lock named `name`
    fn release(&self, name: &str) -> bool;
}
