use core::time::Duration;

/// Services the embedding kernel provides to the hub manager.
pub trait Kernel: Send + Sync {
    /// Monotonic time since boot; drives delayed work.
    fn uptime(&self) -> Duration;
}
