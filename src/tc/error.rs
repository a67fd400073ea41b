//! TC Engine error kinds (spec.md §7).

/// `MINIMUM_BANDWIDTH` is the floor always reserved for interactive traffic.
pub const MINIMUM_BANDWIDTH: u64 = 5000;
/// `INFINITE_BANDWIDTH` is the "unlimited" sentinel, 2^32 - 1.
pub const INFINITE_BANDWIDTH: u64 = u32::MAX as u64;

#[derive(thiserror::Error, Debug)]
pub enum TcError {
    #[error("no suitable network interface found")]
    NoInterface,

    #[error("ambiguous network interface, candidates: {0:?}")]
    AmbiguousInterface(Vec<String>),

    #[error("ifb0 unavailable; hint: modprobe ifb numifbs=1")]
    NoIfb,

    #[error("kernel mutation failed: {0}")]
    KernelMutation(String),

    #[error("kernel deletion failed (ignored): {0}")]
    KernelDeletion(String),

    #[error("cache sync failed: {0}")]
    CacheSync(String),

    #[error("cannot open stats file: {0}")]
    StatsFile(#[from] std::io::Error),
}
