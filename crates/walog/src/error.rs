use core::fmt;

/// Fatal conditions raised by the log.
///
/// Every variant here is a programmer-bug or a storage failure: per the
/// component's error-handling contract, none of these are recovered locally.
/// They exist to give `panic!` a readable message, not to be propagated or
/// matched on by callers.
#[derive(Debug, thiserror::Error)]
pub enum LogError<E>
where
    E: fmt::Debug,
{
    /// [`crate::header::LogHeader`] does not fit in a single block of the
    /// configured `BLOCK_SIZE`.
    #[error("log header ({have} bytes) does not fit in one block ({block_size} bytes)")]
    HeaderTooLarge { have: usize, block_size: usize },

    /// The underlying [`block_io::BlockDevice`] failed a read or write.
    ///
    /// The log has no way to retry or route around a device failure, so this
    /// is surfaced as a panic at the call site rather than returned.
    #[error("block device I/O failed: {0:?}")]
    Device(E),
}
