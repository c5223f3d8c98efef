use core::fmt;

use block_io::{BlockDevice, BufferList};
use mutex_api::{CondVar, Mutex};
use once_init::OnceInit;

use crate::manager::{Log, LogData, Tx};

/// A [`Log`] that lives in a `static` and is initialized exactly once.
///
/// xv6-style kernels keep the filesystem log as a single global instance,
/// built during boot after the superblock has been read off disk and before
/// any process can touch the filesystem. `GlobalLog::new` is `const`, so it
/// can sit behind a plain `static`; [`GlobalLog::init`] does the actual
/// construction once `log_start`/`log_size` are known.
pub struct GlobalLog<Device, BufLM, BlockDM, Lock, Cond, const BLOCK_SIZE: usize, const LOG_SIZE: usize, const MAX_OP_BLOCKS: usize>
where
    Device: BlockDevice<BLOCK_SIZE>,
    Device::Error: fmt::Debug,
    BufLM: Mutex<Data = BufferList<BlockDM>>,
    BlockDM: Mutex<Data = block_io::BlockData<BLOCK_SIZE>>,
    Lock: Mutex<Data = LogData<LOG_SIZE>>,
    Cond: CondVar<Lock>,
{
    inner: OnceInit<Log<Device, BufLM, BlockDM, Lock, Cond, BLOCK_SIZE, LOG_SIZE, MAX_OP_BLOCKS>>,
}

impl<Device, BufLM, BlockDM, Lock, Cond, const BLOCK_SIZE: usize, const LOG_SIZE: usize, const MAX_OP_BLOCKS: usize>
    GlobalLog<Device, BufLM, BlockDM, Lock, Cond, BLOCK_SIZE, LOG_SIZE, MAX_OP_BLOCKS>
where
    Device: BlockDevice<BLOCK_SIZE>,
    Device::Error: fmt::Debug,
    BufLM: Mutex<Data = BufferList<BlockDM>>,
    BlockDM: Mutex<Data = block_io::BlockData<BLOCK_SIZE>>,
    Lock: Mutex<Data = LogData<LOG_SIZE>>,
    Cond: CondVar<Lock>,
{
    /// Creates an uninitialized global log, suitable for a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self { inner: OnceInit::new() }
    }
}

impl<Device, BufLM, BlockDM, Lock, Cond, const BLOCK_SIZE: usize, const LOG_SIZE: usize, const MAX_OP_BLOCKS: usize> Default
    for GlobalLog<Device, BufLM, BlockDM, Lock, Cond, BLOCK_SIZE, LOG_SIZE, MAX_OP_BLOCKS>
where
    Device: BlockDevice<BLOCK_SIZE>,
    Device::Error: fmt::Debug,
    BufLM: Mutex<Data = BufferList<BlockDM>>,
    BlockDM: Mutex<Data = block_io::BlockData<BLOCK_SIZE>>,
    Lock: Mutex<Data = LogData<LOG_SIZE>>,
    Cond: CondVar<Lock>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Device, BufLM, BlockDM, Lock, Cond, const BLOCK_SIZE: usize, const LOG_SIZE: usize, const MAX_OP_BLOCKS: usize>
    GlobalLog<Device, BufLM, BlockDM, Lock, Cond, BLOCK_SIZE, LOG_SIZE, MAX_OP_BLOCKS>
where
    Device: BlockDevice<BLOCK_SIZE>,
    Device::Error: fmt::Debug,
    BufLM: Mutex<Data = BufferList<BlockDM>>,
    BlockDM: Mutex<Data = block_io::BlockData<BLOCK_SIZE>>,
    Lock: Mutex<Data = LogData<LOG_SIZE>>,
    Cond: CondVar<Lock> + Default,
{
    /// Builds the log and recovers from any prior crash.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn init(&self, device: Device, log_start: u32, log_size: u32) {
        self.inner.init(Log::new(device, log_start, log_size));
    }

    /// # Panics
    ///
    /// Panics if [`GlobalLog::init`] has not run yet.
    pub fn begin_op(&self) {
        self.inner.get().begin_op();
    }

    /// # Panics
    ///
    /// Panics if [`GlobalLog::init`] has not run yet.
    pub fn end_op(&self) {
        self.inner.get().end_op();
    }

    /// # Panics
    ///
    /// Panics if [`GlobalLog::init`] has not run yet.
    pub fn begin_tx(&self) -> Tx<'_, Device, BufLM, BlockDM, Lock, Cond, BLOCK_SIZE, LOG_SIZE, MAX_OP_BLOCKS> {
        self.inner.get().begin_tx()
    }

    /// # Panics
    ///
    /// Panics if [`GlobalLog::init`] has not run yet.
    pub fn do_op<T>(&self, f: impl FnOnce() -> T) -> T {
        self.inner.get().do_op(f)
    }
}
