//! Cache for block I/O.

#![feature(extract_if)]
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{boxed::Box, collections::linked_list::LinkedList, sync::Arc};
use dataview::{Pod, PodMethods as _};
use mutex_api::Mutex;

pub trait BlockDevice<const BLOCK_SIZE: usize> {
    type Error;

    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
}

/// A buffer cache for block I/O.
pub struct BlockIoCache<Device, BufferListMutex> {
    device: Device,

    /// Linked list of all buffers, through prev/next.
    ///
    /// Sorted by how recently the buffer was used.
    /// `buffers.front()` is most recent, `buffesr.back()` is least.
    buffers: BufferListMutex,
}

pub struct BufferList<BlockDataMutex>(LinkedList<Arc<Block<BlockDataMutex>>>);

/// A block buffer.
struct Block<BlockDataMutex> {
    /// Block index.
    index: usize,

    /// Block data.
    data: BlockDataMutex,
}

pub struct BlockHandle<'a, Device, BufferListMutex, BlockDataMutex>
where
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
{
    index: usize,
    cache: &'a BlockIoCache<Device, BufferListMutex>,
    block: Arc<Block<BlockDataMutex>>,
}

/// A reference to a block buffer.
pub struct BlockGuard<
    'a,
    'b,
    Device,
    BufferListMutex,
    BlockDataMutex,
    const BLOCK_SIZE: usize,
    const VALID: bool,
> where
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>> + 'b,
{
    /// Block index.
    index: usize,

    /// Reference to the block I/O cache
    cache: &'a BlockIoCache<Device, BufferListMutex>,

    /// Reference to the block itself.
    block: Arc<Block<BlockDataMutex>>,

    /// Block data.
    data: BlockDataMutex::Guard<'b>,
}

/// A block cache data.
pub struct BlockData<const BLOCK_SIZE: usize> {
    index: usize,
    valid: bool,
    data: Box<[u8; BLOCK_SIZE]>,
}

impl<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>
    BlockIoCache<Device, BufferListMutex>
where
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    pub fn new(device: Device) -> Self {
        Self {
            device,
            buffers: BufferListMutex::new(BufferList(LinkedList::new())),
        }
    }

    /// Initializes the block I/O cache with `num_block` buffers.
    ///
    /// # Panics
    ///
    /// Panics if:
    ///
    /// * `num_block` is 0.
    /// * The cache is already initialized.
    pub fn init(&self, num_block: usize) {
        assert!(num_block > 0);
        let mut buffers = self.buffers.lock();
        assert!(buffers.0.is_empty());

        // Create linked list of buffers
        for _ in 0..num_block {
            buffers.0.push_back(Arc::new(Block {
                index: usize::MAX,
                data: BlockDataMutex::new(BlockData {
                    index: usize::MAX,
                    valid: false,
                    data: Box::new([0; BLOCK_SIZE]),
                }),
            }))
        }
    }

    /// Returns a editable reference to the buffer with the given device number and block number.
    ///
    /// If the buffer is already in the cache, returns a reference to it.
    /// Otherwise, recycles the least recently used (LRU) unused buffer and returns a reference to it.
    /// If all buffers are in use, returns `None`.
    ///
    /// # Panic
    ///
    /// Panics if:
    ///
    /// * the buffer is not initialized
    pub fn try_get(
        &self,
        index: usize,
    ) -> Option<BlockHandle<'_, Device, BufferListMutex, BlockDataMutex>> {
        let mut buffers = self.buffers.lock();
        assert!(!buffers.0.is_empty());

        // Find the buffer with dev & block_no
        if let Some(buf) = buffers.0.iter().find(|b| b.index == index) {
            // NOTE: `buf.valid` may be `false` here.
            return Some(BlockHandle {
                index,
                cache: self,
                block: Arc::clone(buf),
            });
        }

        // Not cached.
        // Recycle the least recentrly used (LRU) unused buffer.
        if let Some(buf) = buffers.0.iter_mut().rev().find_map(|buf| {
            let buf_content = Arc::get_mut(buf)?;
            buf_content.index = index;
            Some(buf)
        }) {
            return Some(BlockHandle {
                index,
                cache: self,
                block: Arc::clone(buf),
            });
        }

        None
    }

    /// Returns a editable reference to the buffer with the given device number and block number.
    ///
    /// If the buffer is already in the cache, returns a reference to it.
    /// Otherwise, recycles the least recently used (LRU) unused buffer and returns a reference to it.
    /// If all buffers are in use, panics.
    ///
    /// # Panic
    ///
    /// Panics if:
    ///
    /// * the buffer is not initialized
    /// * all buffers are in use
    pub fn get(&self, index: usize) -> BlockHandle<'_, Device, BufferListMutex, BlockDataMutex> {
        match self.try_get(index) {
            Some(buf) => buf,
            None => panic!("block buffer exhausted"),
        }
    }
}

impl<Device, BufferListMutex, BlockDataMutex> Drop
    for BlockHandle<'_, Device, BufferListMutex, BlockDataMutex>
where
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
{
    fn drop(&mut self) {
        let mut buffers = self.cache.buffers.lock();
        let buf = buffers.0.extract_if(|buf| buf.index == self.index).next();
        if let Some(buf) = buf {
            buffers.0.push_front(buf);
        }
    }
}

impl<'a, Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>
    BlockHandle<'a, Device, BufferListMutex, BlockDataMutex>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>> + 'a,
{
    pub fn index(&self) -> usize {
        self.index
    }

    pub unsafe fn pin(&self) {
        unsafe {
            Arc::increment_strong_count(&self.block);
        }
    }

    pub unsafe fn unpin(&self) {
        unsafe {
            Arc::decrement_strong_count(&self.block);
        }
    }

    pub fn lock<'b>(
        &'b mut self,
    ) -> BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, false> {
        let mut data = self.block.data.lock();

        if data.index != self.index {
            // data recycle occurred
            data.index = self.index;
            data.valid = false;
        }

        BlockGuard {
            index: self.index,
            cache: self.cache,
            block: Arc::clone(&self.block),
            data,
        }
    }
}

impl<'a, 'b, Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize, const VALID: bool>
    BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, VALID>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>> + 'a,
{
    /// Returns the block number.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Reads the block from disk if cached data is not valid.
    pub fn read(
        mut self,
    ) -> Result<
        BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, true>,
        (Self, Device::Error),
    > {
        if !self.data.valid {
            if let Err(e) = self.cache.device.read(self.index, &mut self.data.data) {
                return Err((self, e));
            }
            self.data.valid = true;
        }

        Ok(BlockGuard {
            index: self.index,
            cache: self.cache,
            block: Arc::clone(&self.block),
            data: self.data,
        })
    }

    /// Sets the whole block data.
    pub fn set_data(
        mut self,
        data: &[u8],
    ) -> BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, true> {
        self.data.valid = true;
        self.data.data.copy_from_slice(data);
        BlockGuard {
            index: self.index,
            cache: self.cache,
            block: Arc::clone(&self.block),
            data: self.data,
        }
    }

    /// Fills the whole block data with zero.
    pub fn zeroed(
        mut self,
    ) -> BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, true> {
        self.data.valid = true;
        self.data.data.fill(0);
        BlockGuard {
            index: self.index,
            cache: self.cache,
            block: Arc::clone(&self.block),
            data: self.data,
        }
    }

    pub unsafe fn pin(&self) {
        unsafe {
            Arc::increment_strong_count(&self.block);
        }
    }

    pub unsafe fn unpin(&self) {
        unsafe {
            Arc::decrement_strong_count(&self.block);
        }
    }
}

impl<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>
    BlockGuard<'_, '_, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, true>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    /// Returns a reference to the block data bytes.
    pub fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.data.data
    }

    /// Returns a mutable reference to the block data bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data.data
    }

    /// Returns a reference to the block data as POD.
    pub fn data<T>(&self) -> &T
    where
        T: Pod,
    {
        self.bytes().as_data_view().get(0)
    }

    /// Returns a mutable reference to the block data as POD.
    pub fn data_mut<T>(&mut self) -> &mut T
    where
        T: Pod,
    {
        self.bytes_mut().as_data_view_mut().get_mut(0)
    }

    /// Writes the block to disk.
    ///
    /// # Panic
    ///
    /// Panics if cached data is not valid.
    pub fn write(&mut self) -> Result<(), Device::Error> {
        assert!(self.data.valid);
        self.cache.device.write(self.index, self.bytes())
    }
}
