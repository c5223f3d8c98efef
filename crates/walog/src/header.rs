use dataview::Pod;

/// Contents of the header block.
///
/// Used both as the on-disk header block and as the in-memory mirror of the
/// blocks logged so far, before commit. `len == 0` means "no outstanding
/// transaction"; `len > 0` on disk means "these blocks are committed, install
/// them" (see [`crate::Log::new`], which recovers on construction).
#[repr(C)]
#[derive(Pod)]
pub(crate) struct LogHeader<const LOG_SIZE: usize> {
    pub(crate) len: u32,
    pub(crate) block_indices: [u32; LOG_SIZE],
}

impl<const LOG_SIZE: usize> LogHeader<LOG_SIZE> {
    pub(crate) const fn new() -> Self {
        Self {
            len: 0,
            block_indices: [0; LOG_SIZE],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len as usize
    }

    pub(crate) fn copy_from(&mut self, src: &Self) {
        self.len = src.len;
        let len = self.len();
        self.block_indices[..len].copy_from_slice(&src.block_indices[..len]);
    }

    pub(crate) fn block_indices(&self) -> &[u32] {
        &self.block_indices[..self.len()]
    }

    /// Appends `block_index` as a new logged entry.
    ///
    /// # Panics
    ///
    /// Panics if the header is already full (`len == LOG_SIZE`).
    pub(crate) fn push(&mut self, block_index: u32) {
        assert!(self.len() < LOG_SIZE, "walog: log header is full");
        self.block_indices[self.len()] = block_index;
        self.len += 1;
    }
}
