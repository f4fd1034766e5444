//! Binding to native heaps and the owned sample block allocated from them.
//!
//! [`HeapBinding`] is the minimal allocator surface the native strategies
//! need: a default heap handle plus an allocate/free pair. Blocks are handed
//! out as [`NativeBlock`], which frees itself through the binding that
//! produced it when dropped.

use std::alloc::{GlobalAlloc, Layout, System, alloc, alloc_zeroed, dealloc};
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

use log::trace;

use crate::volume_loader::{Result, VolumeLoaderError};

/// Alignment requested for blocks backed by a Rust allocator
pub const ALIGNMENT: usize = 16;

/// Opaque handle to a heap owned by a [`HeapBinding`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(usize);

impl HeapHandle {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> usize {
        self.0
    }
}

/// Allocate/free contract over a native heap.
///
/// A failed allocation is signalled by `None`; turning that into an error is
/// left to the caller.
pub trait HeapBinding {
    /// Heap used when the caller does not pick one
    fn process_default_heap(&self) -> HeapHandle;

    /// Allocate `byte_size` bytes on `heap`, zero-filled if `zero_init`.
    ///
    /// Returned blocks are aligned to at least two bytes.
    fn allocate(&self, heap: HeapHandle, byte_size: usize, zero_init: bool)
    -> Option<NonNull<u8>>;

    /// Return a block to `heap`.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`HeapBinding::allocate`] on this
    /// binding with the same `heap` and `byte_size`, and must not be used
    /// after this call.
    unsafe fn free(&self, heap: HeapHandle, block: NonNull<u8>, byte_size: usize);
}

fn block_layout(byte_size: usize) -> Option<Layout> {
    if byte_size == 0 {
        return None;
    }
    Layout::from_size_align(byte_size, ALIGNMENT).ok()
}

/// The process-wide global allocator
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalHeap;

impl HeapBinding for GlobalHeap {
    fn process_default_heap(&self) -> HeapHandle {
        HeapHandle(0)
    }

    fn allocate(
        &self,
        heap: HeapHandle,
        byte_size: usize,
        zero_init: bool,
    ) -> Option<NonNull<u8>> {
        if heap != self.process_default_heap() {
            return None;
        }
        let layout = block_layout(byte_size)?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe {
            if zero_init {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        NonNull::new(ptr)
    }

    unsafe fn free(&self, _heap: HeapHandle, block: NonNull<u8>, byte_size: usize) {
        if let Some(layout) = block_layout(byte_size) {
            // SAFETY: the caller guarantees the block came from `allocate` with this size.
            unsafe { dealloc(block.as_ptr(), layout) }
        }
    }
}

/// The operating system allocator behind [`std::alloc::System`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHeap;

impl HeapBinding for SystemHeap {
    fn process_default_heap(&self) -> HeapHandle {
        HeapHandle(0)
    }

    fn allocate(
        &self,
        heap: HeapHandle,
        byte_size: usize,
        zero_init: bool,
    ) -> Option<NonNull<u8>> {
        if heap != self.process_default_heap() {
            return None;
        }
        let layout = block_layout(byte_size)?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe {
            if zero_init {
                System.alloc_zeroed(layout)
            } else {
                System.alloc(layout)
            }
        };
        NonNull::new(ptr)
    }

    unsafe fn free(&self, _heap: HeapHandle, block: NonNull<u8>, byte_size: usize) {
        if let Some(layout) = block_layout(byte_size) {
            // SAFETY: the caller guarantees the block came from `allocate` with this size.
            unsafe { System.dealloc(block.as_ptr(), layout) }
        }
    }
}

#[cfg(windows)]
mod win32 {
    use std::ffi::c_void;
    use std::ptr::NonNull;

    use super::{HeapBinding, HeapHandle};

    const HEAP_ZERO_MEMORY: u32 = 0x0000_0008;

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn GetProcessHeap() -> *mut c_void;
        fn HeapAlloc(heap: *mut c_void, flags: u32, bytes: usize) -> *mut c_void;
        fn HeapFree(heap: *mut c_void, flags: u32, mem: *mut c_void) -> i32;
    }

    /// kernel32 process heap
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ProcessHeap;

    impl HeapBinding for ProcessHeap {
        fn process_default_heap(&self) -> HeapHandle {
            // SAFETY: GetProcessHeap has no preconditions.
            HeapHandle::from_raw(unsafe { GetProcessHeap() } as usize)
        }

        fn allocate(
            &self,
            heap: HeapHandle,
            byte_size: usize,
            zero_init: bool,
        ) -> Option<NonNull<u8>> {
            if heap.as_raw() == 0 || byte_size == 0 {
                return None;
            }
            let flags = if zero_init { HEAP_ZERO_MEMORY } else { 0 };
            // SAFETY: the handle was obtained from GetProcessHeap.
            let ptr = unsafe { HeapAlloc(heap.as_raw() as *mut c_void, flags, byte_size) };
            NonNull::new(ptr.cast::<u8>())
        }

        unsafe fn free(&self, heap: HeapHandle, block: NonNull<u8>, _byte_size: usize) {
            // SAFETY: the caller guarantees the block was allocated on `heap`.
            unsafe {
                HeapFree(heap.as_raw() as *mut c_void, 0, block.as_ptr().cast::<c_void>());
            }
        }
    }
}

#[cfg(windows)]
pub use win32::ProcessHeap;

/// Heap binding used by the OS-heap strategy on this target
#[cfg(windows)]
pub type OsHeap = win32::ProcessHeap;

/// Heap binding used by the OS-heap strategy on this target
#[cfg(not(windows))]
pub type OsHeap = SystemHeap;

/// Single-owner block of samples allocated through a [`HeapBinding`].
///
/// `len` counts the samples written so far and only that prefix is ever
/// exposed. The whole block goes back to the binding on drop.
#[derive(Debug)]
pub struct NativeBlock<B: HeapBinding> {
    ptr: NonNull<u16>,
    len: usize,
    cap: usize,
    heap: HeapHandle,
    binding: B,
}

impl<B: HeapBinding> NativeBlock<B> {
    /// Allocate room for `capacity` samples on the binding's default heap
    pub fn allocate(binding: B, capacity: usize, zero_init: bool) -> Result<Self> {
        let heap = binding.process_default_heap();
        Self::allocate_on(binding, heap, capacity, zero_init)
    }

    pub fn allocate_on(
        binding: B,
        heap: HeapHandle,
        capacity: usize,
        zero_init: bool,
    ) -> Result<Self> {
        let bytes = capacity
            .checked_mul(mem::size_of::<u16>())
            .ok_or(VolumeLoaderError::AllocationFailure { bytes: usize::MAX })?;
        let block = binding
            .allocate(heap, bytes, zero_init)
            .ok_or(VolumeLoaderError::AllocationFailure { bytes })?;

        if (block.as_ptr() as usize) % mem::align_of::<u16>() != 0 {
            // SAFETY: the block was just allocated with this heap and size.
            unsafe { binding.free(heap, block, bytes) };
            return Err(VolumeLoaderError::AllocationFailure { bytes });
        }
        trace!("allocated {bytes} bytes on heap {:#x}", heap.as_raw());

        Ok(Self {
            ptr: block.cast::<u16>(),
            len: 0,
            cap: capacity,
            heap,
            binding,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn is_full(&self) -> bool {
        self.len == self.cap
    }

    /// Append samples after the written prefix.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeLoaderError::AllocationFailure`] if the samples do not
    /// fit in the remaining capacity; the block is left unchanged.
    pub fn extend_from_slice(&mut self, samples: &[u16]) -> Result<()> {
        if samples.len() > self.cap - self.len {
            return Err(VolumeLoaderError::AllocationFailure {
                bytes: (self.len + samples.len()) * mem::size_of::<u16>(),
            });
        }
        // SAFETY: the destination range lies inside the allocation and does
        // not overlap `samples`, which is borrowed immutably.
        unsafe {
            ptr::copy_nonoverlapping(
                samples.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                samples.len(),
            );
        }
        self.len += samples.len();
        Ok(())
    }

    pub fn as_slice(&self) -> &[u16] {
        // SAFETY: the first `len` samples have been written.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u16] {
        // SAFETY: the first `len` samples have been written.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Free the block now instead of at the end of the scope
    pub fn release(self) {
        drop(self);
    }
}

impl<B: HeapBinding> AsRef<[u16]> for NativeBlock<B> {
    fn as_ref(&self) -> &[u16] {
        self.as_slice()
    }
}

impl<B: HeapBinding> Drop for NativeBlock<B> {
    fn drop(&mut self) {
        trace!("freeing {} samples on heap {:#x}", self.cap, self.heap.as_raw());
        // SAFETY: the block came from `allocate_on` with this heap and size.
        unsafe {
            self.binding.free(
                self.heap,
                self.ptr.cast::<u8>(),
                self.cap * mem::size_of::<u16>(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_zero_init_allocation_is_zeroed() {
        let binding = OsHeap::default();
        let heap = binding.process_default_heap();
        let block = binding.allocate(heap, 4096, true).unwrap();
        // SAFETY: the block holds 4096 zero-initialised bytes.
        let bytes = unsafe { slice::from_raw_parts(block.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
        // SAFETY: allocated above with the same heap and size.
        unsafe { binding.free(heap, block, 4096) };
    }

    #[test]
    fn test_zero_size_allocation_fails() {
        let binding = GlobalHeap;
        assert!(binding.allocate(binding.process_default_heap(), 0, false).is_none());
    }

    #[test]
    fn test_unknown_heap_is_allocation_failure() {
        let result = NativeBlock::allocate_on(SystemHeap, HeapHandle::from_raw(42), 8, true);
        assert!(matches!(
            result,
            Err(VolumeLoaderError::AllocationFailure { bytes: 16 })
        ));
    }

    #[test]
    fn test_extend_respects_capacity() {
        let mut block = NativeBlock::allocate(GlobalHeap, 4, false).unwrap();
        block.extend_from_slice(&[1, 2, 3]).unwrap();
        assert!(block.extend_from_slice(&[4, 5]).is_err());
        block.extend_from_slice(&[4]).unwrap();
        assert!(block.is_full());
        assert_eq!(block.as_slice(), &[1, 2, 3, 4]);
    }

    #[derive(Clone)]
    struct CountingHeap {
        frees: Rc<Cell<usize>>,
    }

    impl HeapBinding for CountingHeap {
        fn process_default_heap(&self) -> HeapHandle {
            GlobalHeap.process_default_heap()
        }

        fn allocate(
            &self,
            heap: HeapHandle,
            byte_size: usize,
            zero_init: bool,
        ) -> Option<NonNull<u8>> {
            GlobalHeap.allocate(heap, byte_size, zero_init)
        }

        unsafe fn free(&self, heap: HeapHandle, block: NonNull<u8>, byte_size: usize) {
            self.frees.set(self.frees.get() + 1);
            unsafe { GlobalHeap.free(heap, block, byte_size) }
        }
    }

    #[test]
    fn test_block_is_freed_once_on_drop() {
        let frees = Rc::new(Cell::new(0));
        let binding = CountingHeap {
            frees: frees.clone(),
        };
        let mut block = NativeBlock::allocate(binding.clone(), 8, true).unwrap();
        block.extend_from_slice(&[7; 8]).unwrap();
        assert_eq!(frees.get(), 0);
        block.release();
        assert_eq!(frees.get(), 1);

        // a partially written block is freed as well
        let mut block = NativeBlock::allocate(binding, 8, false).unwrap();
        block.extend_from_slice(&[1, 2]).unwrap();
        drop(block);
        assert_eq!(frees.get(), 2);
    }
}
