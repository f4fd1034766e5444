//! Strategies for acquiring the memory a volume is decoded into.
//!
//! Every copying strategy goes through [`read_chunks`], so they all see the
//! same samples in the same order and only differ in where the samples end
//! up. [`MemoryMapped`] skips the copy and decodes from the mapping.

use std::fs::File;
use std::path::Path;

use log::debug;
use memmap2::Mmap;
use ndarray::Array3;

use crate::{
    descriptor::VolumeDescriptor,
    heap::{GlobalHeap, HeapBinding, NativeBlock, OsHeap},
    source::FileSampleSource,
    volume::{FlatVolume, MappedVolume, NativeVolume, SlicedVolume, Volume, VolumeSamples},
    volume_loader::{Result, VolumeLoaderError},
};

/// Size of the stack scratch buffer used by [`TransientStack`]
pub const STACK_SCRATCH_BYTES: usize = 16 * 1024;

const STACK_SCRATCH_SAMPLES: usize = STACK_SCRATCH_BYTES / 2;

pub trait VolumeLoadStrategy {
    type Volume: VolumeSamples;

    fn name(&self) -> &'static str;

    /// Load the volume stored at `path`.
    ///
    /// On failure nothing that was allocated for the volume survives.
    fn load(&self, path: &Path, descriptor: &VolumeDescriptor) -> Result<Self::Volume>;
}

fn open_source(path: &Path, descriptor: &VolumeDescriptor) -> Result<FileSampleSource> {
    descriptor.ensure_u16_samples()?;
    FileSampleSource::open_with(path, descriptor)
}

/// Decode `count` samples through `scratch`, handing each filled chunk to `sink`
pub(crate) fn read_chunks(
    source: &mut FileSampleSource,
    count: usize,
    scratch: &mut [u16],
    mut sink: impl FnMut(&[u16]) -> Result<()>,
) -> Result<()> {
    if scratch.is_empty() && count > 0 {
        return Err(VolumeLoaderError::InvalidDescriptor(
            "empty scratch buffer".to_string(),
        ));
    }
    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(scratch.len());
        let chunk = &mut scratch[..n];
        source.read_samples_into(chunk)?;
        sink(chunk)?;
        remaining -= chunk.len();
    }
    Ok(())
}

/// Decode the volume one z-plane at a time
fn read_planes(
    source: &mut FileSampleSource,
    descriptor: &VolumeDescriptor,
    sink: impl FnMut(&[u16]) -> Result<()>,
) -> Result<()> {
    let mut plane = vec![0u16; descriptor.slice_len()];
    read_chunks(source, descriptor.sample_count(), &mut plane, sink)
}

/// Samples in an ndarray, freed when the [`Volume`] is dropped
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagedArray;

impl VolumeLoadStrategy for ManagedArray {
    type Volume = Volume;

    fn name(&self) -> &'static str {
        "managed-array"
    }

    fn load(&self, path: &Path, descriptor: &VolumeDescriptor) -> Result<Volume> {
        let mut source = open_source(path, descriptor)?;
        let mut samples = Vec::with_capacity(descriptor.sample_count());
        read_planes(&mut source, descriptor, |plane| {
            samples.extend_from_slice(plane);
            Ok(())
        })?;
        let data = Array3::from_shape_vec(descriptor.dim(), samples)
            .map_err(|err| VolumeLoaderError::InvalidDescriptor(err.to_string()))?;
        Ok(Volume::new(data))
    }
}

/// Samples in a single block obtained through a [`HeapBinding`].
///
/// The block is owned by the returned volume and goes back to the binding
/// when the volume is dropped or released.
#[derive(Debug, Clone, Copy)]
pub struct HeapBacked<B> {
    binding: B,
    zero_init: bool,
    name: &'static str,
}

/// Block from the global allocator, left uninitialised until read
pub type NativeUnmanaged = HeapBacked<GlobalHeap>;

/// Zero-initialised block from the operating system heap
pub type OsHeapBacked = HeapBacked<OsHeap>;

impl<B: HeapBinding> HeapBacked<B> {
    pub fn with_binding(binding: B, zero_init: bool) -> Self {
        Self {
            binding,
            zero_init,
            name: "heap-backed",
        }
    }

    pub fn binding(&self) -> &B {
        &self.binding
    }

    /// Whether blocks are zero-filled by the heap before samples are read
    pub fn zero_init(&self) -> bool {
        self.zero_init
    }
}

impl HeapBacked<GlobalHeap> {
    pub fn native() -> Self {
        Self {
            name: "native-unmanaged",
            ..Self::with_binding(GlobalHeap, false)
        }
    }
}

impl Default for HeapBacked<GlobalHeap> {
    fn default() -> Self {
        Self::native()
    }
}

impl HeapBacked<OsHeap> {
    pub fn os_heap() -> Self {
        Self {
            name: "os-heap",
            ..Self::with_binding(OsHeap::default(), true)
        }
    }
}

impl Default for HeapBacked<OsHeap> {
    fn default() -> Self {
        Self::os_heap()
    }
}

impl<B: HeapBinding + Clone> VolumeLoadStrategy for HeapBacked<B> {
    type Volume = NativeVolume<B>;

    fn name(&self) -> &'static str {
        self.name
    }

    fn load(&self, path: &Path, descriptor: &VolumeDescriptor) -> Result<NativeVolume<B>> {
        let mut source = open_source(path, descriptor)?;
        let mut block = NativeBlock::allocate(
            self.binding.clone(),
            descriptor.sample_count(),
            self.zero_init,
        )?;
        debug!("{}: block of {} samples", self.name, block.capacity());
        read_planes(&mut source, descriptor, |plane| block.extend_from_slice(plane))?;
        FlatVolume::new(*descriptor, block)
    }
}

/// Decodes through a fixed scratch array on the stack.
///
/// The finished samples are returned in a heap-owned boxed slice, so the
/// volume outlives the call that loaded it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientStack;

impl VolumeLoadStrategy for TransientStack {
    type Volume = FlatVolume<Box<[u16]>>;

    fn name(&self) -> &'static str {
        "transient-stack"
    }

    fn load(&self, path: &Path, descriptor: &VolumeDescriptor) -> Result<Self::Volume> {
        let mut source = open_source(path, descriptor)?;
        let mut samples = vec![0u16; descriptor.sample_count()].into_boxed_slice();
        let mut scratch = [0u16; STACK_SCRATCH_SAMPLES];
        let mut filled = 0;

        read_chunks(&mut source, samples.len(), &mut scratch, |chunk| {
            samples[filled..filled + chunk.len()].copy_from_slice(chunk);
            filled += chunk.len();
            Ok(())
        })?;
        FlatVolume::new(*descriptor, samples)
    }
}

/// Read-only mapping of the whole file, no copy
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryMapped;

impl VolumeLoadStrategy for MemoryMapped {
    type Volume = MappedVolume;

    fn name(&self) -> &'static str {
        "memory-mapped"
    }

    fn load(&self, path: &Path, descriptor: &VolumeDescriptor) -> Result<MappedVolume> {
        descriptor.ensure_u16_samples()?;
        if !path.is_file() {
            return Err(VolumeLoaderError::NotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < descriptor.required_file_len() {
            return Err(VolumeLoaderError::Truncated {
                offset: descriptor.header_size(),
                needed: descriptor.byte_len() as u64,
                available: len.saturating_sub(descriptor.header_size()),
            });
        }

        // SAFETY: the mapping is read-only; the file must not be truncated
        // by another process while the returned volume is alive.
        let mmap = unsafe { Mmap::map(&file) }.map_err(VolumeLoaderError::Mapping)?;
        debug!("mapped {} bytes of {}", mmap.len(), path.display());
        MappedVolume::new(*descriptor, mmap)
    }
}

/// One boxed array per z-plane
#[derive(Debug, Clone, Copy, Default)]
pub struct SlicedArray;

impl VolumeLoadStrategy for SlicedArray {
    type Volume = SlicedVolume;

    fn name(&self) -> &'static str {
        "sliced-array"
    }

    fn load(&self, path: &Path, descriptor: &VolumeDescriptor) -> Result<SlicedVolume> {
        let mut source = open_source(path, descriptor)?;
        let mut slices = Vec::with_capacity(descriptor.depth());
        read_planes(&mut source, descriptor, |plane| {
            slices.push(Box::from(plane));
            Ok(())
        })?;
        SlicedVolume::new(*descriptor, slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapHandle;
    use std::cell::Cell;
    use std::io::Write;
    use std::ptr::NonNull;
    use std::rc::Rc;
    use tempfile::NamedTempFile;

    fn stack_file(descriptor: &VolumeDescriptor, samples: &[u16]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0xEE; descriptor.header_size() as usize])
            .unwrap();
        for sample in samples {
            file.write_all(&sample.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[derive(Clone, Default)]
    struct RecordingHeap {
        allocations: Rc<Cell<usize>>,
        zeroed: Rc<Cell<Option<bool>>>,
        refuse: bool,
    }

    impl HeapBinding for RecordingHeap {
        fn process_default_heap(&self) -> HeapHandle {
            GlobalHeap.process_default_heap()
        }

        fn allocate(
            &self,
            heap: HeapHandle,
            byte_size: usize,
            zero_init: bool,
        ) -> Option<NonNull<u8>> {
            self.allocations.set(self.allocations.get() + 1);
            self.zeroed.set(Some(zero_init));
            if self.refuse {
                return None;
            }
            GlobalHeap.allocate(heap, byte_size, zero_init)
        }

        unsafe fn free(&self, heap: HeapHandle, block: NonNull<u8>, byte_size: usize) {
            unsafe { GlobalHeap.free(heap, block, byte_size) }
        }
    }

    #[test]
    fn test_refused_allocation_is_reported() {
        let descriptor = VolumeDescriptor::new(4, 2, 2, 2, 2).unwrap();
        let file = stack_file(&descriptor, &[1; 8]);
        let heap = RecordingHeap {
            refuse: true,
            ..Default::default()
        };
        let result = HeapBacked::with_binding(heap, true).load(file.path(), &descriptor);
        assert!(matches!(
            result,
            Err(VolumeLoaderError::AllocationFailure { bytes: 16 })
        ));
    }

    #[test]
    fn test_missing_file_fails_before_allocation() {
        let descriptor = VolumeDescriptor::new(4, 2, 2, 2, 2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let heap = RecordingHeap::default();
        let allocations = heap.allocations.clone();
        let result = HeapBacked::with_binding(heap, false)
            .load(&dir.path().join("missing.bin"), &descriptor);
        assert!(matches!(result, Err(VolumeLoaderError::NotFound(_))));
        assert_eq!(allocations.get(), 0);
    }

    #[test]
    fn test_default_heap_strategies_keep_their_kind() {
        let os_heap = OsHeapBacked::default();
        assert_eq!(os_heap.name(), "os-heap");
        assert!(os_heap.zero_init());

        let native = NativeUnmanaged::default();
        assert_eq!(native.name(), "native-unmanaged");
        assert!(!native.zero_init());
    }

    #[test]
    fn test_zero_init_flag_reaches_the_binding() {
        let descriptor = VolumeDescriptor::new(0, 2, 2, 2, 2).unwrap();
        let file = stack_file(&descriptor, &[5; 8]);

        for zero_init in [true, false] {
            let strategy = HeapBacked::with_binding(RecordingHeap::default(), zero_init);
            let mut volume = strategy.load(file.path(), &descriptor).unwrap();
            assert_eq!(strategy.binding().zeroed.get(), Some(zero_init));
            assert_eq!(strategy.binding().allocations.get(), 1);

            volume.as_mut_slice()[0] = 9;
            assert_eq!(volume.sample(0, 0, 0), Some(9));
            assert_eq!(volume.sample(1, 0, 0), Some(5));
        }
    }

    #[test]
    fn test_transient_stack_spans_several_scratch_chunks() {
        let descriptor = VolumeDescriptor::new(3, 128, 64, 3, 2).unwrap();
        assert!(descriptor.byte_len() > STACK_SCRATCH_BYTES);
        let samples: Vec<u16> = (0..descriptor.sample_count()).map(|i| (i * 7) as u16).collect();
        let file = stack_file(&descriptor, &samples);

        let volume = TransientStack.load(file.path(), &descriptor).unwrap();
        assert_eq!(volume.as_slice(), &samples[..]);
    }

    #[test]
    fn test_odd_header_mapping_decodes_unaligned() {
        let descriptor = VolumeDescriptor::new(3, 2, 2, 1, 2).unwrap();
        let file = stack_file(&descriptor, &[1, 2, 3, 0xBEEF]);
        let volume = MemoryMapped.load(file.path(), &descriptor).unwrap();
        assert_eq!(volume.sample(1, 1, 0), Some(0xBEEF));
        assert_eq!(volume.slice(0).unwrap().as_ref(), &[1, 2, 3, 0xBEEF]);
    }

    #[test]
    fn test_four_byte_samples_are_rejected() {
        let descriptor = VolumeDescriptor::new(0, 2, 2, 1, 4).unwrap();
        let file = stack_file(&descriptor, &[0; 8]);
        assert!(matches!(
            ManagedArray.load(file.path(), &descriptor),
            Err(VolumeLoaderError::UnsupportedSampleSize(4))
        ));
        assert!(matches!(
            MemoryMapped.load(file.path(), &descriptor),
            Err(VolumeLoaderError::UnsupportedSampleSize(4))
        ));
    }
}
