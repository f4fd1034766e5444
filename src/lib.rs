//! # volume-stack
//!
//! Loads stacked volume files: an opaque header of known length followed by
//! width x height x depth 16-bit little-endian samples, x varying fastest,
//! then y, then z. The file carries no dimensions of its own, they come from
//! a [`VolumeDescriptor`].
//!
//! The same file can be loaded through several interchangeable strategies,
//! each with its own ownership model:
//!  - [`ManagedArray`]: an ndarray [`Volume`], freed when dropped
//!  - [`NativeUnmanaged`]: one block from the global allocator
//!  - [`TransientStack`]: decoded through a stack scratch buffer into a boxed slice
//!  - [`OsHeapBacked`]: one zero-initialised block from the OS heap binding
//!  - [`MemoryMapped`]: a read-only mapping of the file
//!  - [`SlicedArray`]: one array per z-plane
//!
//! Every strategy yields the same sample at every (x, y, z) for the same file
//! and descriptor. Native blocks are single-owner and go back to their heap
//! when the volume is dropped.
//!
//! For display the volume can also be read as a sequence of frozen 16-bit
//! grayscale [`SliceImage`]s, either all at once or lazily.
//!
//! # Examples
//!
//! ```no_run
//! # use volume_stack::{HeapBacked, ManagedArray, VolumeDescriptor, VolumeLoader, VolumeSamples};
//! let descriptor = VolumeDescriptor::new(1024, 126, 126, 125, 2)
//!     .expect("should be a valid descriptor");
//! let loader = VolumeLoader::open("TestFile.Bin").expect("file should exist");
//!
//! let managed = loader
//!     .load(&ManagedArray, &descriptor)
//!     .expect("should have loaded the volume");
//! let native = loader
//!     .load(&HeapBacked::os_heap(), &descriptor)
//!     .expect("should have loaded the volume");
//! assert_eq!(managed.sample(0, 0, 0), native.sample(0, 0, 0));
//!
//! let slices = loader
//!     .slice_images(&descriptor)
//!     .expect("should have read the slices");
//! slices
//!     .slice_image(slices.slice_count() / 2)
//!     .expect("should have a center slice")
//!     .save("center.png")
//!     .expect("should have written the slice");
//! ```

pub mod descriptor;
pub mod enums;
pub mod heap;
pub mod slice_image;
pub mod source;
pub mod strategy;
pub mod volume;
pub mod volume_loader;

pub use descriptor::VolumeDescriptor;
pub use enums::StrategyKind;
pub use heap::{GlobalHeap, HeapBinding, HeapHandle, NativeBlock, OsHeap, SystemHeap};
pub use slice_image::{Gray16Image, LazySlices, SliceImage, SliceImages};
pub use source::FileSampleSource;
pub use strategy::{
    HeapBacked, ManagedArray, MemoryMapped, NativeUnmanaged, OsHeapBacked, SlicedArray,
    TransientStack, VolumeLoadStrategy,
};
pub use volume::{
    FlatVolume, MappedVolume, Mismatch, NativeVolume, SlicedVolume, Volume, VolumeSamples,
    first_mismatch,
};
pub use volume_loader::{Result, VolumeLoader, VolumeLoaderError};
