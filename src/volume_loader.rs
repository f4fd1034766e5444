use crate::{
    descriptor::VolumeDescriptor,
    enums::StrategyKind,
    slice_image::{LazySlices, SliceImages},
    source::FileSampleSource,
    strategy::{
        HeapBacked, ManagedArray, MemoryMapped, SlicedArray, TransientStack, VolumeLoadStrategy,
    },
    volume::VolumeSamples,
};

use log::debug;
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use web_time::Instant;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Truncated volume: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: u64,
        needed: u64,
        available: u64,
    },

    #[error("Allocation of {bytes} bytes failed")]
    AllocationFailure { bytes: usize },

    #[error("Mapping failed: {0}")]
    Mapping(#[source] io::Error),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Unsupported sample size: {0} bytes, only 16-bit samples are decoded")]
    UnsupportedSampleSize(usize),

    #[error("Slice index {index} out of range for {count} slices")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, VolumeLoaderError>;

/// A stacked volume file whose existence has been checked.
///
/// Every load reopens the file, so loads are independent of each other.
#[derive(Debug, Clone)]
pub struct VolumeLoader {
    path: PathBuf,
}

impl VolumeLoader {
    /// Bind a loader to the file at `path`
    ///
    /// # Errors
    ///
    /// Returns [`VolumeLoaderError::NotFound`] if `path` is not an existing file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VolumeLoaderError::NotFound(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole volume with the given strategy
    pub fn load<S: VolumeLoadStrategy>(
        &self,
        strategy: &S,
        descriptor: &VolumeDescriptor,
    ) -> Result<S::Volume> {
        let t0 = Instant::now();
        let volume = strategy.load(&self.path, descriptor)?;
        debug!(
            "{} loaded {} samples in {:?}",
            strategy.name(),
            volume.sample_count(),
            t0.elapsed()
        );
        Ok(volume)
    }

    /// Load with the strategy named by `kind`
    pub fn load_kind(
        &self,
        kind: StrategyKind,
        descriptor: &VolumeDescriptor,
    ) -> Result<Box<dyn VolumeSamples>> {
        let volume: Box<dyn VolumeSamples> = match kind {
            StrategyKind::ManagedArray => Box::new(self.load(&ManagedArray, descriptor)?),
            StrategyKind::NativeUnmanaged => {
                Box::new(self.load(&HeapBacked::native(), descriptor)?)
            }
            StrategyKind::TransientStack => Box::new(self.load(&TransientStack, descriptor)?),
            StrategyKind::OsHeap => Box::new(self.load(&HeapBacked::os_heap(), descriptor)?),
            StrategyKind::MemoryMapped => Box::new(self.load(&MemoryMapped, descriptor)?),
            StrategyKind::SlicedArray => Box::new(self.load(&SlicedArray, descriptor)?),
        };
        Ok(volume)
    }

    /// Read every z-plane into its own frozen image
    pub fn slice_images(&self, descriptor: &VolumeDescriptor) -> Result<SliceImages> {
        descriptor.ensure_u16_samples()?;
        let mut source = FileSampleSource::open_with(&self.path, descriptor)?;
        SliceImages::project(&mut source, descriptor)
    }

    /// Forward-only sequence of slice images, one z-plane read per step
    pub fn lazy_slices(&self, descriptor: &VolumeDescriptor) -> Result<LazySlices> {
        descriptor.ensure_u16_samples()?;
        let source = FileSampleSource::open_with(&self.path, descriptor)?;
        Ok(LazySlices::new(source, *descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = VolumeLoader::open(dir.path().join("TestFile.Bin"));
        assert!(matches!(result, Err(VolumeLoaderError::NotFound(_))));
    }

    #[test]
    fn test_truncated_message_names_counts() {
        let err = VolumeLoaderError::Truncated {
            offset: 1024,
            needed: 31752,
            available: 10,
        };
        assert_eq!(
            err.to_string(),
            "Truncated volume: needed 31752 bytes at offset 1024, 10 available"
        );
    }
}
