use crate::volume_loader::{Result, VolumeLoaderError};

/// Geometry and header contract of a stacked volume file.
///
/// The file carries no metadata of its own, so the descriptor has to match
/// the layout of the producing process exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDescriptor {
    header_size: u64,
    width: usize,
    height: usize,
    depth: usize,
    bytes_per_sample: usize,
}

impl VolumeDescriptor {
    /// Geometry of the 126x126x125 test stack with a 1024 byte header.
    pub const SAMPLE_STACK: VolumeDescriptor = VolumeDescriptor {
        header_size: 1024,
        width: 126,
        height: 126,
        depth: 125,
        bytes_per_sample: 2,
    };

    /// Create a descriptor
    ///
    /// # Errors
    ///
    /// Returns [`VolumeLoaderError::InvalidDescriptor`] if any dimension or
    /// the sample size is zero, or if the total byte length overflows.
    pub fn new(
        header_size: u64,
        width: usize,
        height: usize,
        depth: usize,
        bytes_per_sample: usize,
    ) -> Result<Self> {
        if width == 0 || height == 0 || depth == 0 {
            return Err(VolumeLoaderError::InvalidDescriptor(format!(
                "dimensions must be positive, got {width}x{height}x{depth}"
            )));
        }
        if bytes_per_sample == 0 {
            return Err(VolumeLoaderError::InvalidDescriptor(
                "bytes per sample must be positive".to_string(),
            ));
        }
        let byte_len = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(depth))
            .and_then(|n| n.checked_mul(bytes_per_sample))
            .ok_or_else(|| {
                VolumeLoaderError::InvalidDescriptor(format!(
                    "{width}x{height}x{depth} samples of {bytes_per_sample} bytes overflow"
                ))
            })?;
        header_size.checked_add(byte_len as u64).ok_or_else(|| {
            VolumeLoaderError::InvalidDescriptor("header plus samples overflow".to_string())
        })?;

        Ok(Self {
            header_size,
            width,
            height,
            depth,
            bytes_per_sample,
        })
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bytes_per_sample
    }

    /// Dimensions as (depth, height, width), the order used by [`crate::volume::Volume`]
    pub fn dim(&self) -> (usize, usize, usize) {
        (self.depth, self.height, self.width)
    }

    /// Samples in one z-plane
    pub fn slice_len(&self) -> usize {
        self.width * self.height
    }

    pub fn slice_byte_len(&self) -> usize {
        self.slice_len() * self.bytes_per_sample
    }

    pub fn sample_count(&self) -> usize {
        self.slice_len() * self.depth
    }

    pub fn byte_len(&self) -> usize {
        self.sample_count() * self.bytes_per_sample
    }

    /// Smallest file length that holds the header and every sample
    pub fn required_file_len(&self) -> u64 {
        self.header_size + self.byte_len() as u64
    }

    /// Flat sample index with x varying fastest, then y, then z.
    ///
    /// Returns `None` for coordinates outside the volume.
    #[inline]
    pub fn flat_index(&self, x: usize, y: usize, z: usize) -> Option<usize> {
        if x >= self.width || y >= self.height || z >= self.depth {
            return None;
        }
        Some(x + y * self.width + z * self.slice_len())
    }

    /// Inverse of [`Self::flat_index`], returns (x, y, z)
    pub fn coordinates(&self, index: usize) -> Option<(usize, usize, usize)> {
        if index >= self.sample_count() {
            return None;
        }
        let z = index / self.slice_len();
        let rest = index % self.slice_len();
        Some((rest % self.width, rest / self.width, z))
    }

    pub(crate) fn ensure_u16_samples(&self) -> Result<()> {
        if self.bytes_per_sample != 2 {
            return Err(VolumeLoaderError::UnsupportedSampleSize(self.bytes_per_sample));
        }
        Ok(())
    }
}
