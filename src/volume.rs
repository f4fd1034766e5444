use std::borrow::Cow;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use ndarray::{Array3, ArrayView2, s};

use crate::{
    descriptor::VolumeDescriptor,
    heap::{HeapBinding, NativeBlock},
    volume_loader::{Result, VolumeLoaderError},
};

/// Read access shared by every loaded volume, whatever owns its samples.
pub trait VolumeSamples {
    /// Dimensions as (depth, height, width)
    fn dim(&self) -> (usize, usize, usize);

    /// Sample at (x, y, z), `None` outside the volume
    fn sample(&self, x: usize, y: usize, z: usize) -> Option<u16>;

    /// Samples of the z-plane `z` in row-major order
    fn slice(&self, z: usize) -> Option<Cow<'_, [u16]>>;

    fn sample_count(&self) -> usize {
        let (depth, height, width) = self.dim();
        depth * height * width
    }

    /// Copy every sample out in file order, `None` if a z-plane is unavailable
    fn to_vec(&self) -> Option<Vec<u16>> {
        let mut samples = Vec::with_capacity(self.sample_count());
        for z in 0..self.dim().0 {
            samples.extend_from_slice(&self.slice(z)?);
        }
        Some(samples)
    }
}

impl<T: VolumeSamples + ?Sized> VolumeSamples for Box<T> {
    fn dim(&self) -> (usize, usize, usize) {
        (**self).dim()
    }

    fn sample(&self, x: usize, y: usize, z: usize) -> Option<u16> {
        (**self).sample(x, y, z)
    }

    fn slice(&self, z: usize) -> Option<Cow<'_, [u16]>> {
        (**self).slice(z)
    }
}

/// First place where two volumes disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    Shape {
        left: (usize, usize, usize),
        right: (usize, usize, usize),
    },
    Sample {
        x: usize,
        y: usize,
        z: usize,
        left: u16,
        right: u16,
    },
    /// One side cannot produce plane `z`, or the planes differ in length
    Missing { z: usize },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Shape { left, right } => write!(f, "shape {left:?} != {right:?}"),
            Mismatch::Sample {
                x,
                y,
                z,
                left,
                right,
            } => write!(f, "sample ({x}, {y}, {z}): {left} != {right}"),
            Mismatch::Missing { z } => write!(f, "slice {z} is unavailable"),
        }
    }
}

/// Compare two volumes plane by plane
pub fn first_mismatch<A, B>(left: &A, right: &B) -> Option<Mismatch>
where
    A: VolumeSamples + ?Sized,
    B: VolumeSamples + ?Sized,
{
    if left.dim() != right.dim() {
        return Some(Mismatch::Shape {
            left: left.dim(),
            right: right.dim(),
        });
    }
    let (depth, _, width) = left.dim();
    for z in 0..depth {
        let (Some(l), Some(r)) = (left.slice(z), right.slice(z)) else {
            return Some(Mismatch::Missing { z });
        };
        if l.len() != r.len() {
            return Some(Mismatch::Missing { z });
        }
        if let Some(i) = l.iter().zip(r.iter()).position(|(a, b)| a != b) {
            return Some(Mismatch::Sample {
                x: i % width,
                y: i / width,
                z,
                left: l[i],
                right: r[i],
            });
        }
    }
    None
}

/// Volume held in an [`Array3`], indexed as `[z, y, x]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Volume {
    pub data: Array3<u16>,
}

impl Volume {
    pub fn new(data: Array3<u16>) -> Self {
        Self { data }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<u16> {
        &mut self.data
    }

    /// View of the z-plane at `index` as `[y, x]`
    pub fn get_slice(&self, index: usize) -> Option<ArrayView2<'_, u16>> {
        if index >= self.data.dim().0 {
            return None;
        }
        Some(self.data.slice(s![index, .., ..]))
    }
}

impl VolumeSamples for Volume {
    fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    fn sample(&self, x: usize, y: usize, z: usize) -> Option<u16> {
        self.data.get((z, y, x)).copied()
    }

    fn slice(&self, z: usize) -> Option<Cow<'_, [u16]>> {
        let view = self.get_slice(z)?;
        Some(match view.to_slice() {
            Some(samples) => Cow::Borrowed(samples),
            None => Cow::Owned(view.iter().copied().collect()),
        })
    }
}

/// Volume stored contiguously, addressed by `x + y * width + z * width * height`.
#[derive(Debug)]
pub struct FlatVolume<S> {
    descriptor: VolumeDescriptor,
    storage: S,
}

/// Flat volume in a block owned through a heap binding
pub type NativeVolume<B> = FlatVolume<NativeBlock<B>>;

impl<S: AsRef<[u16]>> FlatVolume<S> {
    /// Wrap storage holding exactly `descriptor.sample_count()` samples
    pub fn new(descriptor: VolumeDescriptor, storage: S) -> Result<Self> {
        let len = storage.as_ref().len();
        if len != descriptor.sample_count() {
            return Err(VolumeLoaderError::InvalidDescriptor(format!(
                "storage holds {len} samples, descriptor needs {}",
                descriptor.sample_count()
            )));
        }
        Ok(Self {
            descriptor,
            storage,
        })
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    pub fn as_slice(&self) -> &[u16] {
        self.storage.as_ref()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Sample at (x, y, z) without a bounds check.
    ///
    /// # Safety
    ///
    /// `x < width`, `y < height` and `z < depth` must hold.
    #[inline]
    pub unsafe fn sample_unchecked(&self, x: usize, y: usize, z: usize) -> u16 {
        let index = x + y * self.descriptor.width() + z * self.descriptor.slice_len();
        // SAFETY: in-range coordinates give an index below sample_count.
        unsafe { *self.as_slice().get_unchecked(index) }
    }

    /// Drop the volume and its storage now
    pub fn release(self) {
        drop(self);
    }
}

impl<B: HeapBinding> FlatVolume<NativeBlock<B>> {
    pub fn as_mut_slice(&mut self) -> &mut [u16] {
        self.storage.as_mut_slice()
    }
}

impl<S: AsRef<[u16]>> VolumeSamples for FlatVolume<S> {
    fn dim(&self) -> (usize, usize, usize) {
        self.descriptor.dim()
    }

    #[inline]
    fn sample(&self, x: usize, y: usize, z: usize) -> Option<u16> {
        let index = self.descriptor.flat_index(x, y, z)?;
        self.as_slice().get(index).copied()
    }

    fn slice(&self, z: usize) -> Option<Cow<'_, [u16]>> {
        if z >= self.descriptor.depth() {
            return None;
        }
        let len = self.descriptor.slice_len();
        let start = z * len;
        self.as_slice().get(start..start + len).map(Cow::Borrowed)
    }
}

/// Volume read straight out of a read-only file mapping.
///
/// Samples are decoded from the mapped bytes on access. The mapping lives as
/// long as the volume.
#[derive(Debug)]
pub struct MappedVolume {
    descriptor: VolumeDescriptor,
    mmap: Mmap,
    offset: usize,
}

impl MappedVolume {
    pub(crate) fn new(descriptor: VolumeDescriptor, mmap: Mmap) -> Result<Self> {
        let offset = usize::try_from(descriptor.header_size()).map_err(|_| {
            VolumeLoaderError::InvalidDescriptor("header does not fit in memory".to_string())
        })?;
        let available = mmap.len().saturating_sub(offset);
        if offset > mmap.len() || available < descriptor.byte_len() {
            return Err(VolumeLoaderError::Truncated {
                offset: offset as u64,
                needed: descriptor.byte_len() as u64,
                available: available as u64,
            });
        }
        Ok(Self {
            descriptor,
            mmap,
            offset,
        })
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    /// Mapped bytes of the sample region, header excluded
    pub fn bytes(&self) -> &[u8] {
        &self.mmap[self.offset..self.offset + self.descriptor.byte_len()]
    }

    /// Borrow the mapped samples directly.
    ///
    /// Only possible on little-endian hosts when the header size keeps the
    /// sample region two-byte aligned.
    pub fn samples(&self) -> Option<&[u16]> {
        if cfg!(target_endian = "little") {
            bytemuck::try_cast_slice(self.bytes()).ok()
        } else {
            None
        }
    }
}

impl VolumeSamples for MappedVolume {
    fn dim(&self) -> (usize, usize, usize) {
        self.descriptor.dim()
    }

    fn sample(&self, x: usize, y: usize, z: usize) -> Option<u16> {
        let at = self.descriptor.flat_index(x, y, z)? * 2;
        self.bytes().get(at..at + 2).map(LittleEndian::read_u16)
    }

    fn slice(&self, z: usize) -> Option<Cow<'_, [u16]>> {
        let len = self.descriptor.slice_len();
        if z >= self.descriptor.depth() {
            return None;
        }
        let start = z * len;
        if let Some(samples) = self.samples() {
            return samples.get(start..start + len).map(Cow::Borrowed);
        }
        let bytes = self.bytes().get(start * 2..(start + len) * 2)?;
        let mut samples = vec![0u16; len];
        LittleEndian::read_u16_into(bytes, &mut samples);
        Some(Cow::Owned(samples))
    }
}

/// Volume kept as one separately allocated array per z-plane
#[derive(Debug, Clone, PartialEq)]
pub struct SlicedVolume {
    descriptor: VolumeDescriptor,
    slices: Vec<Box<[u16]>>,
}

impl SlicedVolume {
    pub(crate) fn new(descriptor: VolumeDescriptor, slices: Vec<Box<[u16]>>) -> Result<Self> {
        let consistent = slices.len() == descriptor.depth()
            && slices.iter().all(|s| s.len() == descriptor.slice_len());
        if !consistent {
            return Err(VolumeLoaderError::InvalidDescriptor(
                "slices do not match the descriptor".to_string(),
            ));
        }
        Ok(Self { descriptor, slices })
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    pub fn slices(&self) -> &[Box<[u16]>] {
        &self.slices
    }
}

impl VolumeSamples for SlicedVolume {
    fn dim(&self) -> (usize, usize, usize) {
        self.descriptor.dim()
    }

    fn sample(&self, x: usize, y: usize, z: usize) -> Option<u16> {
        self.descriptor.flat_index(x, y, 0)?;
        self.slices
            .get(z)
            .and_then(|slice| slice.get(x + y * self.descriptor.width()))
            .copied()
    }

    fn slice(&self, z: usize) -> Option<Cow<'_, [u16]>> {
        self.slices.get(z).map(|slice| Cow::Borrowed(&slice[..]))
    }
}
