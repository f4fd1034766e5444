use std::iter::FusedIterator;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use image::{ImageBuffer, Luma};
use log::debug;

use crate::{
    descriptor::VolumeDescriptor,
    source::FileSampleSource,
    volume::VolumeSamples,
    volume_loader::{Result, VolumeLoaderError},
};

/// 16-bit grayscale image buffer
pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Immutable 16-bit grayscale image of one z-plane
#[derive(Debug, Clone, PartialEq)]
pub struct SliceImage {
    index: usize,
    image: Gray16Image,
}

impl SliceImage {
    fn from_samples(index: usize, width: usize, height: usize, samples: Vec<u16>) -> Result<Self> {
        let too_large = || {
            VolumeLoaderError::InvalidDescriptor(format!(
                "slice of {width}x{height} does not fit an image"
            ))
        };
        let width = u32::try_from(width).map_err(|_| too_large())?;
        let height = u32::try_from(height).map_err(|_| too_large())?;
        let image = ImageBuffer::from_raw(width, height, samples).ok_or_else(too_large)?;
        Ok(Self { index, image })
    }

    /// Depth index this image was taken from
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        self.image.get_pixel_checked(x, y).map(|p| p.0[0])
    }

    pub fn samples(&self) -> &[u16] {
        self.image.as_raw()
    }

    pub fn as_image(&self) -> &Gray16Image {
        &self.image
    }

    /// Write the image, format picked from the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.image.save(path)?;
        Ok(())
    }
}

fn decode_slice(descriptor: &VolumeDescriptor, index: usize, scratch: &[u8]) -> Result<SliceImage> {
    let mut samples = vec![0u16; descriptor.slice_len()];
    LittleEndian::read_u16_into(scratch, &mut samples);
    SliceImage::from_samples(index, descriptor.width(), descriptor.height(), samples)
}

/// Every z-plane of a volume as an image, in ascending depth order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceImages {
    images: Vec<SliceImage>,
}

impl SliceImages {
    /// Read `descriptor.depth()` slices from `source`, which must be
    /// positioned on the first sample.
    pub fn project(source: &mut FileSampleSource, descriptor: &VolumeDescriptor) -> Result<Self> {
        descriptor.ensure_u16_samples()?;
        let mut scratch = vec![0u8; descriptor.slice_byte_len()];
        let mut images = Vec::with_capacity(descriptor.depth());

        for index in 0..descriptor.depth() {
            source.read_bytes_into(&mut scratch)?;
            images.push(decode_slice(descriptor, index, &scratch)?);
        }
        debug!("projected {} slices from {}", images.len(), source.path().display());

        Ok(Self { images })
    }

    /// Build the images from an already loaded volume
    pub fn from_volume<V: VolumeSamples + ?Sized>(volume: &V) -> Result<Self> {
        let (depth, height, width) = volume.dim();
        let images = (0..depth)
            .map(|index| {
                let samples = volume
                    .slice(index)
                    .ok_or(VolumeLoaderError::IndexOutOfRange { index, count: depth })?
                    .into_owned();
                SliceImage::from_samples(index, width, height, samples)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { images })
    }

    pub fn slice_count(&self) -> usize {
        self.images.len()
    }

    /// Highest index a caller stepping through the slices may reach
    pub fn last_index(&self) -> Option<usize> {
        self.images.len().checked_sub(1)
    }

    pub fn slice_image(&self, index: usize) -> Result<&SliceImage> {
        self.images
            .get(index)
            .ok_or(VolumeLoaderError::IndexOutOfRange {
                index,
                count: self.images.len(),
            })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SliceImage> {
        self.images.iter()
    }

    pub fn into_vec(self) -> Vec<SliceImage> {
        self.images
    }
}

impl IntoIterator for SliceImages {
    type Item = SliceImage;
    type IntoIter = std::vec::IntoIter<SliceImage>;

    fn into_iter(self) -> Self::IntoIter {
        self.images.into_iter()
    }
}

impl<'a> IntoIterator for &'a SliceImages {
    type Item = &'a SliceImage;
    type IntoIter = std::slice::Iter<'a, SliceImage>;

    fn into_iter(self) -> Self::IntoIter {
        self.images.iter()
    }
}

/// Slice images read one at a time.
///
/// The file is closed as soon as the last slice has been read or a read
/// fails; after an error the iterator yields nothing more.
#[derive(Debug)]
pub struct LazySlices {
    source: Option<FileSampleSource>,
    descriptor: VolumeDescriptor,
    scratch: Vec<u8>,
    next: usize,
}

impl LazySlices {
    pub fn new(source: FileSampleSource, descriptor: VolumeDescriptor) -> Self {
        Self {
            source: Some(source),
            scratch: vec![0u8; descriptor.slice_byte_len()],
            descriptor,
            next: 0,
        }
    }
}

impl Iterator for LazySlices {
    type Item = Result<SliceImage>;

    fn next(&mut self) -> Option<Self::Item> {
        let source = self.source.as_mut()?;
        let index = self.next;
        let result = source
            .read_bytes_into(&mut self.scratch)
            .and_then(|()| decode_slice(&self.descriptor, index, &self.scratch));

        self.next += 1;
        if result.is_err() || self.next == self.descriptor.depth() {
            self.source = None;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.source {
            Some(_) => (0, Some(self.descriptor.depth() - self.next)),
            None => (0, Some(0)),
        }
    }
}

impl FusedIterator for LazySlices {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn plane_file(descriptor: &VolumeDescriptor, planes: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0; descriptor.header_size() as usize])
            .unwrap();
        for z in 0..planes {
            for _ in 0..descriptor.slice_len() {
                file.write_all(&(z as u16 + 1).to_le_bytes()).unwrap();
            }
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_images_are_independent_of_scratch() {
        let descriptor = VolumeDescriptor::new(8, 3, 2, 4, 2).unwrap();
        let file = plane_file(&descriptor, 4);
        let mut source = FileSampleSource::open_with(file.path(), &descriptor).unwrap();
        let images = SliceImages::project(&mut source, &descriptor).unwrap();

        assert_eq!(images.slice_count(), 4);
        assert_eq!(images.last_index(), Some(3));
        for (z, image) in images.iter().enumerate() {
            assert_eq!(image.index(), z);
            assert_eq!((image.width(), image.height()), (3, 2));
            assert!(image.samples().iter().all(|&v| v == z as u16 + 1));
        }
    }

    #[test]
    fn test_slice_image_out_of_range() {
        let images = SliceImages::default();
        assert!(matches!(
            images.slice_image(0),
            Err(VolumeLoaderError::IndexOutOfRange { index: 0, count: 0 })
        ));
    }

    #[test]
    fn test_projection_of_short_file_is_truncated() {
        let descriptor = VolumeDescriptor::new(0, 2, 2, 3, 2).unwrap();
        let file = plane_file(&descriptor, 2);
        let mut source = FileSampleSource::open_with(file.path(), &descriptor).unwrap();
        assert!(matches!(
            SliceImages::project(&mut source, &descriptor),
            Err(VolumeLoaderError::Truncated { .. })
        ));
    }

    #[test]
    fn test_lazy_slices_fuse_after_error() {
        let descriptor = VolumeDescriptor::new(0, 2, 2, 3, 2).unwrap();
        let file = plane_file(&descriptor, 2);
        let source = FileSampleSource::open_with(file.path(), &descriptor).unwrap();
        let mut slices = LazySlices::new(source, descriptor);

        assert_eq!(slices.next().unwrap().unwrap().pixel(1, 1), Some(1));
        assert_eq!(slices.next().unwrap().unwrap().pixel(0, 0), Some(2));
        assert!(matches!(
            slices.next(),
            Some(Err(VolumeLoaderError::Truncated { .. }))
        ));
        assert!(slices.next().is_none());
    }

    #[test]
    fn test_lazy_slices_end_after_depth() {
        let descriptor = VolumeDescriptor::new(0, 2, 2, 2, 2).unwrap();
        let file = plane_file(&descriptor, 3);
        let source = FileSampleSource::open_with(file.path(), &descriptor).unwrap();
        let images: Vec<_> = LazySlices::new(source, descriptor)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].index(), 1);
    }

    #[test]
    fn test_save_png_roundtrips_pixels() {
        let descriptor = VolumeDescriptor::new(0, 4, 4, 1, 2).unwrap();
        let file = plane_file(&descriptor, 1);
        let mut source = FileSampleSource::open_with(file.path(), &descriptor).unwrap();
        let images = SliceImages::project(&mut source, &descriptor).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("slice_00000.png");
        images.slice_image(0).unwrap().save(&out).unwrap();
        let decoded = image::open(&out).unwrap().into_luma16();
        let slice = images.slice_image(0).unwrap();
        assert_eq!(decoded.as_raw(), slice.samples());
        assert_eq!(&decoded, slice.as_image());
    }
}
