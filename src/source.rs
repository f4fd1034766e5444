use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, ReadBytesExt};
use log::trace;

use crate::{
    descriptor::VolumeDescriptor,
    volume_loader::{Result, VolumeLoaderError},
};

/// Sequential reader over the samples of a stacked volume file.
///
/// The file handle is owned by the source and closed when it is dropped, which
/// happens on every exit path of the loaders that create one.
#[derive(Debug)]
pub struct FileSampleSource {
    path: PathBuf,
    reader: BufReader<File>,
    position: u64,
    len: u64,
}

impl FileSampleSource {
    /// Open the file at `path`
    ///
    /// # Errors
    ///
    /// Returns [`VolumeLoaderError::NotFound`] if `path` is not an existing
    /// file. Nothing has been read or allocated at that point.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VolumeLoaderError::NotFound(path.to_path_buf()));
        }
        let file = File::open(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => VolumeLoaderError::NotFound(path.to_path_buf()),
            _ => VolumeLoaderError::Io(err),
        })?;
        let len = file.metadata()?.len();
        trace!("opened {} ({len} bytes)", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            position: 0,
            len,
        })
    }

    /// Open the file and position the cursor on the first sample
    pub fn open_with(path: impl AsRef<Path>, descriptor: &VolumeDescriptor) -> Result<Self> {
        let mut source = Self::open(path)?;
        source.skip(descriptor.header_size())?;
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current byte offset from the start of the file
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left between the cursor and the end of the file
    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.position)
    }

    /// Advance the cursor by `bytes` without decoding them
    pub fn skip(&mut self, bytes: u64) -> Result<()> {
        self.claim(bytes)?;
        let target = self.position + bytes;
        self.reader.seek(SeekFrom::Start(target))?;
        self.position = target;
        Ok(())
    }

    /// Read the next `count` little-endian samples
    pub fn read_samples(&mut self, count: usize) -> Result<Vec<u16>> {
        let mut samples = vec![0u16; count];
        self.read_samples_into(&mut samples)?;
        Ok(samples)
    }

    /// Fill `dst` with the next `dst.len()` little-endian samples
    pub fn read_samples_into(&mut self, dst: &mut [u16]) -> Result<()> {
        let needed = (dst.len() * 2) as u64;
        self.claim(needed)?;
        self.reader
            .read_u16_into::<LittleEndian>(dst)
            .map_err(|err| self.translate(err, needed))?;
        self.position += needed;
        Ok(())
    }

    /// Fill `dst` with the next raw bytes
    pub fn read_bytes_into(&mut self, dst: &mut [u8]) -> Result<()> {
        let needed = dst.len() as u64;
        self.claim(needed)?;
        self.reader
            .read_exact(dst)
            .map_err(|err| self.translate(err, needed))?;
        self.position += needed;
        Ok(())
    }

    fn claim(&self, needed: u64) -> Result<()> {
        if needed > self.remaining() {
            return Err(self.truncated(needed));
        }
        Ok(())
    }

    fn truncated(&self, needed: u64) -> VolumeLoaderError {
        VolumeLoaderError::Truncated {
            offset: self.position,
            needed,
            available: self.remaining(),
        }
    }

    // the file may shrink between open and read
    fn translate(&self, err: io::Error, needed: u64) -> VolumeLoaderError {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => self.truncated(needed),
            _ => VolumeLoaderError::Io(err),
        }
    }
}
