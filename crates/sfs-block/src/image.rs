//! Memory-mapped image access.
//!
//! Owns the container mapping and the validated header; hands out the
//! metadata span, the block-index span, and per-block compressed byte
//! spans. Compressed bytes are only ever borrowed — the decoder never
//! takes ownership of mapped memory.

use memmap2::{Advice, Mmap};
use sfs_error::{Result, SfsError};
use sfs_ondisk::{BlockIndexRef, ImageHeader};
use sfs_types::{u64_to_usize, BlockId, ImageOffset, MlockMode, IMAGE_HEADER_LEN};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options applied while opening an image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageMapOptions {
    pub offset: ImageOffset,
    pub mlock: MlockMode,
    /// Advise the kernel to keep the compressed image in the page
    /// cache (`true`) or treat access as random drop-behind (`false`).
    pub cache_image: bool,
}

#[derive(Debug)]
enum ImageData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl ImageData {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Owned(vec) => vec,
        }
    }
}

/// Read-only mapping of an image container file.
#[derive(Debug)]
pub struct ImageMap {
    data: ImageData,
    image_start: usize,
    header: ImageHeader,
}

impl ImageMap {
    /// Open and validate an image file.
    pub fn open(path: impl AsRef<Path>, options: &ImageMapOptions) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let map = map_readonly(&file)?;

        debug!(
            target: "sfs::block::image",
            event = "image_mapped",
            path = %path.display(),
            bytes = map.len()
        );

        apply_advice(&map, options);
        Self::from_data(ImageData::Mapped(map), options)
    }

    /// Build an image map over an in-memory container.
    ///
    /// Used by tests and tools that assemble images without touching
    /// disk; page locking and cache advice do not apply.
    pub fn from_bytes(container: Vec<u8>, options: &ImageMapOptions) -> Result<Arc<Self>> {
        Self::from_data(ImageData::Owned(container), options)
    }

    fn from_data(data: ImageData, options: &ImageMapOptions) -> Result<Arc<Self>> {
        let container = data.bytes();
        let image_start = locate_image(container, options.offset)?;
        let image = &container[image_start..];
        let header = ImageHeader::parse(image, image.len() as u64)
            .map_err(|err| SfsError::InvalidImage(err.to_string()))?;

        info!(
            target: "sfs::block::image",
            event = "image_opened",
            image_offset = image_start,
            blocks = header.num_blocks(),
            block_size = header.block_size.block_size(),
            metadata_bytes = header.metadata_len
        );

        let map = Self {
            data,
            image_start,
            header,
        };
        map.apply_mlock(options.mlock)?;
        Ok(Arc::new(map))
    }

    fn apply_mlock(&self, mode: MlockMode) -> Result<()> {
        let ImageData::Mapped(map) = &self.data else {
            return Ok(());
        };
        match mode {
            MlockMode::None => Ok(()),
            MlockMode::Try => {
                if let Err(err) = map.lock() {
                    warn!(
                        target: "sfs::block::image",
                        event = "mlock_failed",
                        error = %err
                    );
                }
                Ok(())
            }
            MlockMode::Must => {
                map.lock()?;
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    fn image(&self) -> &[u8] {
        &self.data.bytes()[self.image_start..]
    }

    /// The packed metadata span.
    #[must_use]
    pub fn metadata(&self) -> &[u8] {
        // Spans validated against the container in `ImageHeader::parse`.
        let start = self.header.metadata_offset as usize;
        let len = self.header.metadata_len as usize;
        &self.image()[start..start + len]
    }

    /// The block-index span.
    #[must_use]
    pub fn block_index(&self) -> BlockIndexRef<'_> {
        let start = self.header.block_index_offset as usize;
        let len = self.header.block_index_len as usize;
        BlockIndexRef::new(&self.image()[start..start + len])
    }

    /// Compressed byte span and raw codec tag of a block.
    pub fn compressed_block(&self, block: BlockId) -> Result<(&[u8], u8)> {
        let entry = self
            .block_index()
            .entry(block)
            .map_err(|err| SfsError::InvalidImage(err.to_string()))?;
        let image = self.image();
        let start = u64_to_usize(entry.data_offset, "block_data_offset")?;
        let end = start
            .checked_add(entry.compressed_len as usize)
            .filter(|end| *end <= image.len())
            .ok_or_else(|| SfsError::CorruptBlock {
                block: u64::from(block.0),
                detail: "compressed span extends past end of image".to_owned(),
            })?;
        Ok((&image[start..end], entry.codec_raw))
    }
}

#[allow(unsafe_code)]
fn map_readonly(file: &File) -> Result<Mmap> {
    // Safety: read-only mapping of an image file that must stay
    // unmodified for the life of the mount.
    let map = unsafe { Mmap::map(file) }?;
    Ok(map)
}

fn apply_advice(map: &Mmap, options: &ImageMapOptions) {
    let advice = if options.cache_image {
        Advice::WillNeed
    } else {
        Advice::Random
    };
    if let Err(err) = map.advise(advice) {
        debug!(
            target: "sfs::block::image",
            event = "madvise_failed",
            error = %err
        );
    }
}

fn locate_image(container: &[u8], offset: ImageOffset) -> Result<usize> {
    let start = match offset {
        ImageOffset::Start => 0,
        ImageOffset::Explicit(at) => u64_to_usize(at, "image_offset")?,
        ImageOffset::Auto => {
            let Some(at) = ImageHeader::scan_for_image(container) else {
                return Err(SfsError::InvalidImage(
                    "no image magic found in container".to_owned(),
                ));
            };
            u64_to_usize(at, "image_offset")?
        }
    };

    if start + IMAGE_HEADER_LEN > container.len() {
        return Err(SfsError::InvalidImage(
            "image offset past end of container".to_owned(),
        ));
    }
    Ok(start)
}
