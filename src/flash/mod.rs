//! Raw flash access: the NAND abstraction used to image MTD partitions, and the `RawFlash`
//! capability the rest of the recovery uses to back up and restore whole partitions.
//!
//! Partitions on MTD cannot be archived at the filesystem level; they are copied block-by-block
//! instead, skipping blocks the flash has marked bad.

use std::fs::File;
use std::path::Path;

pub mod image;
pub mod mtd;
#[cfg(test)]
pub mod sim;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// Geometry of a NAND flash partition
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// Bytes in one eraseblock
    pub fn block_size(&self) -> usize {
        self.pages_per_block as usize * self.bytes_per_page
    }
}

/// An MTD partition (or a simulation of one)
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the partition
    fn get_layout(&self) -> NandLayout;
}

/// One eraseblock of a partition
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Pages must be programmed in ascending order; writing a page makes it and every skipped
    /// page before it nonwritable until the next erase.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// Whole-partition image copies, keyed by the partition's device name (e.g. `boot`).
pub trait RawFlash {
    /// Copy the partition's contents into `image`.
    fn backup(&mut self, device: &str, image: &Path) -> anyhow::Result<()>;

    /// Overwrite the partition with the contents of `image`. Whatever the image doesn't cover is
    /// left erased.
    fn restore(&mut self, device: &str, image: &Path) -> anyhow::Result<()>;
}

/// `RawFlash` over the kernel's MTD character devices
#[derive(Debug, Default)]
pub struct MtdFlash;

impl RawFlash for MtdFlash {
    fn backup(&mut self, device: &str, image: &Path) -> anyhow::Result<()> {
        let mut nand = mtd::MtdNand::open_named(device)?;
        let mut out = File::create(image)?;
        let written = image::dump_raw_image(&mut nand, &mut out)?;
        log::info!("dumped {written} bytes of {device} to {}", image.display());
        out.sync_all()?;
        Ok(())
    }

    fn restore(&mut self, device: &str, image: &Path) -> anyhow::Result<()> {
        let mut nand = mtd::MtdNand::open_named(device)?;
        let mut input = File::open(image)?;
        image::flash_raw_image(&mut nand, &mut input)?;
        log::info!("flashed {} to {device}", image.display());
        Ok(())
    }
}
