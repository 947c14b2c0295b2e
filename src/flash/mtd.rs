//! NAND abstraction over the Linux MTD character devices, plus `/proc/mtd` lookup
//!
//! Recovery partitions on MTD devices are named in `/proc/mtd` (`mtd3: 00500000 00020000 "boot"`),
//! and the same index addresses both `/dev/mtd/mtdN` (raw) and `/dev/block/mtdblockN` (mountable).

use super::{Nand, NandBlock, NandLayout};

use anyhow::{anyhow, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::{Path, PathBuf};

/// Where the kernel lists MTD partitions
pub const PROC_MTD: &str = "/proc/mtd";

/// Find the index of the partition called `name` in a `/proc/mtd` listing.
pub fn find_mtd_index<R: BufRead>(listing: R, name: &str) -> anyhow::Result<Option<u32>> {
    let quoted = format!("\"{name}\"");
    for line in listing.lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let Some(dev) = fields.next() else { continue };
        if fields.last() != Some(quoted.as_str()) {
            continue;
        }
        let index = dev
            .strip_prefix("mtd")
            .and_then(|rest| rest.strip_suffix(':'))
            .and_then(|n| n.parse().ok());
        if index.is_some() {
            return Ok(index);
        }
    }
    Ok(None)
}

/// Look up a partition's MTD index on the running system.
pub fn lookup_index(name: &str) -> anyhow::Result<u32> {
    let proc_mtd = BufReader::new(File::open(PROC_MTD)?);
    find_mtd_index(proc_mtd, name)?.ok_or_else(|| anyhow!("MTD partition {name:?} not found"))
}

/// The mountable block device for MTD partition `index`
pub fn block_device(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/block/mtdblock{index}"))
}

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its partition name
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        let index = lookup_index(name)?;

        // Android puts the nodes in a subdirectory; plain Linux does not
        let nested = PathBuf::from(format!("/dev/mtd/mtd{index}"));
        if nested.exists() {
            Self::open(nested)
        } else {
            Self::open(format!("/dev/mtd{index}"))
        }
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<MtdBlock<'_>>> {
        ensure!(index < self.layout.blocks, "block {index} out of range");

        let block_base = self.layout.block_size() as u64 * index as u64;
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        if bad == 0 {
            Ok(Some(MtdBlock { nand: self, index }))
        } else {
            Ok(None)
        }
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl MtdBlock<'_> {
    fn size(&self) -> u32 {
        self.nand.layout.block_size() as u32
    }

    fn base(&self) -> u32 {
        self.size() * self.index
    }

    /// Ensure that the byte count and starting page range is valid, and compute the /dev/mtdX
    /// offset for the page
    fn offset_for(&self, start_page: u32, bytes: usize) -> anyhow::Result<u64> {
        ensure!(
            bytes % self.page_size() == 0,
            "buffer not multiple of page size"
        );

        let end_page = start_page + (bytes / self.page_size()) as u32;
        ensure!(
            end_page <= self.page_count(),
            "block {0}, page range {start_page}..{end_page} out of bounds",
            self.index
        );

        Ok((self.base() + self.page_size() as u32 * start_page) as u64)
    }
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }
    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(start_page, content.len())?;
        Ok(self.nand.file.read_exact_at(content, offset)?)
    }
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(start_page, content.len())?;
        Ok(self.nand.file.write_all_at(content, offset)?)
    }
    fn erase(&mut self) -> anyhow::Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: self.base(),
            length: self.size(),
        };
        unsafe {
            ioctl::memerase(self.nand.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }
    fn mark_bad(self) -> anyhow::Result<()> {
        let block_base: u64 = self.base() as u64;
        unsafe {
            ioctl::memsetbadblock(self.nand.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryFrom<mtd_info_user> for NandLayout {
        type Error = anyhow::Error;

        fn try_from(mut info: mtd_info_user) -> anyhow::Result<NandLayout> {
            if info.writesize == 1 {
                // NOR and mtdram report byte-granular writes
                info.writesize = 64;
            }

            ensure!(
                info.erasesize != 0 && info.size % info.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                info.erasesize % info.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(NandLayout {
                blocks: info.size / info.erasesize,
                pages_per_block: info.erasesize / info.writesize,
                bytes_per_page: info.writesize as usize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);
}

#[test]
fn test_find_mtd_index() -> anyhow::Result<()> {
    const LISTING: &str = "dev:    size   erasesize  name
mtd0: 00040000 00020000 \"misc\"
mtd1: 00500000 00020000 \"recovery\"
mtd2: 00280000 00020000 \"boot\"
mtd3: 0fa00000 00020000 \"system\"
mtd4: 02800000 00020000 \"cache\"
mtd5: 0af20000 00020000 \"userdata\"
";
    assert_eq!(find_mtd_index(LISTING.as_bytes(), "boot")?, Some(2));
    assert_eq!(find_mtd_index(LISTING.as_bytes(), "userdata")?, Some(5));
    assert_eq!(find_mtd_index(LISTING.as_bytes(), "data")?, None);
    assert_eq!(find_mtd_index(LISTING.as_bytes(), "name")?, None);
    Ok(())
}

#[test]
fn test_block_device() {
    assert_eq!(block_device(3), Path::new("/dev/block/mtdblock3"));
}
