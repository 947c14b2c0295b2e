//! Whole-partition raw images: dumping a partition to a file, writing a file back, and erasing.
//!
//! Bad blocks are invisible in an image: a dump skips them, and a write skips over them (marking
//! new ones bad as they fail), so an image taken from one device can be restored to another with
//! a different bad-block map.

use super::{Nand, NandBlock, PageUtil};
use crate::util::ReadExt;

use std::io::{Read, Write};

/// How many pages do we read at a time? A higher number helps in high-latency situations.
const PAGE_CHUNKS: u32 = 8;

/// How many times to rewrite a block before giving up on it
const BLOCK_ATTEMPTS: usize = 5;

/// Compare a block against `data`, which may be shorter than the block ("don't care" after it).
///
/// Returns the number of leading pages that already match (the page where programming can
/// resume), or None if some page differs from what is wanted and the block must be erased.
fn check_raw_block<B: NandBlock>(block: &B, mut data: &[u8]) -> Option<u32> {
    let mut buf = vec![0; block.page_size() * PAGE_CHUNKS as usize];
    let mut remaining: &[u8] = &[];

    let mut page: u32 = 0;
    let mut data_correct_upto: Option<u32> = None;
    loop {
        if data_correct_upto.is_none() && data.is_empty() {
            break Some(page);
        }

        if remaining.is_empty() {
            buf.truncate(block.page_size() * (block.page_count() - page) as usize);
            if buf.is_empty() {
                break data_correct_upto;
            }

            // Read errors are considered "needs erase"
            if block.read(page, &mut buf).is_err() {
                break None;
            }
            remaining = &buf;
        }

        let (page_content, rem) = remaining.split_at(block.page_size());
        remaining = rem;

        if data_correct_upto.is_none() {
            let cmp_len = std::cmp::min(page_content.len(), data.len());
            if page_content[..cmp_len] == data[..cmp_len] {
                data = &data[cmp_len..];
            } else {
                data_correct_upto = Some(page);
            }
        }

        // After a mismatch, the rest of the block must still be erased for a resume to work
        if data_correct_upto.is_some() && !page_content.is_erased() {
            break None;
        }

        page += 1;
    }
}

/// Bring a block's contents up to `data`, resuming from a partial write if possible.
fn update_raw_block<B: NandBlock>(block: &mut B, data: &[u8]) -> anyhow::Result<()> {
    let start_page = match check_raw_block(block, data) {
        None => {
            block.erase()?;
            0
        }
        Some(x) => x,
    };

    let page_size = block.page_size();
    let offset = start_page as usize * page_size;
    if offset >= data.len() {
        return Ok(());
    }

    // Pad the remainder out to a whole number of pages
    let mut tail = data[offset..].to_vec();
    tail.resize(tail.len().div_ceil(page_size) * page_size, 0xFF);
    block.program(start_page, &tail)
}

/// Write a raw image to the partition.
///
/// This operation is idempotent; blocks that already hold the right data are not touched.
///
/// The `skip_bad` parameter will cause bad blocks to be skipped over. If this is `false`,
/// encountering a bad block is an error.
pub fn write_raw_image<N: Nand, R: Read>(
    nand: &mut N,
    image: &mut R,
    skip_bad: bool,
) -> anyhow::Result<()> {
    let block_size = nand.get_layout().block_size();

    let mut data = Vec::with_capacity(block_size);
    let mut block_index: u32 = 0;
    loop {
        data.clear();
        image.read_to_vec(&mut data, block_size)?;
        if data.is_empty() {
            break Ok(());
        }

        'find_block_and_write: loop {
            anyhow::ensure!(
                block_index < nand.get_layout().blocks,
                "image does not fit in partition"
            );
            let block = nand.block(block_index)?;
            block_index += 1;

            if let Some(mut block) = block {
                for _ in 0..BLOCK_ATTEMPTS {
                    match update_raw_block(&mut block, &data) {
                        Ok(()) => break 'find_block_and_write,
                        Err(_) => block.erase()?,
                    }
                }

                log::warn!("block {} went bad while flashing", block_index - 1);
                block.mark_bad()?;
            }

            anyhow::ensure!(skip_bad, "unhandled bad block encountered");
        }
    }
}

/// Copy every good block of the partition into `out`, returning the number of bytes written.
///
/// Trailing blocks that are fully erased are left out of the image; restoring it leaves them
/// erased anyway.
pub fn dump_raw_image<N: Nand, W: Write>(nand: &mut N, out: &mut W) -> anyhow::Result<u64> {
    let layout = nand.get_layout();
    let mut buf = vec![0; layout.block_size()];

    let mut pending_erased: u64 = 0;
    let mut written: u64 = 0;
    for index in 0..layout.blocks {
        let Some(block) = nand.block(index)? else {
            log::debug!("skipping bad block {index}");
            continue;
        };
        block.read(0, &mut buf)?;

        if buf.is_erased() {
            pending_erased += 1;
            continue;
        }

        // Erased blocks in the middle of the image are part of it
        for _ in 0..pending_erased {
            out.write_all(&vec![0xFF; buf.len()])?;
            written += buf.len() as u64;
        }
        pending_erased = 0;

        out.write_all(&buf)?;
        written += buf.len() as u64;
    }

    out.flush()?;
    Ok(written)
}

/// Erase every good block of the partition, returning how many were erased.
pub fn erase_all<N: Nand>(nand: &mut N) -> anyhow::Result<u32> {
    let mut erased = 0;
    for index in 0..nand.get_layout().blocks {
        if let Some(mut block) = nand.block(index)? {
            if block.erase().is_err() {
                log::warn!("erase failed on block {index}, marking bad");
                block.mark_bad()?;
                continue;
            }
            erased += 1;
        }
    }
    Ok(erased)
}

/// Replace the whole partition with `image`. Blocks past the end of the image end up erased,
/// not holding whatever was flashed before.
pub fn flash_raw_image<N: Nand, R: Read>(nand: &mut N, image: &mut R) -> anyhow::Result<()> {
    let erased = erase_all(nand)?;
    log::debug!("erased {erased} blocks before flashing");
    write_raw_image(nand, image, true)
}

#[cfg(test)]
use super::{sim::SimNand, NandLayout};

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 6,
    pages_per_block: 4,
    bytes_per_page: 64,
};

#[test]
fn test_check_raw_block() -> anyhow::Result<()> {
    const LAYOUT: NandLayout = NandLayout {
        blocks: 1,
        pages_per_block: 43,
        bytes_per_page: 128,
    };

    let mut nand = SimNand::new(LAYOUT);
    let mut block = nand.block(0)?.unwrap();

    assert_eq!(check_raw_block(&block, &[]), Some(0));
    assert_eq!(check_raw_block(&block, &[0xFF, 0xFF]), Some(1));
    assert_eq!(check_raw_block(&block, &[0xFF, 0x7F]), Some(0));

    let mut test_data: [u8; 128 * 40] = std::array::from_fn(|i| match i / 128 {
        0..=9 => (i * 23) as u8,
        30..=39 => (i * 11) as u8,
        _ => 0xFF,
    });

    block.program(0, &test_data[..35 * 128])?;

    assert_eq!(check_raw_block(&block, &test_data[..128 * 5]), Some(5));
    assert_eq!(check_raw_block(&block, &test_data), Some(35));

    test_data[25 * 128] = 0x00;
    assert_eq!(check_raw_block(&block, &test_data), None);

    Ok(())
}

#[test]
fn test_write_then_dump() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let block_size = TEST_LAYOUT.block_size();

    // Two blocks of data with an erased block between them
    let mut image = vec![0x11u8; block_size];
    image.extend(vec![0xFF; block_size]);
    image.extend(vec![0x22u8; block_size / 2]);

    write_raw_image(&mut nand, &mut &image[..], false)?;

    let mut dumped = Vec::new();
    let len = dump_raw_image(&mut nand, &mut dumped)?;
    assert_eq!(len, 3 * block_size as u64);
    assert_eq!(&dumped[..2 * block_size], &image[..2 * block_size]);
    assert!(dumped[2 * block_size..][..block_size / 2]
        .iter()
        .all(|&x| x == 0x22));
    assert!(dumped[2 * block_size + block_size / 2..].is_erased());

    // Writing the same image again must not erase anything
    let erases = nand.erase_count(0);
    write_raw_image(&mut nand, &mut &image[..], false)?;
    assert_eq!(nand.erase_count(0), erases);

    Ok(())
}

#[test]
fn test_bad_blocks_are_skipped() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let block_size = TEST_LAYOUT.block_size();
    nand.set_bad(1);

    let image: Vec<u8> = (0..2 * block_size).map(|i| (i % 251) as u8).collect();
    assert!(write_raw_image(&mut nand, &mut &image[..], false).is_err());

    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.set_bad(1);
    write_raw_image(&mut nand, &mut &image[..], true)?;

    let mut dumped = Vec::new();
    dump_raw_image(&mut nand, &mut dumped)?;
    assert_eq!(dumped, image);

    Ok(())
}

#[test]
fn test_erase_all() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.set_bad(3);
    write_raw_image(&mut nand, &mut &[0x5Au8; 64][..], false)?;

    assert_eq!(erase_all(&mut nand)?, TEST_LAYOUT.blocks - 1);

    let mut dumped = Vec::new();
    assert_eq!(dump_raw_image(&mut nand, &mut dumped)?, 0);
    Ok(())
}

#[test]
fn test_image_too_large() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let image = vec![0u8; TEST_LAYOUT.block_size() * (TEST_LAYOUT.blocks as usize + 1)];
    assert!(write_raw_image(&mut nand, &mut &image[..], true).is_err());
}

#[test]
fn test_shorter_image_clears_the_tail() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let block_size = TEST_LAYOUT.block_size();

    flash_raw_image(&mut nand, &mut &vec![0x33u8; 4 * block_size][..])?;
    let short = vec![0x44u8; block_size + block_size / 2];
    flash_raw_image(&mut nand, &mut &short[..])?;

    let mut dumped = Vec::new();
    assert_eq!(dump_raw_image(&mut nand, &mut dumped)?, 2 * block_size as u64);
    assert_eq!(&dumped[..short.len()], &short[..]);
    assert!(dumped[short.len()..].is_erased());
    Ok(())
}
