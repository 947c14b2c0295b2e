//! An in-memory MTD partition for exercising the imaging code without hardware.

use super::{Nand, NandBlock, NandLayout, PageUtil};

use anyhow::ensure;

#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

#[derive(Debug, Clone)]
pub struct SimBlock {
    /// Programmed bytes; only ever appended to between erases
    data: Vec<u8>,
    page_count: u32,
    page_size: usize,
    marked_bad: bool,
    erase_count: u32,
}

impl SimNand {
    pub fn new(layout: NandLayout) -> Self {
        let block = SimBlock {
            data: Vec::new(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
            erase_count: 0,
        };
        Self {
            blocks: vec![block; layout.blocks as usize].into_boxed_slice(),
            layout,
        }
    }

    /// Mark a block bad behind the imaging code's back, as the factory would
    pub fn set_bad(&mut self, index: u32) {
        self.blocks[index as usize].marked_bad = true;
    }

    /// How many times the given block has been erased
    pub fn erase_count(&self, index: u32) -> u32 {
        self.blocks[index as usize].erase_count
    }
}

impl SimBlock {
    fn page_range(&self, index: u32, len: usize) -> anyhow::Result<usize> {
        ensure!(len == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");
        Ok(index as usize * self.page_size)
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        for (page, chunk) in (start_page..).zip(content.chunks_mut(self.page_size)) {
            let begin = self.page_range(page, chunk.len())?;
            match self.data.get(begin..begin + self.page_size) {
                Some(bytes) => chunk.copy_from_slice(bytes),
                None => chunk.fill(0xFF),
            }
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        for (page, chunk) in (start_page..).zip(content.chunks(self.page_size)) {
            let begin = self.page_range(page, chunk.len())?;
            ensure!(begin >= self.data.len(), "write in already-written area");
            if !chunk.is_erased() {
                self.data.resize(begin, 0xFF);
                self.data.extend_from_slice(chunk);
            }
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        self.data.clear();
        self.erase_count += 1;
        Ok(())
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        self.data.clear();
        self.marked_bad = true;
        Ok(())
    }
}
