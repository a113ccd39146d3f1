//! Abstractions and code to access NAND flash

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

use crate::layout::NandMap;

#[cfg(target_os = "linux")]
pub mod mtd;

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

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// Bytes per erase block
    pub fn block_size(&self) -> u64 {
        self.pages_per_block as u64 * self.bytes_per_page as u64
    }

    /// Bytes in the whole device
    pub fn total_size(&self) -> u64 {
        self.blocks as u64 * self.block_size()
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// Represents a NAND flash device (in practice, one MTD partition of it)
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `index` must be greater than any previously-written index, or in other words,
    /// writing a page makes it and all skipped pages nonwritable. This is to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;
}

/// A set of MTD devices, addressed by their index (the N in `/dev/mtdN`)
pub trait MtdSet {
    type Device<'a>: Nand + 'a
    where
        Self: 'a;

    /// Open MTD device `index`
    fn open(&mut self, index: u32) -> anyhow::Result<Self::Device<'_>>;
}

/// Hardware failure modes that can be injected into a `SimNand` block
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimFault {
    /// Erasing the block reports an error
    Erase,

    /// Programming any page of the block reports an error
    Program,
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// Injected hardware failure, if any
    fault: Option<SimFault>,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let size = self.layout.block_size() as usize;
        let mut buf = vec![0; size];

        for block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            block.marked_bad = false;
            block.data.clear();
            block.write_page_run(0, &buf)?;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let size = self.layout.block_size() as usize;
        let mut buf = vec![0; size];

        for block in 0..self.layout.blocks {
            match self.block(block)? {
                None => buf.fill(0xBD),
                Some(block) => block.read(0, &mut buf)?,
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Mark a block bad, the way a factory bad block table would
    pub fn mark_bad(&mut self, index: u32) -> anyhow::Result<()> {
        let block = self.raw_block(index)?;
        block.data.clear();
        block.marked_bad = true;
        Ok(())
    }

    /// Make all future operations of the given kind fail on a block
    pub fn inject_fault(&mut self, index: u32, fault: SimFault) -> anyhow::Result<()> {
        self.raw_block(index)?.fault = Some(fault);
        Ok(())
    }

    /// Remove any injected failure from a block
    pub fn clear_fault(&mut self, index: u32) -> anyhow::Result<()> {
        self.raw_block(index)?.fault = None;
        Ok(())
    }

    fn raw_block(&mut self, index: u32) -> anyhow::Result<&mut SimBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
            fault: None,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn write_page_run(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks(self.page_size) {
            self.write_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.raw_block(index)
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
        let mut page = start_page;
        for chunk in content.chunks_mut(self.page_size()) {
            self.read_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        if self.fault == Some(SimFault::Program) {
            bail!("simulated program failure");
        }
        self.write_page_run(start_page, content)
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        if self.fault == Some(SimFault::Erase) {
            bail!("simulated erase failure");
        }
        self.data.clear();

        Ok(())
    }
}

/// A whole simulated chip, carved into MTD devices according to a `NandMap`
///
/// The chip outlives any particular carving, so the same bytes can be viewed through the factory
/// numbering and then, "after a reboot", through the final numbering.
#[derive(Debug, Clone)]
pub struct SimMtdSet {
    chip: SimNand,

    /// MTD index => (first block, block count)
    parts: BTreeMap<u32, (u32, u32)>,
}

impl SimMtdSet {
    pub fn new(chip: SimNand, map: &NandMap) -> anyhow::Result<Self> {
        let block_size = chip.get_layout().block_size();
        let mut parts = BTreeMap::new();

        for part in map.partitions {
            ensure!(
                part.offset % block_size == 0 && part.size % block_size == 0,
                "partition {} is not erase-block aligned",
                part.name
            );
            ensure!(
                part.offset + part.size <= chip.get_layout().total_size(),
                "partition {} runs past the end of the chip",
                part.name
            );

            let first = (part.offset / block_size) as u32;
            let count = (part.size / block_size) as u32;
            parts.insert(part.mtd, (first, count));
        }

        Ok(Self { chip, parts })
    }

    pub fn chip(&self) -> &SimNand {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut SimNand {
        &mut self.chip
    }

    /// Give back the chip, e.g. to re-carve it with another map
    pub fn into_chip(self) -> SimNand {
        self.chip
    }

    /// Absolute block index of block `index` within MTD device `mtd`
    pub fn chip_block(&self, mtd: u32, index: u32) -> Option<u32> {
        let &(first, count) = self.parts.get(&mtd)?;
        (index < count).then_some(first + index)
    }
}

/// One MTD device of a `SimMtdSet`
#[derive(Debug)]
pub struct SimPartition<'a> {
    chip: &'a mut SimNand,
    first: u32,
    blocks: u32,
}

impl MtdSet for SimMtdSet {
    type Device<'a> = SimPartition<'a>;

    fn open(&mut self, index: u32) -> anyhow::Result<SimPartition<'_>> {
        let Some(&(first, blocks)) = self.parts.get(&index) else {
            bail!("no such MTD device: mtd{index}");
        };

        Ok(SimPartition {
            chip: &mut self.chip,
            first,
            blocks,
        })
    }
}

impl Nand for SimPartition<'_> {
    type Block<'b> = &'b mut SimBlock where Self: 'b;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        ensure!(index < self.blocks, "block {index} out of range");
        self.chip.block(self.first + index)
    }

    fn get_layout(&self) -> NandLayout {
        NandLayout {
            blocks: self.blocks,
            ..self.chip.get_layout()
        }
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.mark_bad(0).unwrap();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8)).unwrap();

    let mut buf = vec![0u8; nand.get_layout().block_size() as usize];

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut buf).unwrap();

    assert!(buf.iter().all(|&x| x == 0x55u8));
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0x11u8; TEST_LAYOUT.bytes_per_page];

    nand.inject_fault(1, SimFault::Program).unwrap();
    nand.inject_fault(2, SimFault::Erase).unwrap();

    assert!(nand.block(1).unwrap().unwrap().program(0, &page).is_err());
    assert!(nand.block(1).unwrap().unwrap().erase().is_ok());
    assert!(nand.block(2).unwrap().unwrap().erase().is_err());
    assert!(nand.block(2).unwrap().unwrap().program(0, &page).is_ok());

    nand.clear_fault(1).unwrap();
    assert!(nand.block(1).unwrap().unwrap().program(0, &page).is_ok());
}

#[test]
fn test_layout_parse() {
    let layout: NandLayout = "2048x64x2048".parse().unwrap();
    assert_eq!(layout.block_size(), 0x20000);
    assert_eq!(layout.total_size(), 0x1000_0000);
    assert!("2048x64".parse::<NandLayout>().is_err());
}

#[test]
fn test_sim_partition_view() {
    use crate::layout::{NandMap, PartitionSpec};

    static MAP: NandMap = NandMap {
        name: "test",
        partitions: &[
            PartitionSpec::new("first", 0, 0x0000, 0x2000),
            PartitionSpec::new("second", 1, 0x2000, 0x6000),
        ],
    };

    let mut mtds = SimMtdSet::new(SimNand::new(TEST_LAYOUT), &MAP).unwrap();
    let page = vec![0x42u8; TEST_LAYOUT.bytes_per_page];

    {
        let mut second = mtds.open(1).unwrap();
        assert_eq!(second.get_layout().blocks, 6);
        assert!(second.block(6).is_err());
        second.block(0).unwrap().unwrap().program(0, &page).unwrap();
    }

    // Block 0 of mtd1 is block 2 of the chip
    assert_eq!(mtds.chip_block(1, 0), Some(2));
    let mut buf = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let chip = mtds.chip_mut();
    chip.block(2).unwrap().unwrap().read(0, &mut buf).unwrap();
    assert_eq!(buf, page);
    assert!(mtds.open(2).is_err());
}
