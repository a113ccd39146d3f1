//! This module implements logic to erase, write, and read back raw blobs on MTD devices.
//!
//! Offsets are byte offsets within an MTD device and are translated the way U-Boot's `nand`
//! commands translate them: starting at the block containing the offset, blocks that are marked
//! bad are skipped over. This keeps what we write where the bootloader will look for it.

use std::ops::Range;

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::error::MigrateError;
use crate::nand::{MtdSet, Nand, NandBlock, NandLayout};
use crate::util::{align_up, pad_erased};

/// Raw access to a set of MTD devices, addressed by index
pub trait Flash {
    /// Erase `len` bytes of `device`, starting at `offset`; both must be erase-block aligned
    fn erase_region(&mut self, device: u32, offset: u64, len: u64) -> Result<(), MigrateError>;

    /// Erase the whole of `device`
    fn erase_partition(&mut self, device: u32) -> Result<(), MigrateError>;

    /// Program `payload` at a page-aligned `offset`, padding the last page with 0xFF
    ///
    /// The target area must have been erased beforehand.
    fn write_at(&mut self, device: u32, offset: u64, payload: &[u8]) -> Result<(), MigrateError>;

    /// Fill `buf` with the content of `device` starting at a page-aligned `offset`
    fn read_at(&mut self, device: u32, offset: u64, buf: &mut [u8]) -> Result<(), MigrateError>;

    /// The geometry of `device`, and which of its erase blocks are usable
    fn good_blocks(&mut self, device: u32) -> Result<GoodBlocks, MigrateError>;
}

/// The erase blocks of one MTD device that are not marked bad
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GoodBlocks {
    pub size: u64,
    pub block_size: u64,

    /// Byte offset of each good block, ascending
    pub offsets: Vec<u64>,
}

impl GoodBlocks {
    /// How many bytes fit on the device once bad blocks are skipped
    pub fn capacity(&self) -> u64 {
        self.offsets.len() as u64 * self.block_size
    }
}

/// The `Flash` implementation over real (or simulated) NAND
#[derive(Debug)]
pub struct FlashWriter<S> {
    mtds: S,
    verify: bool,
}

impl<S: MtdSet> FlashWriter<S> {
    pub fn new(mtds: S) -> Self {
        Self {
            mtds,
            verify: false,
        }
    }

    /// Read back and compare everything written
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn mtds(&self) -> &S {
        &self.mtds
    }

    pub fn mtds_mut(&mut self) -> &mut S {
        &mut self.mtds
    }

    pub fn into_inner(self) -> S {
        self.mtds
    }

    fn erase_blocks(&mut self, device: u32, offset: u64, len: u64) -> Result<(), MigrateError> {
        let fail = |offset, source| MigrateError::FlashEraseFailed {
            device,
            offset,
            source,
        };

        let mut nand = self.mtds.open(device).map_err(|e| fail(offset, e))?;
        let layout = nand.get_layout();
        let block_size = layout.block_size();

        if offset % block_size != 0 || len % block_size != 0 {
            return Err(fail(offset, anyhow!("region is not erase-block aligned")));
        }
        if offset + len > layout.total_size() {
            return Err(fail(offset, anyhow!("region runs past the end of the device")));
        }

        let first = (offset / block_size) as u32;
        let count = (len / block_size) as u32;
        for index in first..first + count {
            let block_offset = index as u64 * block_size;
            match nand.block(index).map_err(|e| fail(block_offset, e))? {
                Some(mut block) => block.erase().map_err(|e| fail(block_offset, e))?,
                None => warn!("mtd{device}: skipping bad block at {block_offset:#x}"),
            }
        }

        Ok(())
    }
}

/// Walk the good blocks of `nand` from byte `offset` onward, calling `f` with each block, the
/// page within it, and the range of the buffer that lands there.
fn for_each_span<N: Nand>(
    nand: &mut N,
    device: u32,
    offset: u64,
    len: usize,
    mut f: impl FnMut(&mut dyn NandBlock, u32, Range<usize>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let layout: NandLayout = nand.get_layout();
    let block_size = layout.block_size();
    let page_size = layout.bytes_per_page as u64;

    anyhow::ensure!(offset % page_size == 0, "offset {offset:#x} is not page-aligned");
    anyhow::ensure!(
        offset + len as u64 <= layout.total_size(),
        "{len:#x} bytes at {offset:#x} run past the end of the device"
    );

    let mut index = (offset / block_size) as u32;
    let mut page = ((offset % block_size) / page_size) as u32;
    let mut done = 0;
    while done < len {
        anyhow::ensure!(
            index < layout.blocks,
            "ran out of good blocks with {:#x} bytes left",
            len - done
        );

        match nand.block(index)? {
            Some(mut block) => {
                let room = (layout.pages_per_block - page) as usize * layout.bytes_per_page;
                let span = done..std::cmp::min(len, done + room);
                done = span.end;
                f(&mut block, page, span)?;
            }
            None => warn!(
                "mtd{device}: skipping bad block at {:#x}",
                index as u64 * block_size
            ),
        }

        index += 1;
        page = 0;
    }

    Ok(())
}

impl<S: MtdSet> Flash for FlashWriter<S> {
    fn erase_region(&mut self, device: u32, offset: u64, len: u64) -> Result<(), MigrateError> {
        debug!("erase mtd{device} {offset:#x}+{len:#x}");
        self.erase_blocks(device, offset, len)
    }

    fn erase_partition(&mut self, device: u32) -> Result<(), MigrateError> {
        let size = self
            .mtds
            .open(device)
            .map(|nand| nand.get_layout().total_size())
            .map_err(|source| MigrateError::FlashEraseFailed {
                device,
                offset: 0,
                source,
            })?;
        debug!("erase mtd{device} (whole device, {size:#x} bytes)");
        self.erase_blocks(device, 0, size)
    }

    fn write_at(&mut self, device: u32, offset: u64, payload: &[u8]) -> Result<(), MigrateError> {
        debug!("write mtd{device} {offset:#x}+{:#x}", payload.len());
        let fail = |source| MigrateError::FlashWriteFailed {
            device,
            offset,
            len: payload.len(),
            source,
        };

        let mut nand = self.mtds.open(device).map_err(fail)?;
        let padded = pad_erased(payload, nand.get_layout().bytes_per_page);
        for_each_span(&mut nand, device, offset, padded.len(), |block, page, span| {
            block.program(page, &padded[span])
        })
        .map_err(fail)?;
        drop(nand);

        if self.verify {
            let mut readback = vec![0u8; padded.len()];
            self.read_at(device, offset, &mut readback)?;
            if readback != padded {
                return Err(MigrateError::FlashVerifyFailed { device, offset });
            }
        }

        Ok(())
    }

    fn read_at(&mut self, device: u32, offset: u64, buf: &mut [u8]) -> Result<(), MigrateError> {
        let len = buf.len();
        let fail = |source| MigrateError::FlashReadFailed {
            device,
            offset,
            len,
            source,
        };

        let mut nand = self.mtds.open(device).map_err(fail)?;
        let page_size = nand.get_layout().bytes_per_page;
        let mut padded = vec![0u8; align_up(len as u64, page_size as u64) as usize];
        for_each_span(&mut nand, device, offset, padded.len(), |block, page, span| {
            block.read(page, &mut padded[span])
        })
        .map_err(fail)?;

        buf.copy_from_slice(&padded[..len]);
        Ok(())
    }

    fn good_blocks(&mut self, device: u32) -> Result<GoodBlocks, MigrateError> {
        let fail = |source| MigrateError::FlashReadFailed {
            device,
            offset: 0,
            len: 0,
            source,
        };

        let mut nand = self.mtds.open(device).map_err(fail)?;
        let layout = nand.get_layout();
        let block_size = layout.block_size();

        let mut offsets = Vec::with_capacity(layout.blocks as usize);
        for index in 0..layout.blocks {
            if nand.block(index).map_err(fail)?.is_some() {
                offsets.push(index as u64 * block_size);
            }
        }

        Ok(GoodBlocks {
            size: layout.total_size(),
            block_size,
            offsets,
        })
    }
}

/// One flash operation, as seen by `RecordingFlash`
#[cfg(test)]
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FlashOp {
    Erase { device: u32, offset: u64, len: u64 },
    ErasePartition { device: u32 },
    Write { device: u32, offset: u64, len: usize },
}

/// A `Flash` that logs every destructive operation before passing it on
#[cfg(test)]
#[derive(Debug)]
pub struct RecordingFlash<F> {
    pub inner: F,
    pub ops: Vec<FlashOp>,
}

#[cfg(test)]
impl<F: Flash> RecordingFlash<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            ops: Vec::new(),
        }
    }

    /// Position of the first recorded op matching `pred`
    pub fn position(&self, pred: impl Fn(&FlashOp) -> bool) -> Option<usize> {
        self.ops.iter().position(pred)
    }
}

#[cfg(test)]
impl<F: Flash> Flash for RecordingFlash<F> {
    fn erase_region(&mut self, device: u32, offset: u64, len: u64) -> Result<(), MigrateError> {
        self.ops.push(FlashOp::Erase {
            device,
            offset,
            len,
        });
        self.inner.erase_region(device, offset, len)
    }

    fn erase_partition(&mut self, device: u32) -> Result<(), MigrateError> {
        self.ops.push(FlashOp::ErasePartition { device });
        self.inner.erase_partition(device)
    }

    fn write_at(&mut self, device: u32, offset: u64, payload: &[u8]) -> Result<(), MigrateError> {
        self.ops.push(FlashOp::Write {
            device,
            offset,
            len: payload.len(),
        });
        self.inner.write_at(device, offset, payload)
    }

    fn read_at(&mut self, device: u32, offset: u64, buf: &mut [u8]) -> Result<(), MigrateError> {
        self.inner.read_at(device, offset, buf)
    }

    fn good_blocks(&mut self, device: u32) -> Result<GoodBlocks, MigrateError> {
        self.inner.good_blocks(device)
    }
}

#[cfg(test)]
mod test_support {
    use crate::layout::{NandMap, PartitionSpec};
    use crate::nand::{NandLayout, SimMtdSet, SimNand};

    pub const LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 4,
        bytes_per_page: 64,
    };

    pub static MAP: NandMap = NandMap {
        name: "flash-test",
        partitions: &[
            PartitionSpec::new("small", 0, 0x000, 0x200),
            PartitionSpec::new("large", 1, 0x200, 0x600),
        ],
    };

    pub fn mtds() -> SimMtdSet {
        SimMtdSet::new(SimNand::new(LAYOUT), &MAP).unwrap()
    }
}

#[test]
fn test_write_read_padded() {
    let mut flash = FlashWriter::new(test_support::mtds()).verify(true);

    flash.erase_partition(1).unwrap();
    flash.write_at(1, 0x40, &[0xA5; 100]).unwrap();

    let mut buf = [0u8; 0x100];
    flash.read_at(1, 0, &mut buf).unwrap();
    assert!(buf[..0x40].iter().all(|&b| b == 0xFF));
    assert!(buf[0x40..0x40 + 100].iter().all(|&b| b == 0xA5));
    assert!(buf[0x40 + 100..].iter().all(|&b| b == 0xFF));
}

#[test]
fn test_write_spans_blocks() {
    let mut flash = FlashWriter::new(test_support::mtds());
    let data: Vec<u8> = (0..0x180).map(|i| i as u8).collect();

    flash.write_at(1, 0x80, &data).unwrap();

    let mut buf = vec![0u8; data.len()];
    flash.read_at(1, 0x80, &mut buf).unwrap();
    assert_eq!(buf, data);
}

#[test]
fn test_write_skips_bad_blocks() {
    let mut mtds = test_support::mtds();
    let bad = mtds.chip_block(1, 1).unwrap();
    mtds.chip_mut().mark_bad(bad).unwrap();

    let mut flash = FlashWriter::new(mtds);
    let data = vec![0x3Cu8; 0x300];
    flash.erase_partition(1).unwrap();
    flash.write_at(1, 0, &data).unwrap();

    let mut buf = vec![0u8; data.len()];
    flash.read_at(1, 0, &mut buf).unwrap();
    assert_eq!(buf, data);

    // The second logical block landed on the third physical one
    let mut page = vec![0u8; test_support::LAYOUT.bytes_per_page];
    let chip_block = flash.mtds().chip_block(1, 2).unwrap();
    flash
        .mtds_mut()
        .chip_mut()
        .block(chip_block)
        .unwrap()
        .unwrap()
        .read(0, &mut page)
        .unwrap();
    assert!(page.iter().all(|&b| b == 0x3C));
}

#[test]
fn test_good_blocks() {
    let mut mtds = test_support::mtds();
    let bad = mtds.chip_block(1, 2).unwrap();
    mtds.chip_mut().mark_bad(bad).unwrap();
    let mut flash = FlashWriter::new(mtds);

    let good = flash.good_blocks(1).unwrap();
    assert_eq!(good.size, 0x600);
    assert_eq!(good.block_size, 0x100);
    assert_eq!(good.offsets, [0x000, 0x100, 0x300, 0x400, 0x500]);
    assert_eq!(good.capacity(), 0x500);

    assert_eq!(flash.good_blocks(0).unwrap().capacity(), 0x200);
    assert!(matches!(
        flash.good_blocks(7),
        Err(MigrateError::FlashReadFailed { device: 7, .. })
    ));
}

#[test]
fn test_write_bounds_and_alignment() {
    let mut flash = FlashWriter::new(test_support::mtds());

    assert!(matches!(
        flash.write_at(0, 0x10, &[0]),
        Err(MigrateError::FlashWriteFailed { device: 0, .. })
    ));
    assert!(matches!(
        flash.write_at(0, 0x1C0, &[0; 0x41]),
        Err(MigrateError::FlashWriteFailed { .. })
    ));
    assert!(matches!(
        flash.write_at(7, 0, &[0]),
        Err(MigrateError::FlashWriteFailed { device: 7, .. })
    ));
    assert!(matches!(
        flash.erase_region(1, 0x40, 0x100),
        Err(MigrateError::FlashEraseFailed { .. })
    ));
}

#[test]
fn test_write_needs_erase() {
    let mut flash = FlashWriter::new(test_support::mtds());
    flash.write_at(0, 0, &[1; 0x40]).unwrap();
    assert!(flash.write_at(0, 0, &[2; 0x40]).is_err());

    flash.erase_region(0, 0, 0x100).unwrap();
    flash.write_at(0, 0, &[2; 0x40]).unwrap();
}

#[test]
fn test_injected_faults() {
    use crate::nand::SimFault;

    let mut mtds = test_support::mtds();
    let chip_block = mtds.chip_block(1, 0).unwrap();
    mtds.chip_mut()
        .inject_fault(chip_block, SimFault::Erase)
        .unwrap();
    let mut flash = FlashWriter::new(mtds);

    assert!(matches!(
        flash.erase_partition(1),
        Err(MigrateError::FlashEraseFailed {
            device: 1,
            offset: 0,
            ..
        })
    ));

    flash
        .mtds_mut()
        .chip_mut()
        .inject_fault(chip_block, SimFault::Program)
        .unwrap();
    assert!(matches!(
        flash.write_at(1, 0, &[0; 4]),
        Err(MigrateError::FlashWriteFailed { device: 1, .. })
    ));
}
