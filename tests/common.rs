#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use norstore::{Crc, Store};

/// RAM-backed NOR flash double. Byte-programmable (like STM32F2 internal
/// flash), with an explicit sector map so asymmetric sector pairs can be
/// modeled. Writes AND into the existing contents; only an erase sets bits.
pub struct Flash {
    pub buf: Vec<u8>,
    pub sectors: Vec<(u32, usize)>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    /// Marginal-erase emulation: writes into this region are silently
    /// dropped (the driver reports success) until the region is re-erased.
    pub weak: Option<(u32, usize)>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(sectors: &[(u32, usize)]) -> Self {
        let extent = sectors
            .iter()
            .map(|&(base, size)| base as usize + size)
            .max()
            .unwrap();
        Self {
            buf: vec![0xFFu8; extent],
            sectors: sectors.to_vec(),
            fail_after_operation: usize::MAX,
            operations: Vec::new(),
            weak: None,
        }
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    fn faulted(&self) -> bool {
        self.operations.len() >= self.fail_after_operation
    }

    fn in_weak_region(&self, offset: u32, len: usize) -> bool {
        match self.weak {
            Some((base, size)) => {
                offset < base + size as u32 && offset as usize + len > base as usize
            }
            None => false,
        }
    }

    fn do_erase(&mut self, base: u32, size: usize) -> Result<(), FlashError> {
        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Erase { offset: base, len: size });

        // a real erase restores the full charge level
        if let Some((weak_base, weak_size)) = self.weak
            && base < weak_base + weak_size as u32
            && base as usize + size > weak_base as usize
        {
            self.weak = None;
        }

        self.buf[base as usize..base as usize + size].fill(0xFF);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = 4096;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        // the engines erase through Store::erase_sector; direct ranged
        // erases must still land on a declared sector
        assert!(
            self.sectors
                .iter()
                .any(|&(base, size)| base == from && base + size as u32 == to),
            "erase range does not match a declared sector"
        );
        self.do_erase(from, (to - from) as usize)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(!bytes.is_empty());

        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        if self.in_weak_region(offset, bytes.len()) {
            // marginal erase: the program operation reports success but the
            // cells never take the charge
            return Ok(());
        }

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl Store for Flash {
    fn erase_sector(&mut self, address: u32) -> Result<(), Self::Error> {
        let &(base, size) = self
            .sectors
            .iter()
            .find(|&&(base, size)| address >= base && address < base + size as u32)
            .expect("address outside any declared sector");
        self.do_erase(base, size)
    }

    fn data_at(&self, address: u32, len: usize) -> &[u8] {
        // memory-mapped read path: no driver call, no fault injection
        let address = address as usize;
        &self.buf[address..address + len]
    }
}

impl Crc for Flash {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        unsafe { libz_sys::crc32(init as u64, data.as_ptr(), data.len() as u32) as u32 }
    }
}
