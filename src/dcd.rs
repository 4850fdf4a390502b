//! Device Configuration Data: fixed-size binary blob storage on a pair of
//! flash sectors.
//!
//! Exactly one sector holds the committed image at any observable time. A
//! write rebuilds the full region in the alternate sector, seals it, and only
//! then clears the old sector's seal, so an interruption at any byte leaves
//! the old image untouched or the new one fully committed.

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    DCD_FOOTER_SIZE, DCD_HEADER_SIZE, LEGACY_PAYLOAD_OFFSET, LEGACY_SIGNATURE, SEAL_CLEARED,
    SEAL_INIT, SEAL_VALID, WATERMARK,
};
use crate::store::{Sector, copy_region};
#[cfg(feature = "defmt")]
use defmt::trace;

pub struct Dcd<T: Platform> {
    store: T,
    sectors: [Sector; 2],
}

impl<T: Platform> Dcd<T> {
    /// Binds the engine to its two backing sectors and imports a legacy-format
    /// image if one is found, so data written by pre-CRC firmware survives the
    /// upgrade.
    ///
    /// Both sectors must have the same size (the CRC footer is addressed from
    /// the sector end) and the flash must be byte-programmable.
    pub fn new(store: T, sector0: Sector, sector1: Sector) -> Result<Self, Error> {
        if T::WRITE_SIZE != 1 {
            return Err(Error::InvalidSectorLayout);
        }
        if sector0.size != sector1.size || sector0.size <= DCD_HEADER_SIZE + DCD_FOOTER_SIZE {
            return Err(Error::InvalidSectorLayout);
        }
        let mut dcd = Self {
            store,
            sectors: [sector0, sector1],
        };
        dcd.migrate_legacy()?;
        Ok(dcd)
    }

    /// Number of logical bytes the region stores.
    pub fn length(&self) -> usize {
        self.sectors[0].size - DCD_HEADER_SIZE - DCD_FOOTER_SIZE
    }

    /// True once either sector holds a committed image.
    pub fn is_initialized(&self) -> bool {
        self.current().is_some()
    }

    /// Borrows the committed bytes from `offset` to the end of the region.
    ///
    /// Bytes never written read as `0xFF`. The slice aliases flash; drop it
    /// before the next mutating call on this engine.
    pub fn read(&self, offset: usize) -> &[u8] {
        let length = self.length();
        let offset = core::cmp::min(offset, length);
        let sector = self.sectors[self.current().unwrap_or(0)];
        self.store.data_at(
            sector.base + (DCD_HEADER_SIZE + offset) as u32,
            length - offset,
        )
    }

    /// Replaces `data.len()` bytes at `offset` by committing a full copy of
    /// the region to the alternate sector.
    ///
    /// On any failure the previously committed sector is untouched and still
    /// selected; the caller may retry.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Error> {
        let length = self.length();
        if offset >= length {
            return Err(Error::InvalidOffset);
        }
        if offset + data.len() > length {
            return Err(Error::InvalidLength);
        }

        #[cfg(feature = "defmt")]
        trace!("dcd: write offset={} len={}", offset, data.len());

        #[cfg(feature = "debug-logs")]
        println!("dcd: write offset={offset} len={}", data.len());

        let current = match self.current() {
            Some(idx) => idx,
            None => {
                self.initialize_sector(0)?;
                0
            }
        };

        // unchanged content needs no sector swap
        let payload = self.sectors[current].base + DCD_HEADER_SIZE as u32;
        if self.store.data_at(payload + offset as u32, data.len()) == data {
            return Ok(());
        }

        let other = 1 - current;
        self.rebuild(other, current, offset, data)?;

        // the new image is sealed; retire the old sector
        self.write_word(self.sectors[current].base + 4, SEAL_CLEARED)
    }

    /// Erases both sectors. The next `write` starts from a blank region.
    pub fn erase(&mut self) -> Result<(), Error> {
        for idx in 0..2 {
            let sector = self.sectors[idx];
            if !self.store.is_erased(sector.base, sector.size) {
                self.store
                    .erase_sector(sector.base)
                    .map_err(|_| Error::FlashEraseFailed)?;
            }
            debug_assert_eq!(self.header_word(idx, 4), SEAL_INIT);
        }
        Ok(())
    }

    /// Builds a complete image in `dst` in address order: watermark, unchanged
    /// prefix from `src`, the caller's bytes, unchanged suffix, CRC footer,
    /// seal. `dst` only becomes selectable with the final seal write, so an
    /// interruption anywhere before that leaves `src` authoritative.
    fn rebuild(&mut self, dst: usize, src: usize, offset: usize, data: &[u8]) -> Result<(), Error> {
        let length = self.length();
        let dst_sector = self.sectors[dst];
        let src_payload = self.sectors[src].base + DCD_HEADER_SIZE as u32;
        let dst_payload = dst_sector.base + DCD_HEADER_SIZE as u32;

        if !self.store.is_erased(dst_sector.base, dst_sector.size) {
            self.store
                .erase_sector(dst_sector.base)
                .map_err(|_| Error::FlashEraseFailed)?;
        }
        self.write_word(dst_sector.base, WATERMARK)?;

        copy_region(&mut self.store, src_payload, dst_payload, offset)?;
        if !data.is_empty() {
            self.store
                .write(dst_payload + offset as u32, data)
                .map_err(|_| Error::FlashWriteFailed)?;
        }
        let tail = offset + data.len();
        copy_region(
            &mut self.store,
            src_payload + tail as u32,
            dst_payload + tail as u32,
            length - tail,
        )?;

        if self.store.data_at(dst_payload + offset as u32, data.len()) != data {
            return Err(Error::VerificationFailed);
        }

        let crc = self.payload_crc(dst);
        self.write_word(dst_sector.base + (DCD_HEADER_SIZE + length) as u32, crc)?;
        if self.stored_crc(dst) != crc {
            return Err(Error::VerificationFailed);
        }

        self.write_word(dst_sector.base + 4, SEAL_VALID)
    }

    /// Entry point when no sector is valid at all: a sealed sector with an
    /// erased (all-`0xFF`) payload.
    fn initialize_sector(&mut self, idx: usize) -> Result<(), Error> {
        let sector = self.sectors[idx];
        if !self.store.is_erased(sector.base, sector.size) {
            self.store
                .erase_sector(sector.base)
                .map_err(|_| Error::FlashEraseFailed)?;
        }
        self.write_word(sector.base, WATERMARK)?;
        let crc = self.payload_crc(idx);
        self.write_word(sector.base + (DCD_HEADER_SIZE + self.length()) as u32, crc)?;
        self.write_word(sector.base + 4, SEAL_VALID)
    }

    /// Detects the pre-CRC layout and re-imports its payload into the current
    /// format. Runs once, at construction, and only when no current-format
    /// sector is valid.
    fn migrate_legacy(&mut self) -> Result<(), Error> {
        if self.current().is_some() {
            return Ok(());
        }
        for idx in [1, 0] {
            if !self.is_legacy(idx) {
                continue;
            }

            #[cfg(feature = "defmt")]
            trace!("dcd: importing legacy sector {}", idx);

            let other = 1 - idx;
            let legacy = self.sectors[idx];
            let dst = self.sectors[other];

            if !self.store.is_erased(dst.base, dst.size) {
                self.store
                    .erase_sector(dst.base)
                    .map_err(|_| Error::FlashEraseFailed)?;
            }
            self.write_word(dst.base, WATERMARK)?;
            copy_region(
                &mut self.store,
                legacy.base + LEGACY_PAYLOAD_OFFSET as u32,
                dst.base + DCD_HEADER_SIZE as u32,
                legacy.size - LEGACY_PAYLOAD_OFFSET,
            )?;
            let crc = self.payload_crc(other);
            self.write_word(dst.base + (DCD_HEADER_SIZE + self.length()) as u32, crc)?;
            self.write_word(dst.base + 4, SEAL_VALID)?;
            self.write_word(legacy.base + 4, SEAL_CLEARED)?;
            return Ok(());
        }
        Ok(())
    }

    /// sector1 wins whenever both carry a committed image; that matches the
    /// layouts earlier firmware left on flash mid-swap.
    fn current(&self) -> Option<usize> {
        if self.is_valid(1) {
            Some(1)
        } else if self.is_valid(0) {
            Some(0)
        } else {
            None
        }
    }

    fn is_valid(&self, idx: usize) -> bool {
        self.header_sealed(idx) && self.stored_crc(idx) == self.payload_crc(idx)
    }

    /// A sealed header with the legacy signature and no matching footer is an
    /// old-format sector; the CRC is what disambiguates it from a current
    /// payload that happens to start with the same two bytes.
    fn is_legacy(&self, idx: usize) -> bool {
        let sector = self.sectors[idx];
        if sector.size <= LEGACY_PAYLOAD_OFFSET {
            return false;
        }
        self.header_sealed(idx)
            && *self.store.data_at(sector.base + DCD_HEADER_SIZE as u32, 2) == LEGACY_SIGNATURE
    }

    fn header_sealed(&self, idx: usize) -> bool {
        self.header_word(idx, 0) == WATERMARK && self.header_word(idx, 4) == SEAL_VALID
    }

    fn header_word(&self, idx: usize, at: usize) -> u32 {
        let raw = self.store.data_at(self.sectors[idx].base + at as u32, 4);
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    fn stored_crc(&self, idx: usize) -> u32 {
        self.header_word(idx, DCD_HEADER_SIZE + self.length())
    }

    fn payload_crc(&self, idx: usize) -> u32 {
        let sector = self.sectors[idx];
        T::crc32(
            u32::MAX,
            self.store
                .data_at(sector.base + DCD_HEADER_SIZE as u32, self.length()),
        )
    }

    fn write_word(&mut self, address: u32, word: u32) -> Result<(), Error> {
        self.store
            .write(address, &word.to_le_bytes())
            .map_err(|_| Error::FlashWriteFailed)
    }
}
