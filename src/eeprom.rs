//! Byte-addressable EEPROM emulation on two flash pages.
//!
//! Each page is an append-only log of `(index, value)` records behind a
//! status word. Updates append records in place; the last valid record for an
//! index, scanning from the page start, is its current value. When the page
//! fills or is found inconsistent, the live records are compacted onto the
//! alternate page and the pages swap roles.

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{PAGE_HEADER_SIZE, PageStatus, RECORD_SIZE, Record, RecordState};
use crate::store::Sector;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp;
#[cfg(feature = "defmt")]
use defmt::trace;

/// Indices are resolved against the source page in fixed-size batches during
/// a swap, bounding peak memory to one slot offset per batch entry no matter
/// how large the virtual EEPROM is.
const SWAP_BATCH: usize = 128;

/// Swap attempts per `put`. The second attempt re-erases the target page
/// unconditionally instead of trusting a page that merely reads as erased
/// (marginal erase).
const SWAP_ATTEMPTS: usize = 2;

/// Identifies one of the two physical pages.
#[derive(strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageId {
    Page1,
    Page2,
}

/// Snapshot of page roles and record usage.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EepromStatistics {
    pub active_page: PageId,
    pub used_records: usize,
    pub free_records: usize,
    pub pending_erase: bool,
}

/// Result of one pass over the active page: the current value of every byte
/// in the addressed range, the first free slot, and whether a torn record
/// precedes it.
struct PageAudit {
    first_empty: Option<usize>,
    torn: bool,
    current: Vec<u8>,
}

pub struct Eeprom<T: Platform> {
    store: T,
    pages: [Sector; 2],
    active: usize,
}

impl<T: Platform> Eeprom<T> {
    /// Binds the engine to its two backing pages. The pages may have
    /// different sizes; capacity follows the smaller one. Call [`init`]
    /// before the first access.
    ///
    /// [`init`]: Eeprom::init
    pub fn new(store: T, page1: Sector, page2: Sector) -> Result<Self, Error> {
        if T::WRITE_SIZE != 1 {
            return Err(Error::InvalidSectorLayout);
        }
        if page1.size <= PAGE_HEADER_SIZE + RECORD_SIZE
            || page2.size <= PAGE_HEADER_SIZE + RECORD_SIZE
        {
            return Err(Error::InvalidSectorLayout);
        }
        Ok(Self {
            store,
            pages: [page1, page2],
            active: 0,
        })
    }

    /// Resolves the active page from the headers, formatting the region when
    /// neither page is active (first boot or unrecoverable corruption).
    pub fn init(&mut self) -> Result<(), Error> {
        self.update_active_page();
        if self.page_status(self.active) != Some(PageStatus::Active) {
            self.format(false)?;
        }
        Ok(())
    }

    /// Usable virtual EEPROM size in bytes. Only half of the raw slot count
    /// of the smaller page, so a worst-case compaction always fits.
    pub fn capacity(&self) -> usize {
        let slots = cmp::min(self.pages[0].size, self.pages[1].size) / RECORD_SIZE / 2;
        // index 0xFFFF is reserved as the empty marker
        cmp::min(slots, crate::raw::EMPTY_INDEX as usize)
    }

    pub fn active_page(&self) -> PageId {
        match self.active {
            0 => PageId::Page1,
            _ => PageId::Page2,
        }
    }

    /// Reads `out.len()` bytes starting at `index`. Bytes never written, and
    /// bytes outside the capacity, read as `0xFF`.
    pub fn get(&self, index: u16, out: &mut [u8]) {
        out.fill(0xFF);
        let page = self.pages[self.active];
        let data = self.store.data_at(page.base, page.size);
        let start = index as usize;
        let end = start + out.len();
        for slot in 0..Self::slots(page) {
            let record = Self::record_in(data, slot);
            // an interrupted write leaves a reliable boundary marker; nothing
            // past it is consulted
            if record.state() != RecordState::Valid {
                break;
            }
            let i = record.index as usize;
            if i >= start && i < end {
                out[i - start] = record.data;
            }
        }
    }

    /// Writes `data` at `index`, appending one record per changed byte while
    /// the active page has room and is consistent, and compacting onto the
    /// alternate page otherwise.
    ///
    /// Requests past `capacity()` are dropped without an error, matching the
    /// long-standing behavior of the shipped format.
    pub fn put(&mut self, index: u16, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        if index as usize + data.len() > self.capacity() {
            return Ok(());
        }

        #[cfg(feature = "defmt")]
        trace!("eeprom: put index={} len={}", index, data.len());

        let audit = self.audit_active(index, data.len());

        // never append on top of a page with a known inconsistency
        if !audit.torn {
            let changed: Vec<(u16, u8)> = data
                .iter()
                .enumerate()
                .filter(|&(i, &value)| value != audit.current[i])
                .map(|(i, &value)| (index + i as u16, value))
                .collect();
            if changed.is_empty() {
                return Ok(());
            }
            if let Some(slot) = audit.first_empty
                && self.try_append(slot, &changed)
            {
                return Ok(());
            }
        }

        self.swap_and_write(index, data)
    }

    /// Factory reset: both pages erased, Page1 active.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.format(true)
    }

    /// True while the page retired by the last swap still awaits its erase.
    pub fn has_pending_erase(&self) -> bool {
        let alternate = self.pages[1 - self.active];
        !self.store.is_erased(alternate.base, alternate.size)
    }

    /// Erases the retired page. An erase stalls the bus for up to a few
    /// hundred milliseconds on real parts, so callers schedule this at an
    /// idle point; if it never runs, the next swap erases inline.
    pub fn perform_pending_erase(&mut self) -> Result<(), Error> {
        if !self.has_pending_erase() {
            return Ok(());
        }
        let alternate = self.pages[1 - self.active];
        self.store
            .erase_sector(alternate.base)
            .map_err(|_| Error::FlashEraseFailed)
    }

    /// Snapshot of page roles and record usage.
    pub fn statistics(&self) -> EepromStatistics {
        let page = self.pages[self.active];
        let data = self.store.data_at(page.base, page.size);
        let mut used = 0;
        for slot in 0..Self::slots(page) {
            if Self::record_in(data, slot).state() != RecordState::Valid {
                break;
            }
            used += 1;
        }
        EepromStatistics {
            active_page: self.active_page(),
            used_records: used,
            free_records: Self::slots(page) - used,
            pending_erase: self.has_pending_erase(),
        }
    }

    fn audit_active(&self, index: u16, len: usize) -> PageAudit {
        let page = self.pages[self.active];
        let data = self.store.data_at(page.base, page.size);
        let mut audit = PageAudit {
            first_empty: None,
            torn: false,
            current: vec![0xFF; len],
        };
        let start = index as usize;
        // a torn record ends the authoritative log; later valid records are
        // leftovers of an interrupted append
        let mut settled = false;
        for slot in 0..Self::slots(page) {
            let record = Self::record_in(data, slot);
            match record.state() {
                RecordState::Empty => {
                    audit.first_empty = Some(slot);
                    break;
                }
                RecordState::Valid if !settled => {
                    let i = record.index as usize;
                    if i >= start && i < start + len {
                        audit.current[i - start] = record.data;
                    }
                }
                RecordState::Valid => {}
                RecordState::Torn => {
                    audit.torn = true;
                    settled = true;
                }
            }
        }
        audit
    }

    /// Appends one record per changed byte, highest slot first, so a scan
    /// that runs before the batch completes stops at the still-empty first
    /// slot and never sees a partial append. Returns false when the append
    /// doesn't fit or a record fails verification; the caller escalates to a
    /// page swap.
    fn try_append(&mut self, first_slot: usize, changed: &[(u16, u8)]) -> bool {
        let page = self.pages[self.active];
        // the slot after the last new record stays empty as a separator
        if first_slot + changed.len() >= Self::slots(page) {
            return false;
        }
        for (k, &(index, value)) in changed.iter().enumerate().rev() {
            if self
                .write_record(page, first_slot + k, Record::valid(index, value))
                .is_err()
            {
                return false;
            }
        }
        let data = self.store.data_at(page.base, page.size);
        Self::record_in(data, first_slot + changed.len()).state() == RecordState::Empty
    }

    fn swap_and_write(&mut self, index: u16, data: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("eeprom: page swap from {}", self.active_page());

        #[cfg(feature = "debug-logs")]
        println!("eeprom: page swap from {}", self.active_page());

        let mut result = Err(Error::FlashWriteFailed);
        for attempt in 0..SWAP_ATTEMPTS {
            result = self.try_swap(index, data, attempt > 0);
            if result.is_ok() {
                self.update_active_page();
                return result;
            }
        }
        result
    }

    /// Rebuilds the alternate page from the live records of the active one
    /// plus the new values, then promotes it: `Erased -> Copy -> Active`,
    /// and finally the old page to `Inactive`. The old page is not erased
    /// here; see [`perform_pending_erase`].
    ///
    /// [`perform_pending_erase`]: Eeprom::perform_pending_erase
    fn try_swap(&mut self, index: u16, data: &[u8], force_erase: bool) -> Result<(), Error> {
        let src = self.pages[self.active];
        let dst = self.pages[1 - self.active];

        if force_erase || !self.store.is_erased(dst.base, dst.size) {
            self.store
                .erase_sector(dst.base)
                .map_err(|_| Error::FlashEraseFailed)?;
        }
        self.write_status(dst, PageStatus::Copy)?;

        let range = index..index + data.len() as u16;
        let dst_slots = Self::slots(dst);
        let mut write_slot = 0usize;

        let capacity = self.capacity() as u16;
        let mut batch_start: u16 = 0;
        while batch_start < capacity {
            let batch_len = cmp::min(SWAP_BATCH, (capacity - batch_start) as usize);
            // latest valid slot per index in this batch, duplicates resolved
            // on the fly
            let mut slots = [usize::MAX; SWAP_BATCH];
            {
                let src_data = self.store.data_at(src.base, src.size);
                for slot in 0..Self::slots(src) {
                    let record = Self::record_in(src_data, slot);
                    if record.state() != RecordState::Valid {
                        break;
                    }
                    let i = record.index as usize;
                    if i >= batch_start as usize && i < batch_start as usize + batch_len {
                        slots[i - batch_start as usize] = slot;
                    }
                }
            }
            for (k, &src_slot) in slots[..batch_len].iter().enumerate() {
                if src_slot == usize::MAX {
                    continue;
                }
                let rec_index = batch_start + k as u16;
                if range.contains(&rec_index) {
                    continue; // superseded by this put
                }
                let record = {
                    let src_data = self.store.data_at(src.base, src.size);
                    Self::record_in(src_data, src_slot)
                };
                if record.data == 0xFF {
                    continue; // reads as erased by default anyway
                }
                if write_slot >= dst_slots {
                    return Err(Error::FlashWriteFailed);
                }
                self.write_record(dst, write_slot, Record::valid(rec_index, record.data))?;
                write_slot += 1;
            }
            batch_start += batch_len as u16;
        }

        for (i, &value) in data.iter().enumerate() {
            if value == 0xFF {
                continue;
            }
            if write_slot >= dst_slots {
                return Err(Error::FlashWriteFailed);
            }
            self.write_record(dst, write_slot, Record::valid(index + i as u16, value))?;
            write_slot += 1;
        }

        self.write_status(dst, PageStatus::Active)?;
        self.write_status(src, PageStatus::Inactive)
    }

    /// The page whose status reads exactly `Active` is current; Page1 wins
    /// when an interrupted swap left both marked active.
    fn update_active_page(&mut self) {
        self.active = match (self.page_status(0), self.page_status(1)) {
            (Some(PageStatus::Active), _) => 0,
            (_, Some(PageStatus::Active)) => 1,
            _ => 0,
        };
    }

    fn format(&mut self, force_erase: bool) -> Result<(), Error> {
        for idx in 0..2 {
            let page = self.pages[idx];
            if force_erase || !self.store.is_erased(page.base, page.size) {
                self.store
                    .erase_sector(page.base)
                    .map_err(|_| Error::FlashEraseFailed)?;
            }
        }
        self.write_status(self.pages[0], PageStatus::Active)?;
        self.active = 0;
        Ok(())
    }

    fn page_status(&self, idx: usize) -> Option<PageStatus> {
        let raw = self.store.data_at(self.pages[idx].base, PAGE_HEADER_SIZE);
        PageStatus::from_repr(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn write_status(&mut self, page: Sector, status: PageStatus) -> Result<(), Error> {
        // every legal transition only clears bits, so no erase is needed
        let raw = (status as u32).to_le_bytes();
        self.store
            .write(page.base, &raw)
            .map_err(|_| Error::FlashWriteFailed)?;
        if self.store.data_at(page.base, PAGE_HEADER_SIZE) != raw {
            return Err(Error::VerificationFailed);
        }
        Ok(())
    }

    fn write_record(&mut self, page: Sector, slot: usize, record: Record) -> Result<(), Error> {
        let address = page.base + (PAGE_HEADER_SIZE + slot * RECORD_SIZE) as u32;
        let raw = record.to_bytes();
        self.store
            .write(address, &raw)
            .map_err(|_| Error::FlashWriteFailed)?;
        if self.store.data_at(address, RECORD_SIZE) != raw {
            return Err(Error::VerificationFailed);
        }
        Ok(())
    }

    fn slots(page: Sector) -> usize {
        (page.size - PAGE_HEADER_SIZE) / RECORD_SIZE
    }

    fn record_in(data: &[u8], slot: usize) -> Record {
        let at = PAGE_HEADER_SIZE + slot * RECORD_SIZE;
        Record::from_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
    }
}
