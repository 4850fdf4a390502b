use crate::error::Error;
use embedded_storage::nor_flash::NorFlash;

/// One physically erasable flash region. Two of these back each engine.
///
/// Bases and sizes are part of the on-flash contract: they must match the
/// values the firmware that persisted the data was built with, or the region
/// is treated as uninitialized.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sector {
    pub base: u32,
    pub size: usize,
}

impl Sector {
    pub const fn new(base: u32, size: usize) -> Self {
        Self { base, size }
    }
}

/// Sector-granular raw flash with a memory-mapped read path.
///
/// `write` carries NOR semantics: programming only clears bits, so writing
/// over already-programmed bytes ANDs into them. The engines rely on this to
/// update commit markers in place without an erase.
pub trait Store: NorFlash {
    /// Erases the whole sector containing `address`, resetting every byte in
    /// it to `0xFF`.
    ///
    /// The default covers devices with a uniform erase granularity; parts
    /// with asymmetric sector banks override it.
    fn erase_sector(&mut self, address: u32) -> Result<(), Self::Error> {
        let base = address - address % Self::ERASE_SIZE as u32;
        self.erase(base, base + Self::ERASE_SIZE as u32)
    }

    /// Borrows the current flash contents at `address`.
    ///
    /// The slice aliases memory-mapped flash: it is only guaranteed stable
    /// until the next write or erase touching the region, so callers must not
    /// hold it across a mutating call.
    fn data_at(&self, address: u32, len: usize) -> &[u8];

    /// True when the region already reads as fully erased. Checked before
    /// every physical erase so untouched sectors don't accumulate wear.
    fn is_erased(&self, address: u32, len: usize) -> bool {
        self.data_at(address, len).iter().all(|&b| b == 0xFF)
    }
}

impl<T: Store> Store for &mut T {
    fn erase_sector(&mut self, address: u32) -> Result<(), Self::Error> {
        (**self).erase_sector(address)
    }

    fn data_at(&self, address: u32, len: usize) -> &[u8] {
        (**self).data_at(address, len)
    }
}

const COPY_CHUNK: usize = 128;

/// Streams `len` bytes from `src` to `dst` through a bounded stack chunk.
/// A `data_at` borrow cannot span the destination write, so the copy goes
/// through the chunk rather than holding a view of the source.
pub(crate) fn copy_region<T: Store>(
    store: &mut T,
    src: u32,
    dst: u32,
    len: usize,
) -> Result<(), Error> {
    let mut chunk = [0u8; COPY_CHUNK];
    let mut done = 0;
    while done < len {
        let n = core::cmp::min(COPY_CHUNK, len - done);
        chunk[..n].copy_from_slice(store.data_at(src + done as u32, n));
        store
            .write(dst + done as u32, &chunk[..n])
            .map_err(|_| Error::FlashWriteFailed)?;
        done += n;
    }
    Ok(())
}
