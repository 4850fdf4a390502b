use crate::store::Store;

/// Everything the engines need from the target: raw flash access plus the
/// CRC-32 used for sector footers. See README.md for an example
/// implementation.
pub trait Platform: Crc + Store {}

impl<T: Crc + Store> Platform for T {}

pub type FnCrc32 = fn(init: u32, data: &[u8]) -> u32;

pub trait Crc {
    fn crc32(init: u32, data: &[u8]) -> u32;
}

impl<T: Crc> Crc for &mut T {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        T::crc32(init, data)
    }
}
