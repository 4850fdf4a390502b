#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod dcd;
pub mod eeprom;
pub mod error;
pub mod platform;
mod raw;
pub mod store;

extern crate alloc;

pub use dcd::Dcd;
pub use eeprom::{Eeprom, EepromStatistics, PageId};
pub use error::Error;
pub use platform::{Crc, FnCrc32, Platform};
pub use store::{Sector, Store};
