use thiserror::Error;

/// Errors that can occur during storage operations. The list is likely to stay
/// as is but marked as non-exhaustive to allow for future additions without
/// breaking the API. Whatever the failure, the previously committed data stays
/// readable; only the interrupted write attempt is lost.
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The sector descriptors handed to a constructor don't describe a usable
    /// region: mismatched DCD sector sizes, a sector too small to hold its
    /// header, or flash that isn't byte-programmable.
    #[error("invalid sector layout")]
    InvalidSectorLayout,

    /// Write offset past the end of the logical region. Nothing was written.
    #[error("invalid offset")]
    InvalidOffset,

    /// Write would run past the end of the logical region. Nothing was
    /// written.
    #[error("invalid length")]
    InvalidLength,

    /// The flash driver reported a failed program operation.
    #[error("flash write failed")]
    FlashWriteFailed,

    /// The flash driver reported a failed erase.
    #[error("flash erase failed")]
    FlashEraseFailed,

    /// A write reported success but the bytes don't read back as written.
    /// Treated the same as a hardware failure since both mean the flash
    /// contents can't be trusted.
    #[error("flash verification failed")]
    VerificationFailed,
}
