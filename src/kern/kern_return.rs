//! Kernel Return Codes
//!
//! Based on Mach4 mach/kern_return.h
//!
//! Internally the VM core propagates `KernError` through `Result`; the
//! user-call layer (`vm_user`) flattens it into the numeric `KernReturn`
//! codes that cross the trap boundary.

use thiserror::Error;

/// Numeric return code seen by callers of the VM interface
pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
pub const KERN_NO_SPACE: KernReturn = 3;
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
pub const KERN_FAILURE: KernReturn = 5;
pub const KERN_RESOURCE_SHORTAGE: KernReturn = 6;
pub const KERN_MEMORY_FAILURE: KernReturn = 9;
pub const KERN_MEMORY_ERROR: KernReturn = 10;
pub const KERN_ABORTED: KernReturn = 14;
pub const KERN_MEMORY_PRESENT: KernReturn = 23;

/// Recoverable VM failures
///
/// Invariant violations are not represented here; they panic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    #[error("address is not mapped")]
    InvalidAddress,

    #[error("access exceeds protection")]
    ProtectionFailure,

    #[error("no room in the address map")]
    NoSpace,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("resource shortage")]
    ResourceShortage,

    #[error("range overlaps an existing mapping")]
    MemoryPresent,

    #[error("memory manager unavailable")]
    MemoryFailure,

    #[error("memory manager reported an error")]
    MemoryError,

    #[error("wait interrupted")]
    Aborted,
}

/// Result alias used throughout the VM core
pub type KernResult<T> = Result<T, KernError>;

impl From<KernError> for KernReturn {
    fn from(err: KernError) -> Self {
        match err {
            KernError::InvalidAddress => KERN_INVALID_ADDRESS,
            KernError::ProtectionFailure => KERN_PROTECTION_FAILURE,
            KernError::NoSpace => KERN_NO_SPACE,
            KernError::InvalidArgument => KERN_INVALID_ARGUMENT,
            KernError::ResourceShortage => KERN_RESOURCE_SHORTAGE,
            KernError::MemoryPresent => KERN_MEMORY_PRESENT,
            KernError::MemoryFailure => KERN_MEMORY_FAILURE,
            KernError::MemoryError => KERN_MEMORY_ERROR,
            KernError::Aborted => KERN_ABORTED,
        }
    }
}

/// Flatten a `KernResult` into a return code
pub fn kern_return<T>(result: KernResult<T>) -> KernReturn {
    match result {
        Ok(_) => KERN_SUCCESS,
        Err(err) => err.into(),
    }
}
