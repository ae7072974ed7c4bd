//! Per-subsystem `Error` types for the crate, built with the [`thiserror`] crate, plus a
//! crate-wide [`WboxError`] that aggregates them for call sites that cross subsystem
//! boundaries (e.g. a syscall handler that may fail at the heap layer or the VFS layer).

use thiserror::Error;

/// Errors raised while building or walking the guest page tables.
#[derive(Debug, Error)]
pub enum PagingError {
    /// The bump pointer for new page tables has been exhausted.
    #[error("out of page table memory")]
    OutOfPageTables,
    /// `alloc_phys` could not satisfy the request from the general-allocation region.
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    /// The virtual address has no mapping.
    #[error("virtual address {0:#010x} is not mapped")]
    NotMapped(u32),
}

pub type PagingResult<T> = Result<T, PagingError>;

/// Errors raised while parsing a PE image.
#[derive(Debug, Error)]
pub enum PeError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid DOS header (missing 'MZ' signature)")]
    InvalidDosSignature,
    #[error("invalid PE header (missing 'PE\\0\\0' signature)")]
    InvalidPeSignature,
    #[error("unsupported machine type {0:#06x}, expected IMAGE_FILE_MACHINE_I386")]
    UnsupportedMachine(u16),
    #[error("unsupported optional header magic {0:#06x}, expected PE32")]
    UnsupportedOptionalHeaderMagic(u16),
    #[error("image has no sections")]
    NoSections,
    #[error("file too small to contain the headers it declares")]
    Truncated,
}

pub type PeResult<T> = Result<T, PeError>;

/// Errors raised while loading modules, resolving exports, or patching imports.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Pe(#[from] PeError),
    #[error(transparent)]
    Paging(#[from] PagingError),
    #[error("could not find or load DLL '{0}'")]
    DllNotFound(String),
    #[error("loader heap exhausted (requested {requested} bytes, {remaining} remaining)")]
    HeapExhausted { requested: u32, remaining: u32 },
    #[error("stub region exhausted")]
    StubRegionExhausted,
    #[error("module '{0}' has no export directory")]
    NoExportDirectory(String),
}

pub type LoaderResult<T> = Result<T, LoaderError>;

/// Errors raised while translating or validating guest filesystem paths.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("path escapes the jail root")]
    Escape,
    #[error("unsupported path form (\\Device\\ or UNC paths are rejected)")]
    UnsupportedPathForm,
    #[error("jail root '{0}' is not a directory")]
    InvalidJailRoot(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type VfsResult<T> = Result<T, VfsError>;

/// Errors raised by the process heap.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("heap region exhausted")]
    OutOfMemory,
    #[error("pointer {0:#010x} lies outside the heap arena")]
    OutOfRange(u32),
    #[error("allocation header at {0:#010x} has an invalid magic (corrupt or not our pointer)")]
    BadMagic(u32),
    #[error("double free detected at {0:#010x}")]
    DoubleFree(u32),
}

pub type HeapResult<T> = Result<T, HeapError>;

/// Errors raised by the NT and USER handle tables.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("handle table exhausted")]
    TableFull,
    #[error("handle {0:#010x} is stale or was never allocated")]
    Invalid(u32),
    #[error("handle {0:#010x} does not refer to the expected object type")]
    WrongType(u32),
}

pub type HandleResult<T> = Result<T, HandleError>;

/// Errors raised by the kernel-to-user callback mechanism.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback nesting exceeded the maximum depth of {0}")]
    TooDeep(usize),
    #[error("callback did not return within {0} CPU slices")]
    Timeout(u32),
}

pub type CallbackResult<T> = Result<T, CallbackError>;

/// Crate-wide error aggregate. Used at boundaries that can fail for more than one
/// subsystem's reason, such as a syscall dispatch handler.
#[derive(Debug, Error)]
pub enum WboxError {
    #[error(transparent)]
    Paging(#[from] PagingError),
    #[error(transparent)]
    Pe(#[from] PeError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Vfs(#[from] VfsError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type WboxResult<T> = Result<T, WboxError>;
