#![forbid(unsafe_code)]
//! Error types for dvol.
//!
//! Defines `DvolError` and a `Result<T>` alias used throughout the
//! workspace. The taxonomy separates non-fatal semantic errors (returned to
//! the caller, volume stays writable) from fatal ones (the owning subsystem
//! enters read-only mode).

use dvol_types::ParseError;
use thiserror::Error;

/// Unified error type for all dvol operations.
#[derive(Debug, Error)]
pub enum DvolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no space: slab has no unreferenced blocks")]
    NoSpace,

    #[error("invalid reference count (slab {slab}, offset {sbn}): {detail}")]
    RefCountInvalid {
        slab: u16,
        sbn: u32,
        detail: &'static str,
    },

    #[error("bad block mapping at (page {page}, slot {slot}): {detail}")]
    BadMapping {
        page: u64,
        slot: u16,
        detail: &'static str,
    },

    #[error("physical block {pbn} is outside the addressable data region")]
    OutOfRange { pbn: u64 },

    #[error("operation rejected in admin state {state}")]
    InvalidAdminState { state: &'static str },

    #[error("volume is in read-only mode")]
    ReadOnly,

    #[error("corrupt {component}: {source}")]
    CorruptComponent {
        component: &'static str,
        #[source]
        source: ParseError,
    },

    #[error("unknown operation code {code} in journal entry")]
    NotImplemented { code: u8 },

    #[error("assertion violated: {0}")]
    Assertion(&'static str),
}

impl DvolError {
    /// Whether this error should push the owning subsystem into read-only
    /// mode. Semantic violations stay with the caller; I/O failures,
    /// corruption, unknown operations, and broken invariants do not.
    #[must_use]
    pub fn is_read_only_trigger(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::CorruptComponent { .. }
                | Self::NotImplemented { .. }
                | Self::Assertion(_)
        )
    }

    /// Wrap a parse failure with the name of the on-disk component.
    #[must_use]
    pub fn corrupt(component: &'static str, source: ParseError) -> Self {
        Self::CorruptComponent { component, source }
    }
}

/// Result alias using `DvolError`.
pub type Result<T> = std::result::Result<T, DvolError>;
