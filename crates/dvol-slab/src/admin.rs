//! Per-subsystem lifecycle states.
//!
//! Shutdown, recovery, and scrubbing are modelled as admin-state
//! transitions rather than cancellation: entering a draining state stops new
//! adjustments, lets in-flight work finish, and flushes dirty state.

use std::fmt;

/// Lifecycle state of a slab or other persistent subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdminState {
    #[default]
    Normal,
    Suspending,
    Saving,
    SaveForScrubbing,
    Scrubbing,
    Recovering,
    Rebuilding,
    ReadOnly,
}

impl AdminState {
    /// Whether new reference adjustments are accepted.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::Normal | Self::Scrubbing | Self::Recovering | Self::Rebuilding
        )
    }

    /// Whether the state is one of the drain transitions.
    #[must_use]
    pub fn is_draining(self) -> bool {
        matches!(
            self,
            Self::Suspending | Self::Saving | Self::SaveForScrubbing | Self::Recovering
        )
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Suspending => "suspending",
            Self::Saving => "saving",
            Self::SaveForScrubbing => "save_for_scrubbing",
            Self::Scrubbing => "scrubbing",
            Self::Recovering => "recovering",
            Self::Rebuilding => "rebuilding",
            Self::ReadOnly => "read_only",
        }
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
