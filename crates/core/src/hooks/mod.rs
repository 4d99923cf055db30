//! Hook system
//!
//! Provides the three ways the engine diverts host code:
//! - Detours at function entries and mid-function sites (branch to a stub)
//! - Call-target replacement (a `call rel32` rewritten to reach a stub)
//! - VTable hooks (virtual function pointer replacement)
//!
//! Every installed hook leaves an [`OriginalEntry`] in the
//! [`OriginalRegistry`] so handlers can still reach the host's behavior.

pub mod detour;
pub mod originals;
pub mod site;
pub mod vtable;

pub use detour::{resolve_call_target, Branch, HookInstaller};
pub use originals::{OriginalEntry, OriginalRegistry};
pub use site::{PatchKind, PatchSite, ResumeOffsets, CALL_REL32_LEN};
pub use vtable::VTablePatcher;

use crate::memory::MemoryError;
use crate::sites::SiteId;
use crate::stub::StubError;

/// Error type for hook operations
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{site}: signature mismatch at {address:#x}")]
    SignatureMismatch { site: SiteId, address: usize },

    #[error("{site}: write failed: {cause}")]
    WriteFailure {
        site: SiteId,
        #[source]
        cause: WriteFailureCause,
    },

    #[error("{site}: dependency missing: {what}")]
    DependencyMissing { site: SiteId, what: String },

    #[error("{site}: hook already installed")]
    AlreadyInstalled { site: SiteId },

    #[error("{site}: site was not validated")]
    NotValidated { site: SiteId },

    #[error("{site}: site is only checked, never patched")]
    NotPatchable { site: SiteId },

    #[error("{site}: stub generation failed: {source}")]
    Stub {
        site: SiteId,
        #[source]
        source: StubError,
    },
}

impl HookError {
    /// The site the error belongs to
    pub fn site(&self) -> SiteId {
        match self {
            HookError::SignatureMismatch { site, .. }
            | HookError::WriteFailure { site, .. }
            | HookError::DependencyMissing { site, .. }
            | HookError::AlreadyInstalled { site }
            | HookError::NotValidated { site }
            | HookError::NotPatchable { site }
            | HookError::Stub { site, .. } => *site,
        }
    }

    pub(crate) fn write(site: SiteId, cause: impl Into<WriteFailureCause>) -> Self {
        HookError::WriteFailure {
            site,
            cause: cause.into(),
        }
    }
}

/// Why a write into host memory could not be made
#[derive(Debug, thiserror::Error)]
pub enum WriteFailureCause {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("branch needs {needed} bytes but only {available} are replaced")]
    BranchDoesNotFit { needed: usize, available: usize },
}
