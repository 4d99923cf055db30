//! Patch sites
//!
//! A [`PatchSite`] is one fixed host address the engine may patch, with the
//! signatures it must match first. It is validated once and installed at
//! most once.

use crate::memory::PatchableMemory;
use crate::signature::{match_signature, HexBytes};
use crate::sites::SiteId;

/// Length of a `call rel32` instruction
pub const CALL_REL32_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Start of a function; the original entry is a relocated prologue
    FunctionEntry,
    /// Inside a function body; the stub decides where execution resumes
    MidFunction,
    /// A `call rel32` whose destination is taken over
    CallTarget,
    /// Checked against its signatures but never written
    Guard,
}

/// Resume points of a site, as offsets from its address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeOffsets {
    pub continue_at: usize,
    pub alternate_at: Option<usize>,
}

impl ResumeOffsets {
    pub const fn new(continue_at: usize) -> Self {
        Self {
            continue_at,
            alternate_at: None,
        }
    }

    pub const fn with_alternate(continue_at: usize, alternate_at: usize) -> Self {
        Self {
            continue_at,
            alternate_at: Some(alternate_at),
        }
    }
}

/// A host address the engine patches.
#[derive(Debug, Clone)]
pub struct PatchSite {
    id: SiteId,
    address: usize,
    kind: PatchKind,
    signatures: &'static [&'static [u8]],
    resume: ResumeOffsets,
    /// Index of the signature that matched during validation
    matched: Option<usize>,
    installed: bool,
}

impl PatchSite {
    pub fn new(
        id: SiteId,
        address: usize,
        kind: PatchKind,
        signatures: &'static [&'static [u8]],
        resume: ResumeOffsets,
    ) -> Self {
        Self {
            id,
            address,
            kind,
            signatures,
            resume,
            matched: None,
            installed: false,
        }
    }

    pub fn id(&self) -> SiteId {
        self.id
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn kind(&self) -> PatchKind {
        self.kind
    }

    pub fn signatures(&self) -> &'static [&'static [u8]] {
        self.signatures
    }

    pub fn resume(&self) -> ResumeOffsets {
        self.resume
    }

    /// Check the site's bytes against its signatures and remember which one
    /// matched. Never writes.
    ///
    /// An installed site keeps the result it was installed with, since its
    /// bytes are now the engine's branch.
    pub fn validate<M: PatchableMemory + ?Sized>(&mut self, memory: &M) -> bool {
        if self.installed {
            return true;
        }

        self.matched = match_signature(memory, self.address, self.signatures);
        if self.matched.is_none() {
            let window = self.signatures.iter().map(|s| s.len()).max().unwrap_or(0);
            match memory.read(self.address, window) {
                Ok(found) => tracing::debug!(
                    "{}: no signature matches at {:x}, found {}",
                    self.id,
                    self.address,
                    HexBytes(&found)
                ),
                Err(e) => tracing::debug!("{}: {}", self.id, e),
            }
        }
        self.matched.is_some()
    }

    pub fn is_validated(&self) -> bool {
        self.matched.is_some()
    }

    /// The signature that matched, if validation succeeded
    pub fn matched_signature(&self) -> Option<&'static [u8]> {
        self.matched.and_then(|index| self.signatures.get(index).copied())
    }

    /// Number of bytes the installer replaces: the matched signature, or
    /// the whole `call` instruction for call-target sites.
    pub fn patch_len(&self) -> Option<usize> {
        let signature = self.matched_signature()?;
        Some(match self.kind {
            PatchKind::CallTarget => CALL_REL32_LEN,
            _ => signature.len(),
        })
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub(crate) fn mark_installed(&mut self) {
        self.installed = true;
    }
}
