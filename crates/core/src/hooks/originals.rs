//! Original entries
//!
//! Handlers reach the host's own behavior through the entry recorded when
//! their site was installed. Entries are keyed by site, written once during
//! installation and only read afterwards.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::HookError;
use crate::sites::SiteId;

/// A callable address reproducing what a site did before it was patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginalEntry {
    /// Relocated copy of the replaced instructions, jumping back into the
    /// unmodified remainder
    Relocated(usize),
    /// Destination of the `call` a call-target site used to make
    Callee(usize),
    /// Previous value of a virtual dispatch slot
    Slot(usize),
}

impl OriginalEntry {
    pub fn address(self) -> usize {
        match self {
            OriginalEntry::Relocated(address)
            | OriginalEntry::Callee(address)
            | OriginalEntry::Slot(address) => address,
        }
    }
}

/// One [`OriginalEntry`] per installed site.
#[derive(Debug, Default)]
pub struct OriginalRegistry {
    entries: DashMap<SiteId, OriginalEntry>,
}

impl OriginalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the entry for `site`. An existing entry is never replaced.
    pub fn insert(&self, site: SiteId, entry: OriginalEntry) -> Result<(), HookError> {
        match self.entries.entry(site) {
            Entry::Occupied(_) => Err(HookError::AlreadyInstalled { site }),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    pub fn entry(&self, site: SiteId) -> Option<OriginalEntry> {
        self.entries.get(&site).map(|entry| *entry)
    }

    /// The original entry of `site` as a typed function pointer.
    ///
    /// Returns `None` when the site is not installed or `F` is not
    /// pointer-sized.
    ///
    /// # Safety
    ///
    /// `F` must be an `extern` function pointer type matching the calling
    /// convention and signature of the code the site originally ran.
    pub unsafe fn get<F: Copy>(&self, site: SiteId) -> Option<F> {
        if std::mem::size_of::<F>() != std::mem::size_of::<usize>() {
            return None;
        }
        let address = self.entry(site)?.address();
        if address == 0 {
            return None;
        }
        Some(std::mem::transmute_copy::<usize, F>(&address))
    }

    pub fn contains(&self, site: SiteId) -> bool {
        self.entries.contains_key(&site)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
