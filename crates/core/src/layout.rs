//! Host layout for loading site addresses from JSON
//!
//! Site addresses differ between host builds, so they are shipped as data:
//! a JSON file mapping site names to RVAs, resolved against the module base
//! at startup. Example:
//!
//! ```json
//! {
//!     "sites": {
//!         "CreateWeaponNodes": "0x1D6740",
//!         "ScabbardAttach": 1931360
//!     },
//!     "vtables": { "TESObjectWEAP": "0x15E8F38" }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::sites::SiteId;

/// Errors that can occur when loading or resolving a layout
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("Failed to read layout file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse layout JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Unknown site in layout: {0}")]
    UnknownSite(String),

    #[error("Site not found in layout: {0}")]
    SiteNotFound(SiteId),

    #[error("Invalid RVA for {name}: {value}")]
    InvalidRva { name: String, value: String },
}

/// An RVA written either as a JSON number or as a hex string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Rva {
    Number(u64),
    Text(String),
}

impl Rva {
    fn parse(&self, name: &str) -> Result<usize, LayoutError> {
        let invalid = || LayoutError::InvalidRva {
            name: name.to_string(),
            value: match self {
                Rva::Number(n) => n.to_string(),
                Rva::Text(s) => s.clone(),
            },
        };

        let value = match self {
            Rva::Number(n) => *n,
            Rva::Text(s) => {
                let s = s.trim();
                match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => s.parse::<u64>(),
                }
                .map_err(|_| invalid())?
            }
        };
        usize::try_from(value).map_err(|_| invalid())
    }
}

#[derive(Debug, Default, Deserialize)]
struct VTables {
    #[serde(rename = "TESObjectWEAP")]
    weapon: Option<Rva>,
}

/// Site RVAs of one host build
#[derive(Debug, Default)]
pub struct HostLayout {
    sites: HashMap<SiteId, usize>,
    weapon_vtable: Option<usize>,
}

#[derive(Deserialize)]
struct RawLayout {
    #[serde(default)]
    sites: HashMap<String, Rva>,
    #[serde(default)]
    vtables: VTables,
}

impl HostLayout {
    /// Load a layout from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, LayoutError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Load a layout from a JSON string
    pub fn load_from_str(json: &str) -> Result<Self, LayoutError> {
        let raw: RawLayout = serde_json::from_str(json)?;

        let mut layout = HostLayout::default();
        for (name, rva) in raw.sites {
            let id: SiteId = name
                .parse()
                .map_err(|_| LayoutError::UnknownSite(name.clone()))?;
            layout.sites.insert(id, rva.parse(&name)?);
        }
        layout.weapon_vtable = raw
            .vtables
            .weapon
            .map(|rva| rva.parse("TESObjectWEAP"))
            .transpose()?;

        tracing::info!(
            "Loaded host layout: {} sites, weapon vtable {}",
            layout.sites.len(),
            if layout.weapon_vtable.is_some() { "present" } else { "absent" }
        );

        Ok(layout)
    }

    pub fn rva(&self, id: SiteId) -> Option<usize> {
        self.sites.get(&id).copied()
    }

    /// Rebase every RVA onto `module_base`
    pub fn resolve(&self, module_base: usize) -> ResolvedLayout {
        ResolvedLayout {
            sites: self
                .sites
                .iter()
                .map(|(id, rva)| (*id, module_base.wrapping_add(*rva)))
                .collect(),
            weapon_vtable: self.weapon_vtable.map(|rva| module_base.wrapping_add(rva)),
        }
    }
}

/// Absolute site addresses in the running process
#[derive(Debug, Default, Clone)]
pub struct ResolvedLayout {
    sites: HashMap<SiteId, usize>,
    weapon_vtable: Option<usize>,
}

impl ResolvedLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used when addresses are already absolute
    pub fn with_site(mut self, id: SiteId, address: usize) -> Self {
        self.sites.insert(id, address);
        self
    }

    pub fn with_weapon_vtable(mut self, address: usize) -> Self {
        self.weapon_vtable = Some(address);
        self
    }

    /// Address of a byte-patched site
    pub fn address(&self, id: SiteId) -> Result<usize, LayoutError> {
        self.sites
            .get(&id)
            .copied()
            .ok_or(LayoutError::SiteNotFound(id))
    }

    /// Address of the `TESObjectWEAP` virtual table
    pub fn weapon_vtable(&self) -> Result<usize, LayoutError> {
        self.weapon_vtable
            .ok_or(LayoutError::SiteNotFound(SiteId::WeaponSetEquipSlot))
    }
}
