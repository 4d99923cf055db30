//! Event payloads
//!
//! Plain values copied out of handler arguments. The pointers refer to host
//! objects that are only guaranteed alive for the duration of delivery.

use sheath_sdk::{BGSEquipSlot, BGSEquipType, TESForm, TESObjectREFR};

/// Published after the host built the weapon nodes of a reference
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateWeaponNodesEvent {
    pub reference: *mut TESObjectREFR,
    pub object: *mut TESForm,
    pub left: bool,
}

impl Default for CreateWeaponNodesEvent {
    fn default() -> Self {
        Self {
            reference: std::ptr::null_mut(),
            object: std::ptr::null_mut(),
            left: false,
        }
    }
}

/// Published after a weapon's equip slot changed
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetEquipSlotEvent {
    pub equip_type: *mut BGSEquipType,
    pub slot: *mut BGSEquipSlot,
}

impl Default for SetEquipSlotEvent {
    fn default() -> Self {
        Self {
            equip_type: std::ptr::null_mut(),
            slot: std::ptr::null_mut(),
        }
    }
}
