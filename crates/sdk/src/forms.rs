//! Host object type definitions
//!
//! These are opaque types representing host objects. The engine only passes
//! pointers to them around and reads a few fixed fields through
//! [`crate::offsets`].

use crate::offsets::FORM_TYPE_OFFSET;

/// Opaque type for TESForm
/// Base of every record the host loads from its data files
#[repr(C)]
pub struct TESForm {
    _opaque: [u8; 0],
}

impl TESForm {
    /// Read the form type id of a form.
    ///
    /// # Safety
    ///
    /// `form` must point to a live host form.
    pub unsafe fn form_type(form: *const TESForm) -> u8 {
        form.cast::<u8>().add(FORM_TYPE_OFFSET).read()
    }

    /// Like [`TESForm::form_type`] but tolerates null, returning `None`.
    ///
    /// # Safety
    ///
    /// `form` must be null or point to a live host form.
    pub unsafe fn form_type_of(form: *const TESForm) -> Option<u8> {
        if form.is_null() {
            None
        } else {
            Some(Self::form_type(form))
        }
    }
}

/// Opaque type for TESObjectREFR
/// A placed reference; starts with a TESForm
#[repr(C)]
pub struct TESObjectREFR {
    _opaque: [u8; 0],
}

impl TESObjectREFR {
    pub fn as_form(this: *mut TESObjectREFR) -> *mut TESForm {
        this.cast()
    }
}

/// Opaque type for Actor
/// A reference with an AI process; starts with a TESObjectREFR
#[repr(C)]
pub struct Actor {
    _opaque: [u8; 0],
}

/// Opaque type for TESObjectWEAP
#[repr(C)]
pub struct TESObjectWEAP {
    _opaque: [u8; 0],
}

/// Opaque type for BGSEquipType
/// Equip-type component embedded in weapons, armor and spells
#[repr(C)]
pub struct BGSEquipType {
    _opaque: [u8; 0],
}

/// Opaque type for BGSEquipSlot
#[repr(C)]
pub struct BGSEquipSlot {
    _opaque: [u8; 0],
}

/// Opaque type for NiNode
/// Scene graph node that can own children
#[repr(C)]
pub struct NiNode {
    _opaque: [u8; 0],
}

/// Opaque type for NiAVObject
#[repr(C)]
pub struct NiAVObject {
    _opaque: [u8; 0],
}

/// Opaque type for BShkbAnimationGraph
#[repr(C)]
pub struct BShkbAnimationGraph {
    _opaque: [u8; 0],
}

/// Opaque type for IAnimationGraphManagerHolder
/// Owner of an actor's animation graphs
#[repr(C)]
pub struct IAnimationGraphManagerHolder {
    _opaque: [u8; 0],
}

/// Opaque type for BSFixedString
/// Interned host string, passed by pointer
#[repr(C)]
pub struct BSFixedString {
    _opaque: [u8; 0],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form_type;

    #[test]
    fn test_form_type_reads_byte_at_offset() {
        let mut record = [0u8; 0x40];
        record[FORM_TYPE_OFFSET] = form_type::ACTOR;
        let form = record.as_ptr().cast::<TESForm>();
        assert_eq!(unsafe { TESForm::form_type(form) }, form_type::ACTOR);
        assert_eq!(unsafe { TESForm::form_type_of(form) }, Some(form_type::ACTOR));
    }

    #[test]
    fn test_form_type_of_null() {
        assert_eq!(unsafe { TESForm::form_type_of(std::ptr::null()) }, None);
    }
}
