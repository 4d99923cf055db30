//! Host object-model constants
//!
//! Values here are baked into generated stubs, so they describe exactly the
//! host build the site catalog was written against.

/// Offset of the one-byte form type id inside every TESForm.
pub const FORM_TYPE_OFFSET: usize = 0x1A;

/// Offset of the base form pointer inside a TESObjectREFR.
pub const REFR_BASE_FORM_OFFSET: i32 = 0x40;

/// Offset of the race pointer inside a TESNPC.
pub const NPC_RACE_OFFSET: i32 = 0x158;

/// Offset of the shield equip-slot index inside a TESRace.
pub const RACE_SHIELD_SLOT_OFFSET: i32 = 0x138;

/// Stride of one entry in the biped object array walked by the attach code.
pub const BIPED_OBJECT_STRIDE: i32 = 0x78;

/// Offset of the item form inside one biped object entry.
pub const BIPED_OBJECT_ITEM_OFFSET: i32 = 0x10;

/// Form type ids.
pub mod form_type {
    pub const WEAPON: u8 = 0x29;
    pub const NPC: u8 = 0x2B;
    pub const ACTOR: u8 = 0x3E;
}

/// Values of the `iLeftHandType` animation graph variable.
pub mod left_hand_type {
    pub const EMPTY: i32 = 0;
    pub const SHIELD: i32 = 10;
}
