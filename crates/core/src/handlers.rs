//! Site handlers
//!
//! Each stub calls one of these with the host's arguments plus the engine
//! context it embedded. Handlers only read engine state.

use sheath_sdk::offsets::left_hand_type;
use sheath_sdk::{
    form_type, Actor, BGSEquipSlot, BGSEquipType, BSFixedString, BShkbAnimationGraph,
    IAnimationGraphManagerHolder, NiAVObject, NiNode, TESForm, TESObjectREFR,
};

use crate::engine::EngineExtensions;
use crate::events::{CreateWeaponNodesEvent, SetEquipSlotEvent};
use crate::sites::SiteId;

type CreateWeaponNodesFn = unsafe extern "system" fn(*mut TESObjectREFR, *mut TESForm, bool);
type SetEquipSlotFn = unsafe extern "system" fn(*mut BGSEquipType, *mut BGSEquipSlot);
type SetGraphVariableIntFn =
    unsafe extern "system" fn(*mut BShkbAnimationGraph, *const BSFixedString, i32) -> bool;
type SetVariableOnGraphsIntFn =
    unsafe extern "system" fn(*mut IAnimationGraphManagerHolder, *const BSFixedString, i32) -> u32;

/// Address of the handler the stub for `id` calls; guard sites have none
pub(crate) fn handler_address(id: SiteId) -> Option<usize> {
    Some(match id {
        SiteId::CreateWeaponNodes => create_weapon_nodes as usize,
        SiteId::ScabbardAttach | SiteId::ScabbardDetach => scabbard_attachment_node as usize,
        SiteId::CreateArmorNode => return None,
        SiteId::ShieldAttach => attach_shield_node as usize,
        SiteId::DisableShieldHideOnSit => should_block_shield_hide as usize,
        SiteId::ShieldHandGraphVariable => set_graph_variable_int as usize,
        SiteId::ShieldHandHolderVariable => set_variable_on_graphs_int as usize,
        SiteId::ShieldHandLeftHandSync => sync_left_hand_type as usize,
        SiteId::WeaponSetEquipSlot => set_equip_slot as usize,
    })
}

unsafe fn engine<'a>(context: *const EngineExtensions) -> &'a EngineExtensions {
    &*context
}

pub(crate) unsafe extern "system" fn create_weapon_nodes(
    reference: *mut TESObjectREFR,
    object: *mut TESForm,
    left: bool,
    context: *const EngineExtensions,
) {
    let engine = engine(context);
    if let Some(original) = engine
        .originals()
        .get::<CreateWeaponNodesFn>(SiteId::CreateWeaponNodes)
    {
        original(reference, object, left);
    }

    engine.dispatchers().publish(&CreateWeaponNodesEvent {
        reference,
        object,
        left,
    });
}

/// Shared by the attach and detach scabbard sites
pub(crate) unsafe extern "system" fn scabbard_attachment_node(
    reference: *mut TESObjectREFR,
    form: *mut TESForm,
    attachment: *mut NiNode,
    context: *const EngineExtensions,
) -> *mut NiNode {
    let reference_form = TESObjectREFR::as_form(reference);
    if TESForm::form_type_of(reference_form) != Some(form_type::ACTOR)
        || TESForm::form_type_of(form) != Some(form_type::WEAPON)
    {
        return std::ptr::null_mut();
    }

    engine(context)
        .controller()
        .scabbard_attachment_node(reference.cast::<Actor>(), form, attachment)
}

pub(crate) unsafe extern "system" fn attach_shield_node(
    actor: *mut Actor,
    form: *mut TESForm,
    attachment: *mut NiNode,
    object: *mut NiAVObject,
    context: *const EngineExtensions,
) {
    let controller = engine(context).controller();

    let mut parent = attachment;
    if !form.is_null() {
        let node = controller.shield_attachment_node(actor, form, attachment);
        if !node.is_null() {
            parent = node;
        }
    }

    controller.attach_child(parent, object);
}

pub(crate) unsafe extern "system" fn should_block_shield_hide(
    actor: *mut Actor,
    context: *const EngineExtensions,
) -> bool {
    engine(context).controller().should_block_shield_hide(actor)
}

pub(crate) unsafe extern "system" fn set_graph_variable_int(
    graph: *mut BShkbAnimationGraph,
    name: *const BSFixedString,
    value: i32,
    actor: *mut Actor,
    context: *const EngineExtensions,
) -> bool {
    let engine = engine(context);
    let value = filter_shield_hand_type(engine, actor, value);

    match engine
        .originals()
        .get::<SetGraphVariableIntFn>(SiteId::ShieldHandGraphVariable)
    {
        Some(original) => original(graph, name, value),
        None => false,
    }
}

pub(crate) unsafe extern "system" fn set_variable_on_graphs_int(
    holder: *mut IAnimationGraphManagerHolder,
    name: *const BSFixedString,
    value: i32,
    actor: *mut Actor,
    context: *const EngineExtensions,
) -> u32 {
    let engine = engine(context);
    let value = filter_shield_hand_type(engine, actor, value);

    match engine
        .originals()
        .get::<SetVariableOnGraphsIntFn>(SiteId::ShieldHandHolderVariable)
    {
        Some(original) => original(holder, name, value),
        None => 0,
    }
}

pub(crate) unsafe extern "system" fn sync_left_hand_type(
    holder: *mut IAnimationGraphManagerHolder,
    name: *const BSFixedString,
    value: i32,
    actor: *mut Actor,
    context: *const EngineExtensions,
) -> u32 {
    let engine = engine(context);
    let controller = engine.controller();

    if matches!(value, left_hand_type::EMPTY | left_hand_type::SHIELD)
        && controller.should_sync_left_hand_type(actor)
    {
        controller.set_left_hand_type(holder, value);
    }

    match engine
        .originals()
        .get::<SetVariableOnGraphsIntFn>(SiteId::ShieldHandLeftHandSync)
    {
        Some(original) => original(holder, name, value),
        None => 0,
    }
}

pub(crate) unsafe extern "system" fn set_equip_slot(
    equip_type: *mut BGSEquipType,
    slot: *mut BGSEquipSlot,
    context: *const EngineExtensions,
) {
    let engine = engine(context);
    if let Some(original) = engine
        .originals()
        .get::<SetEquipSlotFn>(SiteId::WeaponSetEquipSlot)
    {
        original(equip_type, slot);
    }

    engine
        .dispatchers()
        .publish(&SetEquipSlotEvent { equip_type, slot });
}

/// A shield in the left hand is reported as an empty hand when the
/// controller asks for it
fn filter_shield_hand_type(engine: &EngineExtensions, actor: *mut Actor, value: i32) -> i32 {
    if value == left_hand_type::SHIELD && engine.controller().should_clear_shield_hand_type(actor) {
        left_hand_type::EMPTY
    } else {
        value
    }
}
