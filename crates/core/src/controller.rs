//! Controller collaborator
//!
//! Handlers never decide equipment or attachment policy themselves; they
//! ask the [`Controller`] supplied at activation. Pointers are host objects
//! valid for the duration of the call.

use sheath_sdk::{Actor, IAnimationGraphManagerHolder, NiAVObject, NiNode, TESForm};

/// Answers the questions handlers ask while the host is inside a patched site.
///
/// Called concurrently from host threads.
pub trait Controller: Send + Sync {
    /// Node a sheathed weapon's scabbard should be attached to, or null to
    /// leave it unattached. `form` is a weapon and `actor` an actor.
    fn scabbard_attachment_node(
        &self,
        actor: *mut Actor,
        form: *mut TESForm,
        attachment: *mut NiNode,
    ) -> *mut NiNode;

    /// Node the shield should be attached to instead of `attachment`, or null
    /// to keep the host's choice.
    fn shield_attachment_node(
        &self,
        actor: *mut Actor,
        form: *mut TESForm,
        attachment: *mut NiNode,
    ) -> *mut NiNode;

    /// Attach `child` under `parent` in the scene graph.
    fn attach_child(&self, parent: *mut NiNode, child: *mut NiAVObject);

    /// Whether the host should keep the shield visible while `actor` sits.
    fn should_block_shield_hide(&self, actor: *mut Actor) -> bool;

    /// Whether a left-hand type of "shield" should be reported as "empty"
    /// for `actor`.
    fn should_clear_shield_hand_type(&self, actor: *mut Actor) -> bool;

    /// Whether `actor`'s left-hand type should be mirrored onto its graphs.
    fn should_sync_left_hand_type(&self, actor: *mut Actor) -> bool;

    /// Set the left-hand type variable on every graph of `holder`.
    fn set_left_hand_type(&self, holder: *mut IAnimationGraphManagerHolder, value: i32);
}
