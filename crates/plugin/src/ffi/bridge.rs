//! Controller and event sink bridges
//!
//! The native side of the plugin hands over a table of C callbacks; this
//! module wraps it into a [`Controller`] and wraps sink callbacks into
//! [`EventSink`]s.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::Mutex;

use sheath_core::{Controller, EventSink};
use sheath_sdk::{Actor, IAnimationGraphManagerHolder, NiAVObject, NiNode, TESForm};

type NodeQueryFn =
    unsafe extern "C" fn(*mut c_void, *mut Actor, *mut TESForm, *mut NiNode) -> *mut NiNode;
type ActorQueryFn = unsafe extern "C" fn(*mut c_void, *mut Actor) -> bool;

/// Callback table passed to `sds_plugin_load`.
///
/// Every entry may be null; a missing callback answers "no" (null node,
/// `false`) and missing actions do nothing.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ControllerCallbacks {
    pub user_data: *mut c_void,
    pub scabbard_attachment_node: Option<NodeQueryFn>,
    pub shield_attachment_node: Option<NodeQueryFn>,
    pub attach_child: Option<unsafe extern "C" fn(*mut c_void, *mut NiNode, *mut NiAVObject)>,
    pub should_block_shield_hide: Option<ActorQueryFn>,
    pub should_clear_shield_hand_type: Option<ActorQueryFn>,
    pub should_sync_left_hand_type: Option<ActorQueryFn>,
    pub set_left_hand_type:
        Option<unsafe extern "C" fn(*mut c_void, *mut IAnimationGraphManagerHolder, i32)>,
}

/// [`Controller`] backed by a [`ControllerCallbacks`] table
pub struct FfiController {
    callbacks: ControllerCallbacks,
}

// SAFETY: the native side guarantees its callbacks and `user_data` may be
// used from any host thread for the lifetime of the process
unsafe impl Send for FfiController {}
unsafe impl Sync for FfiController {}

impl FfiController {
    /// # Safety
    /// Every non-null callback must be callable from any thread with
    /// `callbacks.user_data` for the rest of the process lifetime.
    pub unsafe fn new(callbacks: ControllerCallbacks) -> Self {
        Self { callbacks }
    }

    fn ask(&self, query: Option<ActorQueryFn>, actor: *mut Actor) -> bool {
        match query {
            Some(f) => unsafe { f(self.callbacks.user_data, actor) },
            None => false,
        }
    }

    fn node(
        &self,
        query: Option<NodeQueryFn>,
        actor: *mut Actor,
        form: *mut TESForm,
        attachment: *mut NiNode,
    ) -> *mut NiNode {
        match query {
            Some(f) => unsafe { f(self.callbacks.user_data, actor, form, attachment) },
            None => std::ptr::null_mut(),
        }
    }
}

impl Controller for FfiController {
    fn scabbard_attachment_node(
        &self,
        actor: *mut Actor,
        form: *mut TESForm,
        attachment: *mut NiNode,
    ) -> *mut NiNode {
        self.node(self.callbacks.scabbard_attachment_node, actor, form, attachment)
    }

    fn shield_attachment_node(
        &self,
        actor: *mut Actor,
        form: *mut TESForm,
        attachment: *mut NiNode,
    ) -> *mut NiNode {
        self.node(self.callbacks.shield_attachment_node, actor, form, attachment)
    }

    fn attach_child(&self, parent: *mut NiNode, child: *mut NiAVObject) {
        if let Some(f) = self.callbacks.attach_child {
            unsafe { f(self.callbacks.user_data, parent, child) }
        }
    }

    fn should_block_shield_hide(&self, actor: *mut Actor) -> bool {
        self.ask(self.callbacks.should_block_shield_hide, actor)
    }

    fn should_clear_shield_hand_type(&self, actor: *mut Actor) -> bool {
        self.ask(self.callbacks.should_clear_shield_hand_type, actor)
    }

    fn should_sync_left_hand_type(&self, actor: *mut Actor) -> bool {
        self.ask(self.callbacks.should_sync_left_hand_type, actor)
    }

    fn set_left_hand_type(&self, holder: *mut IAnimationGraphManagerHolder, value: i32) {
        if let Some(f) = self.callbacks.set_left_hand_type {
            unsafe { f(self.callbacks.user_data, holder, value) }
        }
    }
}

/// C sink callback for events of type `E`
pub type SinkFn<E> = unsafe extern "C" fn(*const E, *mut c_void);

/// [`EventSink`] forwarding to a C callback
pub struct FfiSink<E> {
    callback: SinkFn<E>,
    user_data: *mut c_void,
}

// SAFETY: registration requires the callback to accept calls from any
// host thread with its `user_data`
unsafe impl<E> Send for FfiSink<E> {}
unsafe impl<E> Sync for FfiSink<E> {}

impl<E> EventSink<E> for FfiSink<E> {
    fn receive(&self, event: &E) {
        unsafe { (self.callback)(event, self.user_data) }
    }
}

/// One [`FfiSink`] per (callback, user data) pair, so registering the same
/// pair twice hands the dispatcher the same sink.
pub struct SinkTable<E> {
    sinks: Mutex<HashMap<(usize, usize), Arc<FfiSink<E>>>>,
}

impl<E> Default for SinkTable<E> {
    fn default() -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
        }
    }
}

impl<E> SinkTable<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Safety
    /// `callback` must be callable from any thread with `user_data` for the
    /// rest of the process lifetime.
    pub unsafe fn intern(&self, callback: SinkFn<E>, user_data: *mut c_void) -> Arc<FfiSink<E>> {
        self.sinks
            .lock()
            .entry((callback as usize, user_data as usize))
            .or_insert_with(|| Arc::new(FfiSink { callback, user_data }))
            .clone()
    }
}
