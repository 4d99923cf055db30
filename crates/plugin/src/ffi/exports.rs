//! C-compatible exports called by the native loader

use std::ffi::{c_char, c_void};
use std::sync::{Arc, LazyLock, OnceLock};

use tracing::instrument;
use tracing_subscriber::EnvFilter;

use sheath_core::config::host_layout_path;
use sheath_core::{
    initialize, CreateWeaponNodesEvent, EngineConfig, EngineExtensions, Feature, HostLayout,
    ProcessMemory, SetEquipSlotEvent,
};

use super::bridge::{ControllerCallbacks, FfiController, SinkFn, SinkTable};

// Plugin metadata - static strings with null terminators for C compatibility
static AUTHOR: &[u8] = b"dollan\0";
static NAME: &[u8] = b"SimpleDualSheath\0";
static VERSION: &[u8] = b"0.1.0\0";

/// The activated engine and the features it ended up with
struct Loaded {
    engine: &'static EngineExtensions,
    active: Vec<Feature>,
}

static ENGINE: OnceLock<Loaded> = OnceLock::new();

static CREATE_WEAPON_NODES_SINKS: LazyLock<SinkTable<CreateWeaponNodesEvent>> =
    LazyLock::new(SinkTable::new);
static SET_EQUIP_SLOT_SINKS: LazyLock<SinkTable<SetEquipSlotEvent>> = LazyLock::new(SinkTable::new);

/// Called once by the loader after the host module is mapped
///
/// # Safety
/// - `module_base` must be the base address of the host executable
/// - `callbacks` must point to a valid callback table whose callbacks stay
///   callable from any thread for the lifetime of the process
/// - `error` must be a valid pointer to a buffer of at least `maxlen` bytes, or null
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn sds_plugin_load(
    module_base: usize,
    callbacks: *const ControllerCallbacks,
    error: *mut c_char,
    maxlen: usize,
) -> bool {
    let (config, config_error) = match EngineConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (EngineConfig::default(), Some(e)),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if config.debug { "debug" } else { "info" }));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    tracing::info!("SimpleDualSheath loading...");
    if let Some(e) = config_error {
        tracing::warn!("Unable to load the configuration file, using defaults: {}", e);
    }

    if ENGINE.get().is_some() {
        write_error(error, maxlen, "Plugin already loaded");
        return false;
    }
    if callbacks.is_null() {
        write_error(error, maxlen, "Controller callbacks are null");
        return false;
    }
    let controller = Arc::new(FfiController::new(*callbacks));

    let layout = match host_layout_path()
        .map_err(|e| e.to_string())
        .and_then(|path| HostLayout::load_from_file(path).map_err(|e| e.to_string()))
    {
        Ok(layout) => layout.resolve(module_base),
        Err(e) => {
            tracing::error!("Failed to load host layout: {}", e);
            write_error(error, maxlen, &format!("Layout error: {}", e));
            return false;
        }
    };

    // SAFETY: every address handed to the engine comes from the host layout
    let memory = unsafe { ProcessMemory::new() };
    let activation = match initialize(&layout, &memory, config, controller) {
        Ok(activation) => activation,
        Err(e) => {
            tracing::error!("Activation failed: {}", e);
            write_error(error, maxlen, &e.to_string());
            return false;
        }
    };

    for (feature, reason) in &activation.report.degraded {
        tracing::warn!("{} unavailable: {}", feature, reason);
    }

    let loaded = Loaded {
        engine: activation.engine,
        active: activation.report.active,
    };
    if let Err(e) = store_engine(&ENGINE, loaded) {
        tracing::error!("{}", e);
        write_error(error, maxlen, e);
        return false;
    }

    tracing::info!("SimpleDualSheath loaded successfully!");
    true
}

/// Register a sink for weapon node creation.
///
/// Returns false when the plugin is not loaded, the callback is null, or the
/// same callback and user data were already registered.
///
/// # Safety
/// - `callback` must be callable from any thread with `user_data` for the
///   lifetime of the process
#[no_mangle]
pub unsafe extern "C" fn sds_register_create_weapon_nodes_sink(
    callback: Option<SinkFn<CreateWeaponNodesEvent>>,
    user_data: *mut c_void,
) -> bool {
    let (Some(loaded), Some(callback)) = (ENGINE.get(), callback) else {
        return false;
    };
    let sink = CREATE_WEAPON_NODES_SINKS.intern(callback, user_data);
    loaded.engine.dispatchers().register::<CreateWeaponNodesEvent>(sink)
}

/// Register a sink for weapon equip slot changes.
///
/// Same rules as [`sds_register_create_weapon_nodes_sink`]; additionally
/// fails when equip slot tracking is not active.
///
/// # Safety
/// - `callback` must be callable from any thread with `user_data` for the
///   lifetime of the process
#[no_mangle]
pub unsafe extern "C" fn sds_register_set_equip_slot_sink(
    callback: Option<SinkFn<SetEquipSlotEvent>>,
    user_data: *mut c_void,
) -> bool {
    let (Some(loaded), Some(callback)) = (ENGINE.get(), callback) else {
        return false;
    };
    if !loaded.active.contains(&Feature::EquipSlotTracking) {
        return false;
    }
    let sink = SET_EQUIP_SLOT_SINKS.intern(callback, user_data);
    loaded.engine.dispatchers().register::<SetEquipSlotEvent>(sink)
}

/// Whether the feature at `index` (declaration order of [`Feature`]) is active
#[no_mangle]
pub extern "C" fn sds_feature_active(index: u32) -> bool {
    let Some(feature) = Feature::ALL.get(index as usize) else {
        return false;
    };
    ENGINE
        .get()
        .is_some_and(|loaded| loaded.active.contains(feature))
}

// Metadata exports - these return static strings for the loader to display

#[no_mangle]
pub extern "C" fn sds_get_author() -> *const c_char {
    AUTHOR.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn sds_get_name() -> *const c_char {
    NAME.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn sds_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

/// Publish the activated engine. Returns error if one is already stored.
fn store_engine(cell: &OnceLock<Loaded>, loaded: Loaded) -> Result<(), &'static str> {
    cell.set(loaded)
        .map_err(|_| "Engine already initialized; the new activation is not reachable")
}

/// Helper to write an error message to a C buffer
///
/// # Safety
/// - `error` must be a valid pointer or null
/// - `maxlen` must accurately reflect the buffer size
unsafe fn write_error(error: *mut c_char, maxlen: usize, msg: &str) {
    if !error.is_null() && maxlen > 0 {
        let bytes = msg.as_bytes();
        let len = bytes.len().min(maxlen - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), error as *mut u8, len);
        *error.add(len) = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_truncates() {
        let mut buffer = [0x7F as c_char; 8];
        unsafe { write_error(buffer.as_mut_ptr(), buffer.len(), "Memory validation failed") };

        let written: Vec<u8> = buffer.iter().map(|c| *c as u8).collect();
        assert_eq!(&written, b"Memory \0");
    }

    #[test]
    fn test_write_error_null_buffer() {
        unsafe { write_error(std::ptr::null_mut(), 16, "ignored") };
    }

    #[test]
    fn test_registration_before_load_fails() {
        unsafe extern "C" fn sink(_: *const CreateWeaponNodesEvent, _: *mut c_void) {}

        assert!(!unsafe { sds_register_create_weapon_nodes_sink(Some(sink), std::ptr::null_mut()) });
        assert!(!unsafe { sds_register_create_weapon_nodes_sink(None, std::ptr::null_mut()) });
        assert!(!sds_feature_active(0));
        assert!(!sds_feature_active(99));
    }

    fn loaded() -> Loaded {
        let callbacks = ControllerCallbacks {
            user_data: std::ptr::null_mut(),
            scabbard_attachment_node: None,
            shield_attachment_node: None,
            attach_child: None,
            should_block_shield_hide: None,
            should_clear_shield_hand_type: None,
            should_sync_left_hand_type: None,
            set_left_hand_type: None,
        };
        let controller = Arc::new(unsafe { FfiController::new(callbacks) });
        Loaded {
            engine: Box::leak(Box::new(EngineExtensions::new(EngineConfig::default(), controller))),
            active: vec![Feature::WeaponNodes],
        }
    }

    #[test]
    fn test_engine_is_stored_once() {
        let cell = OnceLock::new();
        assert!(store_engine(&cell, loaded()).is_ok());

        let err = store_engine(&cell, loaded()).unwrap_err();
        assert!(err.starts_with("Engine already initialized"));
        assert_eq!(cell.get().map(|l| l.active.len()), Some(1));
    }

    #[test]
    fn test_metadata_strings_are_terminated() {
        for s in [AUTHOR, NAME, VERSION] {
            assert_eq!(s.last(), Some(&0));
        }
    }
}
