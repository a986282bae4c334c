//! C ABI over [`xnode::Bridge`].
//!
//! Strings are UTF-8 and NUL-terminated. Every `*mut c_char` returned here
//! belongs to the caller until it is handed back to [`release_string`].
//! The bridge is created on first use from the `XNODE_*` environment.
use std::{
    borrow::Cow,
    ffi::{CStr, CString, c_char, c_int},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use once_cell::sync::OnceCell;
use tracing::error;
use xnode::{Bridge, tray::WindowProbe};

const INVALID_ARGUMENT: &str = "error:invalid argument";
const INTERNAL_PANIC: &str = "error:internal panic";

static BRIDGE: OnceCell<Result<Bridge, String>> = OnceCell::new();

fn bridge() -> Result<&'static Bridge, String> {
    BRIDGE
        .get_or_init(|| Bridge::from_env().map_err(|e| format!("{e:#}")))
        .as_ref()
        .map_err(|e| format!("error:bridge unavailable: {e}"))
}

/// Borrow a C string; `None` for null.
///
/// # Safety
/// `ptr` is null or points to a NUL-terminated string that outlives the
/// returned value.
unsafe fn arg<'a>(ptr: *const c_char) -> Option<Cow<'a, str>> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy())
    }
}

fn into_c(reply: String) -> *mut c_char {
    let c = CString::new(reply).unwrap_or_else(|e| {
        let mut bytes = e.into_vec();
        bytes.retain(|b| *b != 0);
        CString::new(bytes).unwrap_or_default()
    });
    c.into_raw()
}

/// Run `f` against the bridge, turning panics into a sentinel.
fn guarded(f: impl FnOnce(&Bridge) -> String) -> *mut c_char {
    let reply = catch_unwind(AssertUnwindSafe(|| match bridge() {
        Ok(bridge) => f(bridge),
        Err(reply) => reply,
    }))
    .unwrap_or_else(|_| {
        error!("panic crossed the C boundary");
        INTERNAL_PANIC.to_string()
    });
    into_c(reply)
}

fn guarded_int(fallback: c_int, f: impl FnOnce(&Bridge) -> c_int) -> c_int {
    catch_unwind(AssertUnwindSafe(|| bridge().map(f).unwrap_or(fallback))).unwrap_or(fallback)
}

macro_rules! required {
    ($ptr:expr) => {
        match unsafe { arg($ptr) } {
            Some(value) => value,
            None => return into_c(INVALID_ARGUMENT.to_string()),
        }
    };
}

/// # Safety
/// Every pointer is null or a valid NUL-terminated string. Only
/// `privileged_credential` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn write_config_files(
    worker_config_path: *const c_char,
    worker_config_content: *const c_char,
    service_descriptor_path: *const c_char,
    service_descriptor_content: *const c_char,
    registry_path: *const c_char,
    registry_content_json: *const c_char,
    privileged_credential: *const c_char,
) -> *mut c_char {
    let worker_path = required!(worker_config_path);
    let worker = required!(worker_config_content);
    let descriptor_path = required!(service_descriptor_path);
    let descriptor = required!(service_descriptor_content);
    let registry = required!(registry_path);
    let entries = required!(registry_content_json);
    let credential = unsafe { arg(privileged_credential) };
    guarded(|b| {
        b.write_config_files(
            &worker_path,
            &worker,
            &descriptor_path,
            &descriptor,
            &registry,
            &entries,
            credential.as_deref(),
        )
    })
}

/// # Safety
/// `node_id` is null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn start_node(node_id: *const c_char) -> *mut c_char {
    let id = required!(node_id);
    guarded(|b| b.start_node(&id))
}

/// # Safety
/// `node_id` is null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn stop_node(node_id: *const c_char) -> *mut c_char {
    let id = required!(node_id);
    guarded(|b| b.stop_node(&id))
}

/// 1 running, 0 stopped, -1 unknown (including a null id).
///
/// # Safety
/// `node_id` is null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn check_node_status(node_id: *const c_char) -> c_int {
    let Some(id) = (unsafe { arg(node_id) }) else {
        return -1;
    };
    guarded_int(-1, |b| b.check_node_status(&id))
}

#[unsafe(no_mangle)]
pub extern "C" fn init_worker_binary() -> *mut c_char {
    guarded(Bridge::init_worker_binary)
}

#[unsafe(no_mangle)]
pub extern "C" fn update_worker_binary() -> *mut c_char {
    guarded(Bridge::update_worker_binary)
}

#[unsafe(no_mangle)]
pub extern "C" fn is_downloading() -> c_int {
    guarded_int(0, Bridge::is_downloading)
}

/// # Safety
/// `privileged_credential` is null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn reset_all(privileged_credential: *const c_char) -> *mut c_char {
    let credential = unsafe { arg(privileged_credential) };
    guarded(|b| b.reset_all(credential.as_deref()))
}

/// # Safety
/// `action_name` is a valid NUL-terminated string; `credential` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn perform_action(
    action_name: *const c_char,
    credential: *const c_char,
) -> *mut c_char {
    let action = required!(action_name);
    let credential = unsafe { arg(credential) };
    guarded(|b| b.perform_action(&action, credential.as_deref()))
}

/// # Safety
/// All three pointers are valid NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn create_service_unit(
    name: *const c_char,
    executable_path: *const c_char,
    config_path: *const c_char,
) -> *mut c_char {
    let name = required!(name);
    let executable = required!(executable_path);
    let config = required!(config_path);
    guarded(|b| b.create_service_unit(&name, &executable, &config))
}

/// Free a string returned by this library. Null is ignored.
///
/// # Safety
/// `ptr` came from this library and has not been released yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn release_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

/// Host callback answering "is the main window minimized?" (non-zero = yes).
/// It is called from a bridge worker thread.
pub type IsMinimizedFn = extern "C" fn() -> c_int;

struct CallbackProbe(IsMinimizedFn);

impl WindowProbe for CallbackProbe {
    fn is_minimized(&self) -> bool {
        (self.0)() != 0
    }
}

/// Start the tray relay. With a callback the relay also polls the window
/// state itself.
#[unsafe(no_mangle)]
pub extern "C" fn init_tray(is_minimized: Option<IsMinimizedFn>) -> *mut c_char {
    let probe = is_minimized.map(|f| Arc::new(CallbackProbe(f)) as Arc<dyn WindowProbe>);
    guarded(|b| b.init_tray(probe))
}

/// Forward `show`, `quit`, `minimized` or `restored`.
///
/// # Safety
/// `signal` is a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tray_signal(signal: *const c_char) -> *mut c_char {
    let signal = required!(signal);
    guarded(|b| b.tray_signal(&signal))
}

/// `show`, `hide`, `quit`, or an empty string when nothing is pending.
#[unsafe(no_mangle)]
pub extern "C" fn next_tray_intent() -> *mut c_char {
    guarded(Bridge::next_tray_intent)
}
