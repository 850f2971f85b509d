//! Fax Runtime Library
//!
//! C ABI over FGC for compiled programs. Every call takes the handle
//! returned by `fax_gc_init`; pointers cross the boundary as raw colored
//! pointer words (`0` is null).
//!
//! Failing calls return null, `0` or `false` and leave a message for
//! `fax_gc_last_error` on the calling thread.

use std::cell::RefCell;
use std::ffi::CString;
use std::ptr;

use fgc::{ColoredPointer, FgcError, GarbageCollector, GcConfig, GcGeneration};
use libc::c_char;

/// Opaque collector handle
pub struct FgcHandle {
    gc: GarbageCollector,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(err: &FgcError) {
    log::debug!("FGC call failed: {}", err);
    let message = CString::new(err.to_string()).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn handle_ref<'a>(handle: *mut FgcHandle) -> Option<&'a FgcHandle> {
    // SAFETY: callers pass a handle from fax_gc_init that was not shut down
    let handle = unsafe { handle.as_ref() };
    if handle.is_none() {
        set_last_error(&FgcError::InvalidArgument("null GC handle".to_string()));
    }
    handle
}

fn pointer_result(result: fgc::Result<ColoredPointer>) -> usize {
    match result {
        Ok(pointer) => pointer.raw(),
        Err(err) => {
            set_last_error(&err);
            0
        }
    }
}

fn unit_result(result: fgc::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            set_last_error(&err);
            false
        }
    }
}

/// Create a collector with `max_heap_bytes` of heap and `thread_count`
/// marking threads (`0` picks the default)
///
/// Returns null on a configuration error.
#[no_mangle]
pub extern "C" fn fax_gc_init(max_heap_bytes: usize, thread_count: usize) -> *mut FgcHandle {
    match GarbageCollector::new(GcConfig::for_heap(max_heap_bytes, thread_count)) {
        Ok(gc) => Box::into_raw(Box::new(FgcHandle { gc })),
        Err(err) => {
            set_last_error(&err);
            ptr::null_mut()
        }
    }
}

/// Message of the last failed call on this thread, or null
///
/// The string stays valid until the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn fax_gc_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(ptr::null(), |message| message.as_ptr())
    })
}

#[no_mangle]
pub extern "C" fn fax_gc_alloc(handle: *mut FgcHandle, size: usize) -> usize {
    match handle_ref(handle) {
        Some(handle) => pointer_result(handle.gc.allocate(size)),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn fax_gc_alloc_zeroed(handle: *mut FgcHandle, size: usize) -> usize {
    match handle_ref(handle) {
        Some(handle) => pointer_result(handle.gc.allocate_zeroed(size)),
        None => 0,
    }
}

/// Allocate an object whose first `ref_slots` words hold references
#[no_mangle]
pub extern "C" fn fax_gc_alloc_object(handle: *mut FgcHandle, size: usize, ref_slots: usize) -> usize {
    match handle_ref(handle) {
        Some(handle) => pointer_result(handle.gc.allocate_object(size, ref_slots)),
        None => 0,
    }
}

/// Register a word-sized slot holding a colored pointer as a root
///
/// # Safety
///
/// `slot` must stay valid and word-aligned until it is unregistered.
#[no_mangle]
pub unsafe extern "C" fn fax_gc_register_root(handle: *mut FgcHandle, slot: *mut usize) -> bool {
    match handle_ref(handle) {
        Some(handle) => unit_result(handle.gc.register_root(slot as usize)),
        None => false,
    }
}

#[no_mangle]
pub extern "C" fn fax_gc_unregister_root(handle: *mut FgcHandle, slot: *mut usize) -> bool {
    match handle_ref(handle) {
        Some(handle) => unit_result(handle.gc.unregister_root(slot as usize)),
        None => false,
    }
}

#[no_mangle]
pub extern "C" fn fax_gc_load_ref(handle: *mut FgcHandle, object: usize, slot: usize) -> usize {
    match handle_ref(handle) {
        Some(handle) => pointer_result(
            handle
                .gc
                .load_ref(ColoredPointer::from_raw(object), slot),
        ),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn fax_gc_store_ref(
    handle: *mut FgcHandle,
    object: usize,
    slot: usize,
    value: usize,
) -> bool {
    match handle_ref(handle) {
        Some(handle) => unit_result(handle.gc.store_ref(
            ColoredPointer::from_raw(object),
            slot,
            ColoredPointer::from_raw(value),
        )),
        None => false,
    }
}

/// Heal a pointer held outside the heap
#[no_mangle]
pub extern "C" fn fax_gc_resolve(handle: *mut FgcHandle, pointer: usize) -> usize {
    match handle_ref(handle) {
        Some(handle) => pointer_result(handle.gc.resolve(ColoredPointer::from_raw(pointer))),
        None => 0,
    }
}

/// Run a collection and wait for it; `0` is young, anything else full
#[no_mangle]
pub extern "C" fn fax_gc_collect(handle: *mut FgcHandle, generation: u32) -> bool {
    let generation = if generation == 0 {
        GcGeneration::Young
    } else {
        GcGeneration::Full
    };
    match handle_ref(handle) {
        Some(handle) => unit_result(handle.gc.collect(generation)),
        None => false,
    }
}

/// Metrics snapshot as a JSON string; release it with `fax_gc_free_string`
#[no_mangle]
pub extern "C" fn fax_gc_metrics(handle: *mut FgcHandle) -> *mut c_char {
    let Some(handle) = handle_ref(handle) else {
        return ptr::null_mut();
    };
    let json = match handle.gc.metrics().to_json() {
        Ok(json) => json,
        Err(err) => {
            set_last_error(&FgcError::invalid_state("serializable metrics", err.to_string()));
            return ptr::null_mut();
        }
    };
    CString::new(json).map_or(ptr::null_mut(), CString::into_raw)
}

/// # Safety
///
/// `text` must come from `fax_gc_metrics` and be freed only once.
#[no_mangle]
pub unsafe extern "C" fn fax_gc_free_string(text: *mut c_char) {
    if !text.is_null() {
        drop(CString::from_raw(text));
    }
}

/// Release the heap and free the handle
///
/// # Safety
///
/// `handle` must come from `fax_gc_init` and is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn fax_gc_shutdown(handle: *mut FgcHandle) -> bool {
    if handle.is_null() {
        return false;
    }
    let handle = Box::from_raw(handle);
    unit_result(handle.gc.shutdown())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    const MB: usize = 1024 * 1024;

    fn last_error() -> String {
        let message = fax_gc_last_error();
        assert!(!message.is_null());
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let handle = fax_gc_init(0, 1);
        assert!(handle.is_null());
        assert!(last_error().contains("Configuration"));
    }

    #[test]
    fn test_linked_objects_survive_collection() {
        let handle = fax_gc_init(8 * MB, 1);
        assert!(!handle.is_null());

        let mut root: usize = fax_gc_alloc_object(handle, 16, 1);
        assert_ne!(root, 0);
        unsafe { assert!(fax_gc_register_root(handle, &mut root)) };
        let child = fax_gc_alloc_zeroed(handle, 32);
        assert!(fax_gc_store_ref(handle, root, 0, child));

        assert!(fax_gc_collect(handle, 0));
        assert!(fax_gc_collect(handle, 1));

        let parent = fax_gc_resolve(handle, root);
        assert_ne!(fax_gc_load_ref(handle, parent, 0), 0);
        assert!(fax_gc_unregister_root(handle, &mut root));
        unsafe { assert!(fax_gc_shutdown(handle)) };
    }

    #[test]
    fn test_errors_reported_through_last_error() {
        let handle = fax_gc_init(8 * MB, 1);
        assert_eq!(fax_gc_alloc(handle, 0), 0);
        assert!(last_error().contains("Invalid argument"));
        assert_eq!(fax_gc_load_ref(handle, 0x10, 0), 0);
        assert_eq!(fax_gc_alloc(ptr::null_mut(), 8), 0);
        assert!(last_error().contains("null GC handle"));
        unsafe { assert!(fax_gc_shutdown(handle)) };
    }

    #[test]
    fn test_metrics_json() {
        let handle = fax_gc_init(8 * MB, 1);
        assert!(fax_gc_collect(handle, 1));
        let text = fax_gc_metrics(handle);
        assert!(!text.is_null());
        let json = unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned();
        assert!(json.contains("\"cycles\":1"));
        unsafe {
            fax_gc_free_string(text);
            assert!(fax_gc_shutdown(handle));
        }
    }
}
