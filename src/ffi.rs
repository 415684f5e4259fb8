use crate::Core::fabric::{Endpoint, LocalFabric};
use crate::Deep::{Message, MessageBuilder};
use crate::error::{DeepCopyError, DeepResult};
use libc::{c_void, size_t};
use std::ptr;

// Error codes
pub const DMXP_SUCCESS: i32 = 0;
pub const DMXP_ERROR_NULL_POINTER: i32 = -1;
pub const DMXP_ERROR_INVALID_ARG: i32 = -2;
pub const DMXP_ERROR_ALLOCATION_FAILED: i32 = -3;
pub const DMXP_ERROR_TRANSPORT: i32 = -4;
pub const DMXP_ERROR_MANIFEST_MISMATCH: i32 = -5;
pub const DMXP_ERROR_INVALID_STATE: i32 = -6;

/// Handle to an in-process fabric (opaque pointer)
pub struct FabricHandle {
    inner: LocalFabric,
}

/// Handle to one rank of a fabric (opaque pointer)
pub struct EndpointHandle {
    inner: Endpoint,
}

/// Handle to a deep-copy message (opaque pointer)
///
/// Root records are owned by the caller and must outlive the handle.
pub struct MessageHandle {
    inner: Message<'static>,
}

fn status(result: DeepResult<()>) -> i32 {
    match result {
        Ok(()) => DMXP_SUCCESS,
        Err(e) => {
            log::warn!("FFI Error: {}", e);
            match e {
                DeepCopyError::Transport { .. } => DMXP_ERROR_TRANSPORT,
                DeepCopyError::ManifestMismatch { .. } => DMXP_ERROR_MANIFEST_MISMATCH,
                DeepCopyError::AllocationFailure { .. } => DMXP_ERROR_ALLOCATION_FAILED,
                DeepCopyError::InvalidDescriptor(_) => DMXP_ERROR_INVALID_ARG,
                DeepCopyError::InvalidState(_) => DMXP_ERROR_INVALID_STATE,
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Fabric API
// -----------------------------------------------------------------------------

/// Create a fabric connecting `ranks` endpoints.
///
/// # Returns
/// * Pointer to `FabricHandle`, or NULL when `ranks` is zero.
#[no_mangle]
pub extern "C" fn dmxp_fabric_new(ranks: u32) -> *mut FabricHandle {
    if ranks == 0 {
        return ptr::null_mut();
    }
    Box::into_raw(Box::new(FabricHandle {
        inner: LocalFabric::new(ranks),
    }))
}

/// Free a fabric handle. Endpoints already created stay usable.
#[no_mangle]
pub extern "C" fn dmxp_fabric_free(handle: *mut FabricHandle) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle); // Dropped automatically
        }
    }
}

/// Attach to `fabric` as `rank`.
///
/// # Returns
/// * Pointer to `EndpointHandle`, or NULL on failure.
#[no_mangle]
pub extern "C" fn dmxp_endpoint_new(fabric: *const FabricHandle, rank: u32) -> *mut EndpointHandle {
    if fabric.is_null() {
        return ptr::null_mut();
    }
    let fabric = unsafe { &(*fabric).inner };
    match fabric.endpoint(rank) {
        Ok(endpoint) => Box::into_raw(Box::new(EndpointHandle { inner: endpoint })),
        Err(e) => {
            log::warn!("FFI Error: Failed to attach endpoint: {}", e);
            ptr::null_mut()
        }
    }
}

/// Free an endpoint handle.
#[no_mangle]
pub extern "C" fn dmxp_endpoint_free(handle: *mut EndpointHandle) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle);
        }
    }
}

// -----------------------------------------------------------------------------
// Message API
// -----------------------------------------------------------------------------

/// Create an empty message.
///
/// # Arguments
/// * `verify_manifest` - Non-zero to exchange a manifest preamble.
#[no_mangle]
pub extern "C" fn dmxp_message_new(verify_manifest: i32) -> *mut MessageHandle {
    let inner = MessageBuilder::new()
        .with_manifest_check(verify_manifest != 0)
        .build();
    Box::into_raw(Box::new(MessageHandle { inner }))
}

/// Register a root record. Descriptors added afterwards apply to it.
///
/// # Arguments
/// * `record` - Record address; must stay valid until the message is freed.
/// * `size` - Record size in bytes.
/// * `align` - Record alignment (power of two).
#[no_mangle]
pub extern "C" fn dmxp_message_add_root(
    handle: *mut MessageHandle,
    record: *mut c_void,
    size: size_t,
    align: size_t,
) -> i32 {
    if handle.is_null() || record.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let message = unsafe { &mut (*handle).inner };
    status(unsafe { message.add_raw_root(record as *mut u8, size, align) }.map(|_| ()))
}

/// Append an Inline descriptor to the last root.
#[no_mangle]
pub extern "C" fn dmxp_message_add_inline(
    handle: *mut MessageHandle,
    offset: size_t,
    element_size: size_t,
    count: size_t,
) -> i32 {
    if handle.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let message = unsafe { &mut (*handle).inner };
    status(message.add_inline(offset, element_size, count))
}

/// Append an Indirection descriptor to the last root.
///
/// # Arguments
/// * `offset` - Offset of the pointer field.
/// * `element_size` - Size of one target element.
/// * `count` - Elements the sender transmits; ignored by receivers.
#[no_mangle]
pub extern "C" fn dmxp_message_add_indirection(
    handle: *mut MessageHandle,
    offset: size_t,
    element_size: size_t,
    count: size_t,
) -> i32 {
    if handle.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let message = unsafe { &mut (*handle).inner };
    status(message.add_indirection(offset, element_size, count))
}

/// Send the message to `peer` on `channel`. Blocks until every descriptor is sent.
#[no_mangle]
pub extern "C" fn dmxp_message_send(
    handle: *mut MessageHandle,
    endpoint: *const EndpointHandle,
    peer: u32,
    channel: u32,
) -> i32 {
    if handle.is_null() || endpoint.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let message = unsafe { &mut (*handle).inner };
    let endpoint = unsafe { &(*endpoint).inner };
    status(message.send(endpoint, peer, channel))
}

/// Receive into the registered roots from `peer` on `channel`.
#[no_mangle]
pub extern "C" fn dmxp_message_receive(
    handle: *mut MessageHandle,
    endpoint: *const EndpointHandle,
    peer: u32,
    channel: u32,
) -> i32 {
    if handle.is_null() || endpoint.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let message = unsafe { &mut (*handle).inner };
    let endpoint = unsafe { &(*endpoint).inner };
    status(message.receive(endpoint, peer, channel))
}

/// Element count received for descriptor `index` of root `root`.
#[no_mangle]
pub extern "C" fn dmxp_message_received_count(
    handle: *const MessageHandle,
    root: size_t,
    index: size_t,
    count: *mut size_t,
) -> i32 {
    if handle.is_null() || count.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let message = unsafe { &(*handle).inner };
    match message
        .roots
        .get(root)
        .and_then(|root| root.layout.fields().get(index))
    {
        Some(descriptor) => {
            unsafe { *count = descriptor.count };
            DMXP_SUCCESS
        }
        None => DMXP_ERROR_INVALID_ARG,
    }
}

/// Free every allocation the message made.
///
/// # Returns
/// * Number of allocations freed (0 on a second call), or a negative error code.
#[no_mangle]
pub extern "C" fn dmxp_message_release(handle: *mut MessageHandle) -> i64 {
    if handle.is_null() {
        return DMXP_ERROR_NULL_POINTER as i64;
    }
    let message = unsafe { &mut (*handle).inner };
    message.release() as i64
}

/// Free a message handle, releasing its allocations first.
#[no_mangle]
pub extern "C" fn dmxp_message_free(handle: *mut MessageHandle) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle);
        }
    }
}
