// C ABI round trip: the same {a, arr, arrLen} record a C caller would describe by hand.
use dmxp_deepcopy::ffi::*;
use libc::c_void;
use memoffset::offset_of;
use std::mem::{align_of, size_of};
use std::ptr;

#[repr(C)]
struct Sample {
    a: i32,
    arr: *mut i32,
    arr_len: i32,
}

fn describe(msg: *mut MessageHandle, record: &mut Sample, count: usize) {
    let record = record as *mut Sample as *mut c_void;
    assert_eq!(
        dmxp_message_add_root(msg, record, size_of::<Sample>(), align_of::<Sample>()),
        DMXP_SUCCESS
    );
    assert_eq!(dmxp_message_add_inline(msg, offset_of!(Sample, a), 4, 1), DMXP_SUCCESS);
    assert_eq!(
        dmxp_message_add_indirection(msg, offset_of!(Sample, arr), 4, count),
        DMXP_SUCCESS
    );
    assert_eq!(
        dmxp_message_add_inline(msg, offset_of!(Sample, arr_len), 4, 1),
        DMXP_SUCCESS
    );
}

#[test]
fn test_ffi_round_trip() {
    let fabric = dmxp_fabric_new(2);
    assert!(!fabric.is_null());
    let tx = dmxp_endpoint_new(fabric, 0);
    let rx = dmxp_endpoint_new(fabric, 1);
    assert!(!tx.is_null() && !rx.is_null());
    assert!(dmxp_endpoint_new(fabric, 2).is_null());

    let mut data = vec![10, 20, 30];
    let mut source = Sample {
        a: 42,
        arr: data.as_mut_ptr(),
        arr_len: 3,
    };
    let tx_msg = dmxp_message_new(1);
    describe(tx_msg, &mut source, data.len());
    assert_eq!(dmxp_message_send(tx_msg, tx, 1, 0), DMXP_SUCCESS);
    assert_eq!(dmxp_message_release(tx_msg), 0);
    dmxp_message_free(tx_msg);

    let mut dest = Sample {
        a: 0,
        arr: ptr::null_mut(),
        arr_len: 0,
    };
    let rx_msg = dmxp_message_new(1);
    describe(rx_msg, &mut dest, 0);
    assert_eq!(dmxp_message_receive(rx_msg, rx, 0, 0), DMXP_SUCCESS);

    let mut count = 0usize;
    assert_eq!(dmxp_message_received_count(rx_msg, 0, 1, &mut count), DMXP_SUCCESS);
    assert_eq!(count, 3);
    assert_eq!(dmxp_message_received_count(rx_msg, 0, 7, &mut count), DMXP_ERROR_INVALID_ARG);
    assert_eq!(dest.a, 42);
    assert_eq!(dest.arr_len, 3);
    assert_eq!(unsafe { std::slice::from_raw_parts(dest.arr, count) }, &[10, 20, 30]);

    // A finished message cannot be reused.
    assert_eq!(dmxp_message_receive(rx_msg, rx, 0, 0), DMXP_ERROR_INVALID_STATE);

    assert_eq!(dmxp_message_release(rx_msg), 1);
    assert_eq!(dmxp_message_release(rx_msg), 0);
    assert!(dest.arr.is_null());
    dmxp_message_free(rx_msg);

    dmxp_endpoint_free(tx);
    dmxp_endpoint_free(rx);
    dmxp_fabric_free(fabric);
}

#[test]
fn test_ffi_errors() {
    assert_eq!(
        dmxp_message_add_inline(ptr::null_mut(), 0, 4, 1),
        DMXP_ERROR_NULL_POINTER
    );
    assert!(dmxp_fabric_new(0).is_null());

    let msg = dmxp_message_new(0);
    // No root yet.
    assert_eq!(dmxp_message_add_inline(msg, 0, 4, 1), DMXP_ERROR_INVALID_ARG);

    let mut record = [0u64; 2];
    let root = record.as_mut_ptr() as *mut c_void;
    assert_eq!(dmxp_message_add_root(msg, root, 16, 8), DMXP_SUCCESS);
    assert_eq!(dmxp_message_add_indirection(msg, 12, 4, 1), DMXP_ERROR_INVALID_ARG);
    assert_eq!(
        dmxp_message_add_indirection(msg, usize::MAX - 2, 4, 1),
        DMXP_ERROR_INVALID_ARG
    );
    assert_eq!(dmxp_message_add_inline(msg, 8, 8, 2), DMXP_ERROR_INVALID_ARG);
    dmxp_message_free(msg);

    // Manifest disagreement surfaces as its own code.
    let fabric = dmxp_fabric_new(2);
    let tx = dmxp_endpoint_new(fabric, 0);
    let rx = dmxp_endpoint_new(fabric, 1);
    let mut sent = [1u64, 2];
    let tx_msg = dmxp_message_new(0);
    dmxp_message_add_root(tx_msg, sent.as_mut_ptr() as *mut c_void, 16, 8);
    dmxp_message_add_inline(tx_msg, 0, 8, 2);
    assert_eq!(dmxp_message_send(tx_msg, tx, 1, 0), DMXP_SUCCESS);

    let mut got = [0u64; 2];
    let rx_msg = dmxp_message_new(0);
    dmxp_message_add_root(rx_msg, got.as_mut_ptr() as *mut c_void, 16, 8);
    dmxp_message_add_inline(rx_msg, 0, 8, 1);
    assert_eq!(
        dmxp_message_receive(rx_msg, rx, 0, 0),
        DMXP_ERROR_MANIFEST_MISMATCH
    );

    dmxp_message_free(tx_msg);
    dmxp_message_free(rx_msg);
    dmxp_endpoint_free(tx);
    dmxp_endpoint_free(rx);
    dmxp_fabric_free(fabric);
}
