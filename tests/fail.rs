use std::panic;

use threadkit::{error, ThreadError};

#[test]
fn pending_error_turns_fatal() {
    error::fail_if_error();

    error::set_error(ThreadError::Unsupported("frobnicate"));
    error::set_error(ThreadError::Panicked);
    let payload = panic::catch_unwind(error::fail_if_error).unwrap_err();
    assert_eq!(
        payload.downcast_ref::<String>().map(String::as_str),
        Some("frobnicate is not supported on this platform")
    );

    // still recorded for whoever looks after the fact
    assert_eq!(
        error::error_message().as_deref(),
        Some("frobnicate is not supported on this platform")
    );
    error::clear_error();
    error::fail_if_error();
}
