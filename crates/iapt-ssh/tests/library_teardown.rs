//! Teardown is process-wide, so it gets a test binary of its own

use std::sync::Arc;

use iapt_core::error::TransportError;
use iapt_ssh::{transport, RusshBackend, SecureTransportSession};

#[test]
fn test_sessions_unavailable_after_teardown() {
    assert!(transport::initialize().is_ok());
    let existing = SecureTransportSession::new().unwrap();

    transport::teardown();
    transport::teardown();

    assert!(!transport::is_available());
    assert!(matches!(
        transport::initialize(),
        Err(TransportError::LibraryUnavailable(_))
    ));
    assert!(matches!(
        SecureTransportSession::new(),
        Err(TransportError::LibraryUnavailable(_))
    ));
    assert!(matches!(
        SecureTransportSession::with_backend(Arc::new(RusshBackend)),
        Err(TransportError::LibraryUnavailable(_))
    ));

    drop(existing);
}
