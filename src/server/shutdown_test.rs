//! Tests for coordinated shutdown

use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_signal_flips_on_shutdown() {
    let (controller, signal) = shutdown_channel();
    assert!(!signal.is_shutdown());

    controller.shutdown();
    assert!(signal.is_shutdown());
}

#[tokio::test]
async fn test_wait_resolves_after_shutdown() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
    });

    let waited = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(waited.is_ok(), "wait() did not resolve after shutdown");
    assert!(signal.is_shutdown());
}

#[tokio::test]
async fn test_wait_resolves_when_controller_dropped() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    let waited = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(waited.is_ok());
}

#[tokio::test]
async fn test_every_clone_observes_shutdown() {
    let (controller, signal) = shutdown_channel();
    let leader_loop = signal.clone();
    let reconciler = signal.clone();

    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(leader_loop.is_shutdown());
    assert!(reconciler.is_shutdown());
}

#[tokio::test]
async fn test_repeated_shutdown_keeps_signal_set() {
    let (controller, mut signal) = shutdown_channel();

    controller.shutdown();
    controller.shutdown();

    assert!(signal.is_shutdown());
    let waited = tokio::time::timeout(Duration::from_millis(100), signal.wait()).await;
    assert!(waited.is_ok());
}

#[tokio::test]
async fn test_wait_stays_pending_without_shutdown() {
    let (_controller, mut signal) = shutdown_channel();

    let waited = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
    assert!(waited.is_err());
}
