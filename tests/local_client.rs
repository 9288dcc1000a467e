use std::time::Duration;

use mind_local::{LocalClient, LocalError, RuntimeConfig};

fn config(devices: usize) -> RuntimeConfig {
    RuntimeConfig::default().with_platform("cpu", devices)
}

#[test]
fn open_reports_device_count() {
    let client = LocalClient::open_with_config("cpu", config(2)).expect("open cpu");
    assert_eq!(client.platform_name(), "cpu");
    assert_eq!(client.device_count(), 2);
}

#[test]
fn host_is_an_alias_for_cpu() {
    let client = LocalClient::open_with_config("host", config(1)).expect("open host");
    assert_eq!(client.platform_name(), "cpu");
}

#[test]
fn open_fails_for_unknown_platform() {
    let err = LocalClient::open_with_config("tpu", config(1)).unwrap_err();
    assert!(matches!(err, LocalError::NoSuchPlatform(ref name) if name == "tpu"));
}

#[test]
fn open_fails_without_visible_devices() {
    let err = LocalClient::open_with_config("cpu", config(0)).unwrap_err();
    assert!(matches!(err, LocalError::NoVisibleDevices(_)));
    assert!(err.to_string().contains("no visible devices"));
}

#[test]
fn streams_are_reused_per_device() {
    let client = LocalClient::open_with_config("cpu", config(2)).expect("open cpu");
    let first_id = {
        let stream = client.borrow_stream(1).expect("borrow");
        assert_eq!(stream.device_ordinal(), 1);
        stream.id()
    };
    let again = client.borrow_stream(1).expect("borrow again");
    assert_eq!(again.id(), first_id);
    assert!(matches!(
        client.borrow_stream(2),
        Err(LocalError::InvalidArgument(_))
    ));
}

#[test]
fn clones_share_the_backend() {
    let client = LocalClient::open_with_config("cpu", config(1)).expect("open cpu");
    let clone = client.clone();
    let buffer = clone
        .transfer_to_device(&mind_local::Literal::scalar(1i32), 0)
        .expect("transfer");
    assert_eq!(client.memory_allocator().live_allocations(0), 1);
    drop(buffer);
    assert_eq!(client.memory_allocator().live_allocations(0), 0);
}

#[test]
fn open_rejects_a_zero_grace_period() {
    let err = LocalClient::open_with_config("cpu", config(2).with_deadlock_grace(Duration::ZERO))
        .unwrap_err();
    assert!(matches!(err, LocalError::Config(_)));

    let mut literal = config(1);
    literal.deadlock_grace_ms = 0;
    assert!(matches!(
        LocalClient::open_with_config("cpu", literal),
        Err(LocalError::Config(_))
    ));
}
