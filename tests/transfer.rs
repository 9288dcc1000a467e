use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mind_local::{Literal, LocalClient, LocalError, PlatformConfig, RuntimeConfig};

fn client(devices: usize) -> LocalClient {
    LocalClient::open_with_config("cpu", RuntimeConfig::default().with_platform("cpu", devices))
        .expect("open cpu")
}

fn nested_value() -> Literal {
    Literal::tuple(vec![
        Literal::scalar(1.5f32),
        Literal::tuple(vec![
            Literal::vector(&[1i32, 2, 3]),
            Literal::tuple(vec![]),
            Literal::pred(true),
        ]),
        Literal::array(vec![2, 3], &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
        Literal::scalar(u32::MAX),
        Literal::scalar(-7i64),
    ])
}

#[test]
fn scalars_arrays_and_tuples_round_trip() {
    let client = client(1);
    let values = vec![
        Literal::scalar(42i32),
        Literal::vector(&[0.25f32, -1.0, 8.0]),
        Literal::array(vec![3, 2], &[1u32, 2, 3, 4, 5, 6]).unwrap(),
        Literal::tuple(vec![]),
        nested_value(),
    ];
    for value in values {
        let buffer = client.transfer_to_device(&value, 0).expect("transfer");
        assert_eq!(buffer.device_ordinal().unwrap(), 0);
        assert!(buffer.shape().unwrap().compatible(&value.shape()));
        assert_eq!(buffer.to_literal().expect("read back"), value);
    }
}

#[test]
fn device_shape_carries_row_major_layout() {
    let client = client(1);
    let value = Literal::array(vec![2, 3], &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let buffer = client.transfer_to_device(&value, 0).expect("transfer");
    assert_eq!(buffer.on_device_shape().unwrap().to_string(), "f64[2,3]{1,0}");
}

#[test]
fn tuple_allocations_include_index_tables() {
    let client = client(1);
    let buffer = client.transfer_to_device(&nested_value(), 0).expect("transfer");
    // One allocation per subshape, tuple index tables included.
    let subshapes = buffer.on_device_shape().unwrap().subshapes().len();
    assert_eq!(client.memory_allocator().live_allocations(0), subshapes);
    drop(buffer);
    assert_eq!(client.memory_allocator().live_allocations(0), 0);
    assert_eq!(client.memory_allocator().bytes_in_use(0), 0);
}

#[test]
fn bad_device_ordinal_is_rejected() {
    let client = client(2);
    let err = client.transfer_to_device(&Literal::scalar(1i32), 2).unwrap_err();
    assert!(matches!(err, LocalError::InvalidArgument(_)));
}

#[test]
fn batch_matches_sequential_transfers() {
    let client = client(2);
    let items: Vec<(Literal, usize)> = vec![
        (Literal::scalar(1i32), 0),
        (Literal::vector(&[2.0f32, 3.0]), 1),
        (nested_value(), 0),
        (Literal::tuple(vec![Literal::scalar(9u32)]), 1),
    ];
    let batch = client.transfer_to_device_batch(&items).expect("batch");
    assert_eq!(batch.len(), items.len());
    for (buffer, (value, ordinal)) in batch.iter().zip(&items) {
        let single = client.transfer_to_device(value, *ordinal).expect("single");
        assert_eq!(buffer.device_ordinal().unwrap(), *ordinal);
        assert_eq!(buffer.on_device_shape().unwrap(), single.on_device_shape().unwrap());
        assert_eq!(buffer.to_literal().unwrap(), single.to_literal().unwrap());
    }
}

#[test]
fn batch_waits_for_every_stream_before_returning() {
    let client = client(2);
    let drained = Arc::new(AtomicBool::new(false));
    {
        // Leave a slow task queued on device 1's only idle stream.
        let stream = client.borrow_stream(1).expect("borrow");
        let flag = Arc::clone(&drained);
        stream
            .enqueue(move || {
                std::thread::sleep(Duration::from_millis(300));
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .expect("enqueue");
    }

    let started = Instant::now();
    let items = vec![
        (Literal::vector(&[1i32, 2, 3]), 0),
        (Literal::scalar(4.0f64), 1),
    ];
    let batch = client.transfer_to_device_batch(&items).expect("batch");
    assert!(drained.load(Ordering::SeqCst));
    assert!(started.elapsed() >= Duration::from_millis(250));
    for (buffer, (value, _)) in batch.iter().zip(&items) {
        assert_eq!(&buffer.to_literal().unwrap(), value);
    }

    let backend = client.backend();
    assert_eq!(backend.stream_pool(0).unwrap().idle_count(), 1);
    assert_eq!(backend.stream_pool(1).unwrap().idle_count(), 1);
}

#[test]
fn empty_batch_returns_immediately() {
    let client = client(1);
    let batch = client.transfer_to_device_batch(&[]).expect("empty batch");
    assert!(batch.is_empty());
}

#[test]
fn batch_with_a_bad_ordinal_fails_without_leaking() {
    let client = client(2);
    let items = vec![(Literal::scalar(1i32), 0), (Literal::scalar(2i32), 5)];
    let err = client.transfer_to_device_batch(&items).unwrap_err();
    assert!(matches!(err, LocalError::InvalidArgument(_)));
    assert_eq!(client.memory_allocator().live_allocations(0), 0);
    assert_eq!(client.memory_allocator().live_allocations(1), 0);
}

#[test]
fn batch_allocation_failure_releases_completed_items() {
    let mut config = RuntimeConfig::default();
    config.platforms.insert(
        "cpu".to_string(),
        PlatformConfig {
            device_count: 2,
            memory_limit_bytes: Some(64),
        },
    );
    let client = LocalClient::open_with_config("cpu", config).expect("open cpu");
    let items = vec![
        (Literal::vector(&[1.0f32; 4]), 0),
        (Literal::vector(&[1.0f64; 32]), 1),
        (Literal::scalar(3i32), 1),
    ];
    let err = client.transfer_to_device_batch(&items).unwrap_err();
    assert!(matches!(err, LocalError::Transfer(ref m) if m.contains("resource exhausted")));
    assert_eq!(client.memory_allocator().live_allocations(0), 0);
    assert_eq!(client.memory_allocator().live_allocations(1), 0);
}

#[test]
fn released_buffer_cannot_be_read() {
    let client = client(1);
    let mut buffer = client.transfer_to_device(&Literal::scalar(5i64), 0).expect("transfer");
    let owned = buffer.release().expect("release");
    assert!(buffer.is_empty());
    assert!(matches!(buffer.to_literal(), Err(LocalError::InvalidArgument(_))));
    assert!(matches!(buffer.release(), Err(LocalError::InvalidArgument(_))));
    assert_eq!(client.memory_allocator().live_allocations(0), 1);
    drop(owned);
    assert_eq!(client.memory_allocator().live_allocations(0), 0);
}
