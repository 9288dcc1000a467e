use mind_local::{Literal, LocalClient, LocalError, RuntimeConfig};

fn client() -> LocalClient {
    LocalClient::open_with_config("cpu", RuntimeConfig::default()).expect("open cpu")
}

#[test]
fn destructure_returns_one_handle_per_element() {
    let client = client();
    let value = Literal::tuple(vec![
        Literal::scalar(3i32),
        Literal::tuple(vec![Literal::vector(&[1.0f32, 2.0]), Literal::pred(false)]),
        Literal::vector(&[7u32, 8, 9]),
    ]);
    let mut parent = client.transfer_to_device(&value, 0).expect("transfer");
    let allocator = client.memory_allocator();
    assert_eq!(allocator.live_allocations(0), 6);

    let children = parent.destructure_tuple().expect("destructure");
    assert_eq!(children.len(), 3);
    // Only the parent's own index table is freed.
    assert_eq!(allocator.live_allocations(0), 5);
    assert!(parent.is_empty());
    assert!(matches!(parent.to_literal(), Err(LocalError::InvalidArgument(_))));

    let expected = value.clone().decompose_tuple().unwrap();
    for (child, element) in children.iter().zip(&expected) {
        assert_eq!(child.device_ordinal().unwrap(), 0);
        assert_eq!(&child.to_literal().expect("read child"), element);
    }

    drop(children);
    drop(parent);
    assert_eq!(allocator.live_allocations(0), 0);
}

#[test]
fn nested_tuples_destructure_again() {
    let client = client();
    let value = Literal::tuple(vec![Literal::tuple(vec![
        Literal::scalar(1i64),
        Literal::scalar(2i64),
    ])]);
    let mut outer = client.transfer_to_device(&value, 0).expect("transfer");
    let mut inner = outer.destructure_tuple().expect("outer");
    let leaves = inner[0].destructure_tuple().expect("inner");
    let values: Vec<i64> = leaves
        .iter()
        .map(|leaf| leaf.to_literal().unwrap().get_scalar::<i64>().unwrap())
        .collect();
    assert_eq!(values, vec![1, 2]);
    drop(inner);
    drop(leaves);
    assert_eq!(client.memory_allocator().live_allocations(0), 0);
}

#[test]
fn non_tuple_is_rejected_and_stays_usable() {
    let client = client();
    let value = Literal::vector(&[1i32, 2]);
    let mut buffer = client.transfer_to_device(&value, 0).expect("transfer");
    let err = buffer.destructure_tuple().unwrap_err();
    assert!(matches!(err, LocalError::Shape(_)));
    assert!(!buffer.is_empty());
    assert_eq!(buffer.to_literal().unwrap(), value);
}

#[test]
fn empty_tuple_destructures_to_nothing() {
    let client = client();
    let mut buffer = client
        .transfer_to_device(&Literal::tuple(vec![]), 0)
        .expect("transfer");
    assert!(buffer.destructure_tuple().expect("destructure").is_empty());
    assert_eq!(client.memory_allocator().live_allocations(0), 0);
}
