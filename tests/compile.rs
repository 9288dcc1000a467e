use mind_local::{
    Computation, ExecutableBuildOptions, Literal, LocalClient, LocalError, PrimitiveType,
    RuntimeConfig, Shape,
};

fn client(devices: usize) -> LocalClient {
    LocalClient::open_with_config("cpu", RuntimeConfig::default().with_platform("cpu", devices))
        .expect("open cpu")
}

fn scale_program() -> Computation {
    let mut c = Computation::new("scale");
    let x = c.parameter(0, Shape::array(PrimitiveType::F32, vec![2, 2]));
    let k = c.constant(Literal::scalar(3.0f32));
    let y = c.mul(x, k);
    c.output(y);
    c
}

#[test]
fn layouts_are_assigned_to_bare_shapes() {
    let client = client(1);
    let exe = client
        .compile(
            &scale_program(),
            &[Shape::array(PrimitiveType::F32, vec![2, 2])],
            &ExecutableBuildOptions::default(),
        )
        .expect("compile");
    let program = exe.program();
    assert_eq!(program.argument_layouts()[0].to_string(), "f32[2,2]{1,0}");
    assert_eq!(program.result_layout().to_string(), "f32[2,2]{1,0}");
    assert_eq!(exe.replica_count(), 1);
    assert_eq!(exe.device_ordinals(), vec![0]);
}

#[test]
fn explicit_layouts_are_kept() {
    let client = client(1);
    let column_major =
        Shape::array_with_layout(PrimitiveType::F32, vec![2, 2], vec![0, 1]).unwrap();
    let options = ExecutableBuildOptions::default().with_result_layout(column_major.clone());
    let exe = client
        .compile(&scale_program(), &[column_major.clone()], &options)
        .expect("compile");
    assert_eq!(exe.program().argument_layouts(), &[column_major.clone()]);
    assert_eq!(exe.program().result_layout(), &column_major);
}

#[test]
fn device_assignment_covers_requested_replicas() {
    let client = client(4);
    let options = ExecutableBuildOptions::default().with_num_replicas(3);
    let exe = client
        .compile(
            &scale_program(),
            &[Shape::array(PrimitiveType::F32, vec![2, 2])],
            &options,
        )
        .expect("compile");
    assert_eq!(exe.replica_count(), 3);
    assert_eq!(exe.device_ordinals(), vec![0, 1, 2]);
    assert_eq!(exe.device_assignment().computation_count(), 1);
}

#[test]
fn too_many_replicas_is_a_shape_error() {
    let client = client(2);
    let options = ExecutableBuildOptions::default().with_num_replicas(3);
    let err = client
        .compile(
            &scale_program(),
            &[Shape::array(PrimitiveType::F32, vec![2, 2])],
            &options,
        )
        .err()
        .expect("compile should fail");
    assert!(matches!(err, LocalError::Shape(_)));
}

#[test]
fn mismatched_argument_shape_is_rejected() {
    let client = client(1);
    let err = client
        .compile(
            &scale_program(),
            &[Shape::array(PrimitiveType::F32, vec![3])],
            &ExecutableBuildOptions::default(),
        )
        .err()
        .expect("compile should fail");
    assert!(matches!(err, LocalError::Compilation(_)));
}

#[test]
fn incompatible_result_layout_is_rejected() {
    let client = client(1);
    let options =
        ExecutableBuildOptions::default().with_result_layout(Shape::scalar(PrimitiveType::F32));
    let err = client
        .compile(
            &scale_program(),
            &[Shape::array(PrimitiveType::F32, vec![2, 2])],
            &options,
        )
        .err()
        .expect("compile should fail");
    assert!(matches!(err, LocalError::Compilation(_)));
}

#[test]
fn malformed_program_is_rejected() {
    let client = client(1);
    let mut c = Computation::new("no_output");
    c.replica_id();
    let err = client
        .compile(&c, &[], &ExecutableBuildOptions::default())
        .err()
        .expect("compile should fail");
    assert!(matches!(err, LocalError::Compilation(ref m) if m.contains("Output")));
}

#[test]
fn invalid_explicit_layout_is_rejected() {
    assert!(Shape::array_with_layout(PrimitiveType::F32, vec![2, 2], vec![0, 0]).is_err());
}
