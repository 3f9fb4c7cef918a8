//! Transform construction, kernel resolution and active lists

mod common;

use accelforge::capability::{HwGeneration, OperationKind};
use accelforge::error::{AccelError, ConfigReason, Expectation, ItemKind, ItemRef, Status};
use accelforge::kernels::{AccelerationMode, ExecutionContext, KernelOp, KernelRegistry};
use accelforge::tensor::{Buffer, DataMode, DataType, Dim, OperandRole, Shape, TensorDesc};
use accelforge::transform::{build_transform, build_transform_with, ActiveList};
use accelforge::validator::Validator;
use common::*;

#[test]
fn test_affine_matches_reference_on_every_mode() -> anyhow::Result<()> {
    let transform = build(&affine_descriptor(int32_biases(&[10, -1])));
    for &accel in KernelRegistry::global().modes() {
        let mut ctx = ExecutionContext::new();
        transform.compute(accel, None, &mut ctx)?;
        assert_eq!(
            transform.output().buffer()?.to_i32_vec()?,
            AFFINE_EXPECTED.to_vec(),
            "mode {}",
            accel
        );
        assert_eq!(ctx.invocations(), 1);
    }
    Ok(())
}

#[test]
fn test_missing_acceleration_entry_is_not_implemented() {
    let generic_only = KernelRegistry::for_modes(&[AccelerationMode::Generic]);
    let desc = affine_descriptor(int32_biases(&[10, -1]));
    let transform = build_transform_with(&desc, &Validator::default(), &generic_only)
        .unwrap()
        .unwrap();

    let mut ctx = ExecutionContext::new();
    transform
        .compute(AccelerationMode::Generic, None, &mut ctx)
        .unwrap();
    let err = transform
        .compute(AccelerationMode::Avx2, None, &mut ctx)
        .unwrap_err();
    assert!(matches!(
        err,
        AccelError::NotImplemented {
            op: KernelOp::Affine,
            accel: AccelerationMode::Avx2,
            ..
        }
    ));
    assert_eq!(err.status(), Status::NotImplemented);
}

#[test]
fn test_unregistered_precision_fails_at_build() {
    // 16-bit input and weights with compound biases has no kernel
    let biases = TensorDesc::new(
        Shape::h(2),
        DataType::CompoundBias,
        Buffer::from_compound_bias(&[(1, 2), (0, 1)]),
    );
    let err = build_transform(&affine_descriptor(biases), &Validator::default()).unwrap_err();
    assert!(matches!(err, AccelError::NotImplemented { .. }));
}

#[test]
fn test_compound_bias_with_8bit_weights() {
    let weights: Vec<i8> = (0..16).map(|i| if i < 8 { 1 } else { 2 }).collect();
    let desc = affine_descriptor(TensorDesc::new(
        Shape::h(2),
        DataType::CompoundBias,
        Buffer::from_compound_bias(&[(1, 2), (0, 1)]),
    ))
    .with_operand(
        OperandRole::Weights,
        TensorDesc::new(Shape::hw(2, 8), DataType::Int8, Buffer::from_i8(&weights)),
    );
    let transform = build(&desc);
    let mut ctx = ExecutionContext::new();
    transform
        .compute(AccelerationMode::Generic, None, &mut ctx)
        .unwrap();
    assert_eq!(
        transform.output().buffer().unwrap().to_i32_vec().unwrap(),
        vec![73, 17, 72, 16]
    );
}

#[test]
fn test_operand_round_trip() {
    let desc = affine_descriptor(int32_biases(&[10, -1]));
    let transform = build(&desc);
    for role in [
        OperandRole::Input,
        OperandRole::Output,
        OperandRole::Weights,
        OperandRole::Biases,
    ] {
        let original = desc.operand(role).unwrap();
        let tensor = transform.operand(role).unwrap();
        assert_eq!(tensor.shape(), &original.shape);
        assert_eq!(tensor.mode(), original.mode);
        assert!(tensor
            .buffer()
            .unwrap()
            .same_as(original.buffer.as_ref().unwrap()));
        assert_eq!(tensor.item(), ItemRef::operand(role));
    }
}

#[test]
fn test_missing_operand_is_null_buffer() {
    let mut desc = affine_descriptor(int32_biases(&[10, -1]));
    desc.operands[OperandRole::Weights.index() as usize] = None;
    let err = model_error(build_transform(&desc, &Validator::default()).unwrap_err());
    assert_eq!(err.reason(), Some(ConfigReason::NullBuffer));
    assert_eq!(err.item, ItemRef::operand(OperandRole::Weights));
}

#[test]
fn test_too_small_buffer_rejected() {
    let desc = affine_descriptor(int32_biases(&[10, -1])).with_operand(
        OperandRole::Output,
        TensorDesc::new(Shape::hw(2, 2), DataType::Int32, Buffer::zeroed(8)),
    );
    let err = model_error(build_transform(&desc, &Validator::default()).unwrap_err());
    assert_eq!(err.reason(), Some(ConfigReason::BufferTooSmall));
    assert_eq!(err.expected, Expectation::AtLeast(16));
}

#[test]
fn test_disabled_weights_rejected_before_compute() {
    let weights = affine_weights().with_mode(DataMode::disabled());
    assert_eq!(weights.required_bytes(), 0);
    let desc = affine_descriptor(int32_biases(&[10, -1]))
        .with_operand(OperandRole::Weights, weights);

    let err = model_error(build_transform(&desc, &Validator::default()).unwrap_err());
    assert_eq!(err.reason(), Some(ConfigReason::WeightBytes));
    assert_eq!(err.item, ItemRef::operand(OperandRole::Weights));
}

#[test]
fn test_weight_buffer_sized_by_element_type() {
    // 2 x 8 Int16 weights in a buffer sized for Int8
    let weights = TensorDesc::new(Shape::hw(2, 8), DataType::Int16, Buffer::zeroed(16));
    assert_eq!(weights.mode.size(), 2);
    let desc = affine_descriptor(int32_biases(&[10, -1]))
        .with_operand(OperandRole::Weights, weights);

    let err = model_error(build_transform(&desc, &Validator::default()).unwrap_err());
    assert_eq!(err.reason(), Some(ConfigReason::BufferTooSmall));
    assert_eq!(err.item, ItemRef::operand(OperandRole::Weights));
    assert_eq!(err.expected, Expectation::AtLeast(32));
}

#[test]
fn test_error_names_offending_dimension() {
    // 12 elements is not a multiple of 8
    let desc = affine_descriptor(int32_biases(&[10, -1])).with_operand(
        OperandRole::Input,
        TensorDesc::new(Shape::hw(12, 2), DataType::Int16, Buffer::zeroed(48)),
    );
    let err = model_error(build_transform(&desc, &Validator::default()).unwrap_err());
    assert_eq!(err.status, Status::ModelConfigurationInvalid(ConfigReason::InputVolume));
    assert_eq!(err.item.kind, ItemKind::Operand);
    assert_eq!(err.item.index, Some(OperandRole::Input.index()));
    assert_eq!(err.item.dimension, Some(Dim::H));
    assert_eq!(err.expected, Expectation::MultipleOf(8));
}

#[test]
fn test_int8_input_needs_newer_generation() {
    let values: Vec<i8> = (1..=16).collect();
    let desc = affine_descriptor(int32_biases(&[10, -1])).with_operand(
        OperandRole::Input,
        TensorDesc::new(Shape::hw(8, 2), DataType::Int8, Buffer::from_i8(&values)),
    );
    let err = model_error(build_transform(&desc, &Validator::new(HwGeneration::V2)).unwrap_err());
    assert_eq!(err.reason(), Some(ConfigReason::InputBytes));
    assert!(build_transform(&desc, &Validator::new(HwGeneration::V3)).is_ok());
}

#[test]
fn test_active_list_count_bounds() {
    let transform = build(&affine_descriptor(int32_biases(&[10, -1])));
    let mut ctx = ExecutionContext::new();

    for list in [ActiveList::default(), ActiveList::new(vec![0, 1, 0])] {
        let err = transform
            .compute(AccelerationMode::Generic, Some(&list), &mut ctx)
            .unwrap_err();
        assert_eq!(err.status(), Status::ActiveListIndicesInvalid);
    }
    assert_eq!(ctx.invocations(), 0);

    transform
        .compute(AccelerationMode::Generic, Some(&ActiveList::new(vec![1])), &mut ctx)
        .unwrap();
    let out = transform.output().buffer().unwrap().to_i32_vec().unwrap();
    assert_eq!(&out[..2], &AFFINE_EXPECTED[2..]);
}

#[test]
fn test_active_list_requires_wide_biases() {
    let biases = TensorDesc::new(Shape::h(2), DataType::Int8, Buffer::from_i8(&[10, -1]));
    let transform = build(&affine_descriptor(biases));
    let mut ctx = ExecutionContext::new();

    transform
        .compute(AccelerationMode::Generic, None, &mut ctx)
        .unwrap();
    assert_eq!(
        transform.output().buffer().unwrap().to_i32_vec().unwrap(),
        AFFINE_EXPECTED.to_vec()
    );

    let err = transform
        .compute(AccelerationMode::Generic, Some(&ActiveList::new(vec![0])), &mut ctx)
        .unwrap_err();
    let err = model_error(err);
    assert_eq!(err.reason(), Some(ConfigReason::BiasBytes));
    assert_eq!(err.item, ItemRef::operand(OperandRole::Biases));
}

#[test]
fn test_multibias_with_weight_scales() {
    let desc = multibias_descriptor(1).with_operand(
        OperandRole::WeightScales,
        TensorDesc::new(
            Shape::h(2),
            DataType::CompoundBias,
            Buffer::from_compound_bias(&[(0, 2), (0, 1)]),
        ),
    );
    let transform = build(&desc);
    assert_eq!(transform.operation(), OperationKind::AffineMultiBias);
    assert!(transform.operand(OperandRole::WeightScales).is_ok());

    let mut ctx = ExecutionContext::new();
    transform
        .compute(AccelerationMode::Generic, None, &mut ctx)
        .unwrap();
    // row 0 doubled before its bias: 2 * 36 + 100, 2 * 8 + 100
    assert_eq!(
        transform.output().buffer().unwrap().to_i32_vec().unwrap(),
        vec![172, 116, 272, 216]
    );

    let words = transform.layer_descriptor().unwrap().config_words;
    assert_eq!(words, vec![2, 2, 8, 2, 1]);
}

#[test]
fn test_layer_descriptor_lists_operands() {
    let transform = build(&affine_descriptor(int32_biases(&[10, -1])));
    let layer = transform.layer_descriptor().unwrap();
    let roles: Vec<OperandRole> = layer.operands.iter().map(|b| b.role).collect();
    assert_eq!(
        roles,
        vec![
            OperandRole::Input,
            OperandRole::Output,
            OperandRole::Weights,
            OperandRole::Biases
        ]
    );
    assert_eq!(layer.operands[0].size, 32);
    assert_eq!(layer.config_words, vec![2, 2, 8, 1, 0]);
}
