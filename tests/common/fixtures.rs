//! Layer descriptors with known results

use std::sync::Arc;

use accelforge::capability::OperationKind;
use accelforge::tensor::{Buffer, DataType, OperandRole, Shape, TensorDesc};
use accelforge::transform::descriptor::{
    BIAS_VECTOR_INDEX_PARAM, POOLING_MODE_PARAM, POOLING_STRIDE_PARAM, POOLING_WINDOW_PARAM,
};
use accelforge::transform::{build_transform, OperationDescriptor, Parameter, Transform};
use accelforge::validator::Validator;

/// Output of [`affine_descriptor`] with biases `[10, -1]`
pub const AFFINE_EXPECTED: [i32; 4] = [46, 18, 71, 15];

/// 8 elements x 2 vectors, interleaved: vector 0 is 1..=8, vector 1 all ones
pub fn affine_input() -> TensorDesc {
    let values: Vec<i16> = (1..=8).flat_map(|e| [e, 1]).collect();
    TensorDesc::new(Shape::hw(8, 2), DataType::Int16, Buffer::from_i16(&values))
}

/// Row 0 all ones, row 1 all twos
pub fn affine_weights() -> TensorDesc {
    let values: Vec<i16> = (0..16).map(|i| if i < 8 { 1 } else { 2 }).collect();
    TensorDesc::new(Shape::hw(2, 8), DataType::Int16, Buffer::from_i16(&values))
}

pub fn affine_output() -> TensorDesc {
    TensorDesc::new(Shape::hw(2, 2), DataType::Int32, Buffer::zeroed(16))
}

/// Two-row affine layer; with biases `[10, -1]` it yields [`AFFINE_EXPECTED`]
pub fn affine_descriptor(biases: TensorDesc) -> OperationDescriptor {
    OperationDescriptor::new(OperationKind::Affine)
        .with_operand(OperandRole::Input, affine_input())
        .with_operand(OperandRole::Output, affine_output())
        .with_operand(OperandRole::Weights, affine_weights())
        .with_operand(OperandRole::Biases, biases)
}

pub fn int32_biases(values: &[i32]) -> TensorDesc {
    TensorDesc::new(
        Shape::h(values.len() as u32),
        DataType::Int32,
        Buffer::from_i32(values),
    )
}

/// Grouped biases `[[0, 100], [0, 200]]`
pub fn multibias_descriptor(index: u32) -> OperationDescriptor {
    OperationDescriptor::new(OperationKind::AffineMultiBias)
        .with_operand(OperandRole::Input, affine_input())
        .with_operand(OperandRole::Output, affine_output())
        .with_operand(OperandRole::Weights, affine_weights())
        .with_operand(
            OperandRole::Biases,
            TensorDesc::new(
                Shape::hw(2, 2),
                DataType::Int32,
                Buffer::from_i32(&[0, 100, 0, 200]),
            ),
        )
        .with_parameter(BIAS_VECTOR_INDEX_PARAM, Parameter::Index(index))
}

/// `positions x filters` Int16 input where value = position * 10 + filter
pub fn pooling_input(positions: u32, filters: u32) -> TensorDesc {
    let values: Vec<i16> = (0..positions)
        .flat_map(|w| (0..filters).map(move |d| (w * 10 + d) as i16))
        .collect();
    TensorDesc::new(
        Shape::wd(positions, filters),
        DataType::Int16,
        Buffer::from_i16(&values),
    )
}

pub fn pooling_output(positions: u32, filters: u32) -> TensorDesc {
    TensorDesc::new(
        Shape::wd(positions, filters),
        DataType::Int32,
        Buffer::zeroed((positions * filters * 4) as usize),
    )
}

/// Structured pooling parameters; `mode` is the raw value (1 max, 2 sum)
pub fn pooling_descriptor(
    mode: u32,
    window: u32,
    stride: u32,
    input: TensorDesc,
    output: TensorDesc,
) -> OperationDescriptor {
    OperationDescriptor::new(OperationKind::Pooling)
        .with_operand(OperandRole::Input, input)
        .with_operand(OperandRole::Output, output)
        .with_parameter(POOLING_MODE_PARAM, Parameter::PoolingMode(mode))
        .with_parameter(POOLING_WINDOW_PARAM, Parameter::Shape(Shape::w(window)))
        .with_parameter(POOLING_STRIDE_PARAM, Parameter::Shape(Shape::w(stride)))
}

/// Build with the default (newest) generation, panicking on failure
pub fn build(desc: &OperationDescriptor) -> Arc<dyn Transform> {
    let transform = build_transform(desc, &Validator::default())
        .expect("descriptor should be valid")
        .expect("transform should be enabled");
    Arc::from(transform)
}
