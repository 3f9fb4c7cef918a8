//! Immutable, operation-specific transforms
//!
//! A transform owns its validated operands, its output tensor and a kernel
//! configuration block built once at construction. Construction either
//! succeeds completely or fails with the first model error; nothing is
//! returned half-built.

pub mod affine;
pub mod descriptor;
pub mod pooling;

use std::fmt;

use crate::capability::OperationKind;
use crate::error::{AccelError, AccelResult, ConfigReason, Expectation, ItemRef, ModelError};
use crate::kernels::{AccelerationMode, ExecutionContext, KernelMode, KernelRegistry};
use crate::tensor::{Buffer, OperandRole, Tensor, TensorDesc};
use crate::validator::{expect_present, LayerValidator, Validator};

pub use affine::{AffineMulti, AffineSingle};
pub use descriptor::{ActiveList, BiasMode, LegacyPooling, OperationDescriptor, Parameter};
pub use pooling::PoolingFunction;

/// Buffer referenced by a layer, with the bytes the hardware may touch
#[derive(Debug, Clone)]
pub struct OperandBinding {
    pub role: OperandRole,
    pub buffer: Buffer,
    pub size: usize,
}

/// Hardware view of one transform, consumed by request building
#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    pub operation: OperationKind,
    pub kernel_mode: KernelMode,
    /// Operation-specific configuration words
    ///
    /// Affine: rows, vectors, elements, bias vector count, bias vector index.
    /// Pooling: mode, window, stride, positions, filters, output positions.
    pub config_words: Vec<u32>,
    pub operands: Vec<OperandBinding>,
}

/// Common surface of every transform variant
pub trait Transform: Send + Sync + fmt::Debug {
    fn operation(&self) -> OperationKind;

    fn input(&self) -> &Tensor;

    fn output(&self) -> &Tensor;

    /// Operand by role; roles the variant does not own are `OperandNotPresent`
    fn operand(&self, role: OperandRole) -> AccelResult<&Tensor> {
        match role {
            OperandRole::Input => Ok(self.input()),
            OperandRole::Output => Ok(self.output()),
            other => Err(AccelError::OperandNotPresent(other)),
        }
    }

    /// Run the resolved kernel for `accel`
    fn compute(
        &self,
        accel: AccelerationMode,
        active_list: Option<&ActiveList>,
        ctx: &mut ExecutionContext,
    ) -> AccelResult<()>;

    fn validate_active_list(&self, _list: &ActiveList) -> Result<(), ModelError> {
        Err(ModelError::new(
            ConfigReason::OperationUnsupported,
            ItemRef::operation(),
            Expectation::OneOf(vec![
                OperationKind::Affine.to_string(),
                OperationKind::AffineDiagonal.to_string(),
            ]),
            self.operation(),
        ))
    }

    fn layer_descriptor(&self) -> AccelResult<LayerDescriptor>;
}

/// Build a transform with the process-wide kernel registry
///
/// Returns `Ok(None)` only for pooling with pooling disabled.
pub fn build_transform(
    desc: &OperationDescriptor,
    validator: &Validator,
) -> AccelResult<Option<Box<dyn Transform>>> {
    build_transform_with(desc, validator, KernelRegistry::global())
}

pub fn build_transform_with(
    desc: &OperationDescriptor,
    validator: &Validator,
    registry: &KernelRegistry,
) -> AccelResult<Option<Box<dyn Transform>>> {
    let layer = validator.for_operation(desc.kind)?;
    let transform: Option<Box<dyn Transform>> = match desc.kind {
        OperationKind::Affine | OperationKind::AffineDiagonal => {
            Some(Box::new(AffineSingle::create(desc, &layer, registry)?))
        }
        OperationKind::AffineMultiBias => Some(Box::new(AffineMulti::create(desc, &layer, registry)?)),
        OperationKind::Pooling => PoolingFunction::create(desc, &layer, registry)?
            .map(|p| Box::new(p) as Box<dyn Transform>),
    };
    match &transform {
        Some(t) => tracing::debug!(
            "Built {} transform on {}: output {}",
            desc.kind,
            validator.generation(),
            t.output().shape()
        ),
        None => tracing::debug!("{} disabled, no transform built", desc.kind),
    }
    Ok(transform)
}

/// Operand description that must be supplied
pub(crate) fn required_operand(
    desc: &OperationDescriptor,
    role: OperandRole,
) -> Result<&TensorDesc, ModelError> {
    expect_present(desc.operand(role), ConfigReason::NullBuffer, ItemRef::operand(role))
}

/// Validate a required operand
pub(crate) fn validated_operand(
    desc: &OperationDescriptor,
    layer: &LayerValidator<'_>,
    role: OperandRole,
) -> Result<Tensor, ModelError> {
    layer.validate_tensor(required_operand(desc, role)?, role)
}

pub(crate) fn binding(tensor: &Tensor, role: OperandRole) -> AccelResult<OperandBinding> {
    Ok(OperandBinding {
        role,
        buffer: tensor.buffer()?.clone(),
        size: tensor.byte_len(),
    })
}
