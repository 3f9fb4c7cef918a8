//! Stateless validation of operands and parameters against capability entries
//!
//! Every check takes the [`ItemRef`] it reports against, so a failure always
//! names the operand or parameter that caused it. Validation never mutates
//! state and never touches hardware.
//!
//! Check order for a tensor is fixed: layout, each dimension in layout order
//! (range, then multiple), data type, buffer presence, buffer size.

use std::fmt;

use crate::capability::{CapabilityTable, HwGeneration, OperationKind, RangeLimit, TensorLimits};
use crate::error::{ConfigReason, Expectation, ItemRef, ModelError};
use crate::tensor::{OperandRole, Shape, Tensor, TensorDesc};

/// Value must lie in `limit` (min, max, then multiple)
pub fn expect_in_range(value: u32, limit: &RangeLimit, item: ItemRef) -> Result<(), ModelError> {
    if value < limit.min {
        return Err(ModelError::new(
            limit.reason,
            item,
            Expectation::AtLeast(limit.min.into()),
            value,
        ));
    }
    if value > limit.max {
        return Err(ModelError::new(
            limit.reason,
            item,
            Expectation::AtMost(limit.max.into()),
            value,
        ));
    }
    if limit.multiple > 1 && value % limit.multiple != 0 {
        return Err(ModelError::new(
            limit.reason,
            item,
            Expectation::MultipleOf(limit.multiple.into()),
            value,
        ));
    }
    Ok(())
}

/// Value must equal the extent of a coupled operand
pub fn expect_equal(
    value: u32,
    expected: u32,
    reason: ConfigReason,
    item: ItemRef,
) -> Result<(), ModelError> {
    if value != expected {
        return Err(ModelError::new(
            reason,
            item,
            Expectation::Equal(expected.into()),
            value,
        ));
    }
    Ok(())
}

pub fn expect_in_set<T>(value: T, set: &[T], reason: ConfigReason, item: ItemRef) -> Result<(), ModelError>
where
    T: PartialEq + fmt::Display,
{
    if set.contains(&value) {
        return Ok(());
    }
    Err(ModelError::new(
        reason,
        item,
        Expectation::OneOf(set.iter().map(|v| v.to_string()).collect()),
        value,
    ))
}

pub fn expect_present<T>(value: Option<T>, reason: ConfigReason, item: ItemRef) -> Result<T, ModelError> {
    value.ok_or_else(|| ModelError::new(reason, item, Expectation::Present, "none"))
}

/// Shape must carry exactly the dims of `limits.layout`
pub fn expect_layout(shape: &Shape, limits: &TensorLimits, item: ItemRef) -> Result<(), ModelError> {
    let layout = &limits.layout;
    let matches =
        shape.rank() == layout.rank() && layout.dims().iter().all(|dim| shape.contains(*dim));
    if !matches {
        return Err(ModelError::new(
            ConfigReason::ShapeRankInvalid,
            item,
            Expectation::Layout(layout.to_string()),
            shape.layout(),
        ));
    }
    Ok(())
}

/// Capability validator for one hardware generation
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    generation: HwGeneration,
    table: &'static CapabilityTable,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(HwGeneration::default())
    }
}

impl Validator {
    pub fn new(generation: HwGeneration) -> Self {
        Self {
            generation,
            table: CapabilityTable::global(),
        }
    }

    pub fn generation(&self) -> HwGeneration {
        self.generation
    }

    /// Narrow to one operation; fails when the generation cannot run it
    pub fn for_operation(&self, kind: OperationKind) -> Result<LayerValidator<'_>, ModelError> {
        if kind.since() > self.generation {
            return Err(ModelError::new(
                ConfigReason::OperationUnsupported,
                ItemRef::operation(),
                Expectation::OneOf(
                    OperationKind::ALL
                        .iter()
                        .filter(|k| k.since() <= self.generation)
                        .map(|k| k.to_string())
                        .collect(),
                ),
                kind,
            ));
        }
        Ok(LayerValidator {
            validator: self,
            kind,
        })
    }
}

/// Validator bound to one operation kind
#[derive(Debug, Clone, Copy)]
pub struct LayerValidator<'a> {
    validator: &'a Validator,
    kind: OperationKind,
}

impl<'a> LayerValidator<'a> {
    pub fn operation(&self) -> OperationKind {
        self.kind
    }

    pub fn generation(&self) -> HwGeneration {
        self.validator.generation
    }

    pub fn limits(&self, role: OperandRole) -> Result<&'static TensorLimits, ModelError> {
        self.validator
            .table
            .lookup(self.kind, role, self.validator.generation)
            .ok_or_else(|| {
                ModelError::new(
                    ConfigReason::OperationUnsupported,
                    ItemRef::operand(role),
                    Expectation::Present,
                    format!("no {} capability for {}", role, self.kind),
                )
            })
    }

    /// Validate one operand, reporting the first violation
    pub fn validate_tensor(&self, desc: &TensorDesc, role: OperandRole) -> Result<Tensor, ModelError> {
        match self.run_checks(desc, role, true).into_iter().next() {
            Some(err) => {
                tracing::debug!("{} operand rejected: {}", self.kind, err);
                Err(err)
            }
            None => Ok(Tensor::from_validated(desc, ItemRef::operand(role))),
        }
    }

    /// Run every check and return all violations, in check order
    pub fn diagnose_tensor(&self, desc: &TensorDesc, role: OperandRole) -> Vec<ModelError> {
        self.run_checks(desc, role, false)
    }

    fn run_checks(&self, desc: &TensorDesc, role: OperandRole, first_only: bool) -> Vec<ModelError> {
        let item = ItemRef::operand(role);
        let limits = match self.limits(role) {
            Ok(limits) => limits,
            Err(err) => return vec![err],
        };

        let mut errors = Vec::new();
        let mut record = |result: Result<(), ModelError>| -> bool {
            if let Err(err) = result {
                errors.push(err);
                return first_only;
            }
            false
        };

        if record(expect_layout(&desc.shape, limits, item)) {
            return errors;
        }
        for (dim, limit) in &limits.dims {
            if record(expect_in_range(desc.shape.at(*dim), limit, item.at_dim(*dim))) {
                return errors;
            }
        }
        if record(expect_in_set(
            desc.mode.data_type(),
            &limits.data_types.allowed,
            limits.data_types.reason,
            item,
        )) {
            return errors;
        }
        match &desc.buffer {
            None => {
                record(Err(ModelError::new(
                    ConfigReason::NullBuffer,
                    item,
                    Expectation::Present,
                    "none",
                )));
            }
            Some(buffer) => {
                let required = desc.required_bytes();
                if (buffer.len() as u64) < required {
                    record(Err(ModelError::new(
                        ConfigReason::BufferTooSmall,
                        item,
                        Expectation::AtLeast(required),
                        buffer.len(),
                    )));
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::tensor::{Buffer, DataType, Dim};

    fn input(h: u32, w: u32, data_type: DataType) -> TensorDesc {
        let bytes = (h * w * data_type.size()) as usize;
        TensorDesc::new(Shape::hw(h, w), data_type, Buffer::zeroed(bytes))
    }

    #[test]
    fn test_valid_affine_input() {
        let validator = Validator::new(HwGeneration::V3);
        let layer = validator.for_operation(OperationKind::Affine).unwrap();
        let tensor = layer
            .validate_tensor(&input(16, 2, DataType::Int16), OperandRole::Input)
            .unwrap();
        assert_eq!(tensor.shape(), &Shape::hw(16, 2));
        assert_eq!(tensor.item(), ItemRef::operand(OperandRole::Input));
    }

    #[test]
    fn test_multiple_of_violation_names_dimension() {
        let validator = Validator::new(HwGeneration::V3);
        let layer = validator.for_operation(OperationKind::Affine).unwrap();
        let err = layer
            .validate_tensor(&input(12, 1, DataType::Int16), OperandRole::Input)
            .unwrap_err();
        assert_eq!(err.reason(), Some(ConfigReason::InputVolume));
        assert_eq!(err.item.dimension, Some(Dim::H));
        assert_eq!(err.expected, Expectation::MultipleOf(8));
    }

    #[test]
    fn test_int8_input_requires_v3() {
        let desc = input(16, 1, DataType::Int8);
        let v1 = Validator::new(HwGeneration::V1);
        let err = v1
            .for_operation(OperationKind::Affine)
            .unwrap()
            .validate_tensor(&desc, OperandRole::Input)
            .unwrap_err();
        assert_eq!(err.reason(), Some(ConfigReason::InputBytes));

        let v3 = Validator::new(HwGeneration::V3);
        assert!(v3
            .for_operation(OperationKind::Affine)
            .unwrap()
            .validate_tensor(&desc, OperandRole::Input)
            .is_ok());
    }

    #[test]
    fn test_operation_unsupported_on_generation() {
        let err = Validator::new(HwGeneration::V1)
            .for_operation(OperationKind::AffineMultiBias)
            .unwrap_err();
        assert_eq!(
            err.status,
            Status::ModelConfigurationInvalid(ConfigReason::OperationUnsupported)
        );
    }

    #[test]
    fn test_layout_checked_first() {
        let validator = Validator::new(HwGeneration::V3);
        let layer = validator.for_operation(OperationKind::Affine).unwrap();
        let desc = TensorDesc::unbound(Shape::h(3), DataType::Int8);
        let err = layer.validate_tensor(&desc, OperandRole::Input).unwrap_err();
        assert_eq!(err.reason(), Some(ConfigReason::ShapeRankInvalid));
    }

    #[test]
    fn test_diagnose_reports_every_violation_in_order() {
        let validator = Validator::new(HwGeneration::V3);
        let layer = validator.for_operation(OperationKind::Affine).unwrap();
        let desc = TensorDesc::unbound(Shape::hw(4, 9), DataType::Int32);
        let errors = layer.diagnose_tensor(&desc, OperandRole::Input);
        let reasons: Vec<_> = errors.iter().filter_map(|e| e.reason()).collect();
        assert_eq!(
            reasons,
            vec![
                ConfigReason::InputVolume,
                ConfigReason::Grouping,
                ConfigReason::InputBytes,
                ConfigReason::NullBuffer,
            ]
        );
        let first = layer.validate_tensor(&desc, OperandRole::Input).unwrap_err();
        assert_eq!(first, errors[0]);
    }

    #[test]
    fn test_buffer_too_small() {
        let validator = Validator::new(HwGeneration::V3);
        let layer = validator.for_operation(OperationKind::Affine).unwrap();
        let desc = TensorDesc::new(Shape::hw(8, 1), DataType::Int16, Buffer::zeroed(4));
        let err = layer.validate_tensor(&desc, OperandRole::Input).unwrap_err();
        assert_eq!(err.reason(), Some(ConfigReason::BufferTooSmall));
        assert_eq!(err.expected, Expectation::AtLeast(16));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let validator = Validator::new(HwGeneration::V2);
        let layer = validator.for_operation(OperationKind::Affine).unwrap();
        let desc = input(24, 3, DataType::Int16);
        let a = layer.validate_tensor(&desc, OperandRole::Input).map(|t| t.shape().clone());
        let b = layer.validate_tensor(&desc, OperandRole::Input).map(|t| t.shape().clone());
        assert_eq!(a, b);
    }

    #[test]
    fn test_expect_in_set_lists_allowed_values() {
        let err = expect_in_set(
            DataType::Int16,
            &[DataType::Int32, DataType::CompoundBias],
            ConfigReason::BiasBytes,
            ItemRef::operand(OperandRole::Biases),
        )
        .unwrap_err();
        assert_eq!(
            err.expected,
            Expectation::OneOf(vec!["int32".into(), "compound-bias".into()])
        );
        assert_eq!(err.actual, "int16");
    }
}
