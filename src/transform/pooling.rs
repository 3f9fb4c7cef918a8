//! Pooling transform
//!
//! Window and stride come either from [`LegacyPooling`] or from structured
//! parameters (mode, window, stride). Legacy settings are first normalized
//! into the structured form, so both paths share every check.

use crate::capability::pooling::{PoolingMode, STRIDE_LIMIT, WINDOW_LIMIT};
use crate::capability::OperationKind;
use crate::error::{AccelResult, ConfigReason, Expectation, ItemRef, ModelError};
use crate::kernels::{
    AccelerationMode, ExecutionContext, KernelMap, KernelMode, KernelOp, KernelRegistry,
    PoolingConfig, PoolingKernel,
};
use crate::tensor::{Dim, OperandRole, Shape, Tensor};
use crate::validator::{expect_equal, expect_in_range, expect_in_set, expect_present, LayerValidator};

use super::descriptor::{POOLING_MODE_PARAM, POOLING_STRIDE_PARAM, POOLING_WINDOW_PARAM};
use super::{
    binding, validated_operand, ActiveList, LayerDescriptor, LegacyPooling, OperationDescriptor,
    Parameter, Transform,
};

/// Pooling settings after normalization, before range checks
#[derive(Debug, Clone, PartialEq, Eq)]
struct PoolingParams {
    mode: PoolingMode,
    window: Option<Shape>,
    stride: Option<Shape>,
}

impl PoolingParams {
    fn from_legacy(legacy: &LegacyPooling) -> Result<Self, ModelError> {
        let mode = decode_mode(legacy.pool_type)?;
        Ok(Self {
            mode,
            window: Some(Shape::w(legacy.pool_size)),
            stride: Some(Shape::w(legacy.pool_stride)),
        })
    }

    fn from_descriptor(desc: &OperationDescriptor) -> Result<Self, ModelError> {
        let structured = [POOLING_MODE_PARAM, POOLING_WINDOW_PARAM, POOLING_STRIDE_PARAM]
            .iter()
            .any(|i| desc.has_parameter(*i));

        if let Some(legacy) = &desc.legacy_pooling {
            if structured {
                return Err(ModelError::new(
                    ConfigReason::ParameterInvalid,
                    ItemRef::parameter(POOLING_MODE_PARAM),
                    Expectation::OneOf(vec!["legacy pooling".into(), "pooling parameters".into()]),
                    "both",
                ));
            }
            return Self::from_legacy(legacy);
        }

        let has_window = desc.has_parameter(POOLING_WINDOW_PARAM);
        let has_stride = desc.has_parameter(POOLING_STRIDE_PARAM);
        if has_window || has_stride {
            for index in [POOLING_MODE_PARAM, POOLING_WINDOW_PARAM, POOLING_STRIDE_PARAM] {
                expect_present(
                    desc.parameter(index),
                    ConfigReason::ParameterMissing,
                    ItemRef::parameter(index),
                )?;
            }
        }

        let mode = match desc.parameter(POOLING_MODE_PARAM) {
            None => PoolingMode::Disabled,
            Some(Parameter::PoolingMode(raw)) => decode_mode(*raw)?,
            Some(other) => return Err(wrong_kind(POOLING_MODE_PARAM, "pooling-mode", other)),
        };
        Ok(Self {
            mode,
            window: shape_parameter(desc, POOLING_WINDOW_PARAM)?,
            stride: shape_parameter(desc, POOLING_STRIDE_PARAM)?,
        })
    }
}

fn decode_mode(raw: u32) -> Result<PoolingMode, ModelError> {
    PoolingMode::from_raw(raw).ok_or_else(|| {
        ModelError::new(
            ConfigReason::PoolType,
            ItemRef::parameter(POOLING_MODE_PARAM),
            Expectation::OneOf(vec!["0".into(), "1".into(), "2".into()]),
            raw,
        )
    })
}

fn wrong_kind(index: u32, expected: &str, actual: &Parameter) -> ModelError {
    ModelError::new(
        ConfigReason::ParameterInvalid,
        ItemRef::parameter(index),
        Expectation::OneOf(vec![expected.to_string()]),
        actual.kind_name(),
    )
}

fn shape_parameter(desc: &OperationDescriptor, index: u32) -> Result<Option<Shape>, ModelError> {
    match desc.parameter(index) {
        None => Ok(None),
        Some(Parameter::Shape(shape)) => Ok(Some(shape.clone())),
        Some(other) => Err(wrong_kind(index, "shape", other)),
    }
}

/// Extent of `shape` along W; the shape must be exactly `[W]`
fn window_extent(shape: &Shape, index: u32) -> Result<u32, ModelError> {
    if shape.rank() != 1 || !shape.contains(Dim::W) {
        return Err(ModelError::new(
            ConfigReason::ShapeRankInvalid,
            ItemRef::parameter(index),
            Expectation::Layout("W".into()),
            shape.layout(),
        ));
    }
    Ok(shape.at(Dim::W))
}

/// Output positions for one pooled dimension, `None` for an empty input or zero stride
pub fn pooled_extent(input: u32, stride: u32) -> Option<u32> {
    input.checked_sub(1)?.checked_div(stride).map(|steps| steps + 1)
}

/// Max or sum pooling over the W dimension of a `WD` tensor
#[derive(Debug)]
pub struct PoolingFunction {
    input: Tensor,
    output: Tensor,
    mode: PoolingMode,
    window: Shape,
    stride: Shape,
    kernel_mode: KernelMode,
    kernels: KernelMap<PoolingKernel>,
    config: PoolingConfig,
}

impl PoolingFunction {
    /// `Ok(None)` when pooling is disabled
    pub fn create(
        desc: &OperationDescriptor,
        layer: &LayerValidator<'_>,
        registry: &KernelRegistry,
    ) -> AccelResult<Option<Self>> {
        let params = PoolingParams::from_descriptor(desc)?;
        if params.mode == PoolingMode::Disabled {
            return Ok(None);
        }
        expect_in_set(
            params.mode,
            &[PoolingMode::Max, PoolingMode::Sum],
            ConfigReason::PoolType,
            ItemRef::parameter(POOLING_MODE_PARAM),
        )?;

        let window = expect_present(
            params.window,
            ConfigReason::ParameterMissing,
            ItemRef::parameter(POOLING_WINDOW_PARAM),
        )?;
        let stride = expect_present(
            params.stride,
            ConfigReason::ParameterMissing,
            ItemRef::parameter(POOLING_STRIDE_PARAM),
        )?;
        let stride_w = window_extent(&stride, POOLING_STRIDE_PARAM)?;
        expect_in_range(
            stride_w,
            &STRIDE_LIMIT,
            ItemRef::parameter(POOLING_STRIDE_PARAM).at_dim(Dim::W),
        )?;
        let window_w = window_extent(&window, POOLING_WINDOW_PARAM)?;
        expect_in_range(
            window_w,
            &WINDOW_LIMIT,
            ItemRef::parameter(POOLING_WINDOW_PARAM).at_dim(Dim::W),
        )?;

        let input = validated_operand(desc, layer, OperandRole::Input)?;
        let positions = input.shape().at(Dim::W);
        let filters = input.shape().at(Dim::D);
        let output_positions = pooled_extent(positions, stride_w).unwrap_or(0);
        if output_positions < 1 || output_positions > positions {
            return Err(ModelError::new(
                ConfigReason::PoolSize,
                ItemRef::operation().at_dim(Dim::W),
                Expectation::AtMost(positions.into()),
                output_positions,
            )
            .into());
        }

        let output = validated_operand(desc, layer, OperandRole::Output)?;
        for (dim, expected) in [(Dim::W, output_positions), (Dim::D, filters)] {
            expect_equal(
                output.shape().at(dim),
                expected,
                ConfigReason::DimensionMismatch,
                output.item().at_dim(dim),
            )?;
        }

        let kernel_mode = KernelMode::input_only(input.data_type());
        let kernels = registry
            .kernel_map::<PoolingKernel>(KernelOp::Pooling, kernel_mode)?
            .clone();
        let config = PoolingConfig {
            mode: params.mode,
            window: window_w,
            stride: stride_w,
            positions,
            filters,
            output_positions,
            input: input.buffer()?.clone(),
            input_type: input.data_type(),
            output: output.buffer()?.clone(),
        };

        Ok(Some(Self {
            input,
            output,
            mode: params.mode,
            window,
            stride,
            kernel_mode,
            kernels,
            config,
        }))
    }

    pub fn mode(&self) -> PoolingMode {
        self.mode
    }

    pub fn window(&self) -> &Shape {
        &self.window
    }

    pub fn stride(&self) -> &Shape {
        &self.stride
    }

    /// Pooled output extents
    pub fn output_shape(&self) -> Shape {
        Shape::wd(self.config.output_positions, self.config.filters)
    }
}

impl Transform for PoolingFunction {
    fn operation(&self) -> OperationKind {
        OperationKind::Pooling
    }

    fn input(&self) -> &Tensor {
        &self.input
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn compute(
        &self,
        accel: AccelerationMode,
        active_list: Option<&ActiveList>,
        ctx: &mut ExecutionContext,
    ) -> AccelResult<()> {
        if let Some(list) = active_list {
            self.validate_active_list(list)?;
        }
        let kernel = self.kernels.get(accel)?;
        tracing::trace!(
            "pooling {} window {} stride {} on {}",
            self.mode,
            self.config.window,
            self.config.stride,
            accel
        );
        kernel.invoke(&self.config, ctx)
    }

    fn layer_descriptor(&self) -> AccelResult<LayerDescriptor> {
        let c = &self.config;
        Ok(LayerDescriptor {
            operation: OperationKind::Pooling,
            kernel_mode: self.kernel_mode,
            config_words: vec![
                c.mode.as_raw(),
                c.window,
                c.stride,
                c.positions,
                c.filters,
                c.output_positions,
            ],
            operands: vec![
                binding(&self.input, OperandRole::Input)?,
                binding(&self.output, OperandRole::Output)?,
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_extent() {
        assert_eq!(pooled_extent(10, 1), Some(10));
        assert_eq!(pooled_extent(10, 3), Some(4));
        assert_eq!(pooled_extent(1, 6), Some(1));
        assert_eq!(pooled_extent(0, 2), None);
        assert_eq!(pooled_extent(10, 0), None);
    }

    #[test]
    fn test_legacy_normalizes_to_structured() {
        let legacy = LegacyPooling {
            pool_type: 1,
            pool_size: 3,
            pool_stride: 2,
        };
        let from_legacy = PoolingParams::from_descriptor(
            &OperationDescriptor::new(OperationKind::Pooling).with_legacy_pooling(legacy),
        )
        .unwrap();
        let structured = PoolingParams::from_descriptor(
            &OperationDescriptor::new(OperationKind::Pooling)
                .with_parameter(POOLING_MODE_PARAM, Parameter::PoolingMode(1))
                .with_parameter(POOLING_WINDOW_PARAM, Parameter::Shape(Shape::w(3)))
                .with_parameter(POOLING_STRIDE_PARAM, Parameter::Shape(Shape::w(2))),
        )
        .unwrap();
        assert_eq!(from_legacy, structured);
    }

    #[test]
    fn test_window_without_mode_is_missing_parameter() {
        let err = PoolingParams::from_descriptor(
            &OperationDescriptor::new(OperationKind::Pooling)
                .with_parameter(POOLING_WINDOW_PARAM, Parameter::Shape(Shape::w(3))),
        )
        .unwrap_err();
        assert_eq!(err.reason(), Some(ConfigReason::ParameterMissing));
        assert_eq!(err.item, ItemRef::parameter(POOLING_MODE_PARAM));
    }

    #[test]
    fn test_unknown_raw_mode_is_pool_type() {
        let err = decode_mode(9).unwrap_err();
        assert_eq!(err.reason(), Some(ConfigReason::PoolType));
    }

    #[test]
    fn test_window_shape_must_be_w() {
        let err = window_extent(&Shape::hw(1, 2), POOLING_WINDOW_PARAM).unwrap_err();
        assert_eq!(err.reason(), Some(ConfigReason::ShapeRankInvalid));
    }
}
