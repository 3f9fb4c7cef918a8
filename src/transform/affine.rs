//! Affine transforms: single-bias (full and diagonal) and multi-bias

use crate::capability::affine::ACTIVE_LIST_BIAS_TYPES;
use crate::capability::OperationKind;
use crate::error::{AccelError, AccelResult, ConfigReason, Expectation, ItemRef, ModelError};
use crate::kernels::{
    AccelerationMode, ActiveListKernel, AffineConfig, AffineKernel, ExecutionContext, KernelMap,
    KernelMode, KernelOp, KernelRegistry,
};
use crate::tensor::{Dim, OperandRole, Tensor};
use crate::validator::{expect_equal, expect_in_set, LayerValidator};

use super::descriptor::{BIAS_MODE_PARAM, BIAS_VECTOR_INDEX_PARAM};
use super::{
    binding, validated_operand, ActiveList, BiasMode, LayerDescriptor, OperationDescriptor,
    Parameter, Transform,
};

/// Bias mode parameter, defaulting to what the operation kind implies
fn bias_mode(desc: &OperationDescriptor) -> Result<BiasMode, ModelError> {
    let expected = match desc.kind {
        OperationKind::AffineMultiBias => BiasMode::Grouping,
        _ => BiasMode::Default,
    };
    let item = ItemRef::parameter(BIAS_MODE_PARAM);
    match desc.parameter(BIAS_MODE_PARAM) {
        None => Ok(expected),
        Some(Parameter::BiasMode(mode)) => {
            expect_in_set(*mode, &[expected], ConfigReason::BiasMode, item)?;
            Ok(*mode)
        }
        Some(other) => Err(ModelError::new(
            ConfigReason::ParameterInvalid,
            item,
            Expectation::OneOf(vec!["bias-mode".into()]),
            other.kind_name(),
        )),
    }
}

fn dimension_match(tensor: &Tensor, dim: Dim, expected: u32) -> Result<(), ModelError> {
    expect_equal(
        tensor.shape().at(dim),
        expected,
        ConfigReason::DimensionMismatch,
        tensor.item().at_dim(dim),
    )
}

/// Operands shared by every affine variant, validated and cross-checked
struct AffineOperands {
    input: Tensor,
    output: Tensor,
    weights: Tensor,
    biases: Tensor,
}

impl AffineOperands {
    fn validate(desc: &OperationDescriptor, layer: &LayerValidator<'_>) -> Result<Self, ModelError> {
        let input = validated_operand(desc, layer, OperandRole::Input)?;
        let output = validated_operand(desc, layer, OperandRole::Output)?;
        let weights = validated_operand(desc, layer, OperandRole::Weights)?;
        let biases = validated_operand(desc, layer, OperandRole::Biases)?;

        let elements = input.shape().at(Dim::H);
        let rows = output.shape().at(Dim::H);
        dimension_match(&output, Dim::W, input.shape().at(Dim::W))?;
        if desc.kind == OperationKind::AffineDiagonal {
            dimension_match(&weights, Dim::H, elements)?;
            dimension_match(&output, Dim::H, elements)?;
        } else {
            dimension_match(&weights, Dim::H, rows)?;
            dimension_match(&weights, Dim::W, elements)?;
        }
        dimension_match(&biases, Dim::H, rows)?;

        Ok(Self {
            input,
            output,
            weights,
            biases,
        })
    }

    fn kernel_mode(&self) -> KernelMode {
        KernelMode::new(
            self.input.data_type(),
            self.weights.data_type(),
            self.biases.data_type(),
        )
    }

    fn config(
        &self,
        bias_vector_count: u32,
        bias_vector_index: u32,
        weight_scales: Option<&Tensor>,
    ) -> AccelResult<AffineConfig> {
        Ok(AffineConfig {
            rows: self.output.shape().at(Dim::H),
            vectors: self.input.shape().at(Dim::W),
            elements: self.input.shape().at(Dim::H),
            input: self.input.buffer()?.clone(),
            input_type: self.input.data_type(),
            output: self.output.buffer()?.clone(),
            weights: self.weights.buffer()?.clone(),
            weight_type: self.weights.data_type(),
            biases: self.biases.buffer()?.clone(),
            bias_type: self.biases.data_type(),
            bias_vector_count,
            bias_vector_index,
            weight_scales: match weight_scales {
                Some(tensor) => Some(tensor.buffer()?.clone()),
                None => None,
            },
        })
    }

    fn operand(&self, role: OperandRole) -> Option<&Tensor> {
        match role {
            OperandRole::Input => Some(&self.input),
            OperandRole::Output => Some(&self.output),
            OperandRole::Weights => Some(&self.weights),
            OperandRole::Biases => Some(&self.biases),
            OperandRole::WeightScales => None,
        }
    }
}

impl std::fmt::Debug for AffineOperands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffineOperands")
            .field("input", &self.input.shape())
            .field("output", &self.output.shape())
            .field("weights", &self.weights.shape())
            .field("biases", &self.biases.shape())
            .finish()
    }
}

/// Affine transform with one bias per row
///
/// Covers full and diagonal weights. Only full weights have an active-list
/// kernel.
#[derive(Debug)]
pub struct AffineSingle {
    kind: OperationKind,
    operands: AffineOperands,
    kernel_mode: KernelMode,
    kernels: KernelMap<AffineKernel>,
    active_list_kernels: Option<KernelMap<ActiveListKernel>>,
    config: AffineConfig,
}

impl AffineSingle {
    pub fn create(
        desc: &OperationDescriptor,
        layer: &LayerValidator<'_>,
        registry: &KernelRegistry,
    ) -> AccelResult<Self> {
        bias_mode(desc)?;
        let operands = AffineOperands::validate(desc, layer)?;
        let kernel_mode = operands.kernel_mode();
        let (op, active_list_kernels) = match desc.kind {
            OperationKind::AffineDiagonal => (KernelOp::AffineDiagonal, None),
            _ => (
                KernelOp::Affine,
                registry
                    .kernel_map::<ActiveListKernel>(KernelOp::AffineActiveList, kernel_mode)
                    .ok()
                    .cloned(),
            ),
        };
        let kernels = registry.kernel_map::<AffineKernel>(op, kernel_mode)?.clone();
        let config = operands.config(1, 0, None)?;

        Ok(Self {
            kind: desc.kind,
            operands,
            kernel_mode,
            kernels,
            active_list_kernels,
            config,
        })
    }

    pub fn weights(&self) -> &Tensor {
        &self.operands.weights
    }

    pub fn biases(&self) -> &Tensor {
        &self.operands.biases
    }

    pub fn kernel_mode(&self) -> KernelMode {
        self.kernel_mode
    }
}

impl Transform for AffineSingle {
    fn operation(&self) -> OperationKind {
        self.kind
    }

    fn input(&self) -> &Tensor {
        &self.operands.input
    }

    fn output(&self) -> &Tensor {
        &self.operands.output
    }

    fn operand(&self, role: OperandRole) -> AccelResult<&Tensor> {
        self.operands
            .operand(role)
            .ok_or(AccelError::OperandNotPresent(role))
    }

    fn compute(
        &self,
        accel: AccelerationMode,
        active_list: Option<&ActiveList>,
        ctx: &mut ExecutionContext,
    ) -> AccelResult<()> {
        match active_list {
            Some(list) => {
                self.validate_active_list(list)?;
                let kernel = self
                    .active_list_kernels
                    .as_ref()
                    .ok_or(AccelError::NotImplemented {
                        op: KernelOp::AffineActiveList,
                        mode: self.kernel_mode,
                        accel,
                    })?
                    .get(accel)?;
                tracing::trace!("{} active list ({} rows) on {}", self.kind, list.count(), accel);
                kernel.invoke(&self.config, &list.indices, ctx)
            }
            None => {
                let kernel = self.kernels.get(accel)?;
                tracing::trace!("{} {} on {}", self.kind, self.kernel_mode, accel);
                kernel.invoke(&self.config, ctx)
            }
        }
    }

    fn validate_active_list(&self, list: &ActiveList) -> Result<(), ModelError> {
        let rows = self.operands.output.shape().at(Dim::H);
        let item = ItemRef::operation();
        let count = list.count();
        if count < 1 {
            return Err(ModelError::active_list(item, Expectation::AtLeast(1), count));
        }
        if count > rows {
            return Err(ModelError::active_list(
                item,
                Expectation::AtMost(rows.into()),
                count,
            ));
        }
        expect_in_set(
            self.operands.biases.data_type(),
            &ACTIVE_LIST_BIAS_TYPES,
            ConfigReason::BiasBytes,
            ItemRef::operand(OperandRole::Biases),
        )?;
        if let Some(bad) = list.indices.iter().find(|i| **i >= rows) {
            return Err(ModelError::active_list(
                item,
                Expectation::AtMost(u64::from(rows) - 1),
                bad,
            ));
        }
        Ok(())
    }

    fn layer_descriptor(&self) -> AccelResult<LayerDescriptor> {
        let c = &self.config;
        Ok(LayerDescriptor {
            operation: self.kind,
            kernel_mode: self.kernel_mode,
            config_words: vec![c.rows, c.vectors, c.elements, 1, 0],
            operands: vec![
                binding(&self.operands.input, OperandRole::Input)?,
                binding(&self.operands.output, OperandRole::Output)?,
                binding(&self.operands.weights, OperandRole::Weights)?,
                binding(&self.operands.biases, OperandRole::Biases)?,
            ],
        })
    }
}

/// Affine transform selecting one bias vector per row from grouped biases
///
/// Weights, biases and the optional weight scales are validated together
/// since the scale rows and bias grouping both follow the weight rows.
#[derive(Debug)]
pub struct AffineMulti {
    operands: AffineOperands,
    weight_scales: Option<Tensor>,
    bias_vector_index: u32,
    kernel_mode: KernelMode,
    kernels: KernelMap<AffineKernel>,
    config: AffineConfig,
}

impl AffineMulti {
    pub fn create(
        desc: &OperationDescriptor,
        layer: &LayerValidator<'_>,
        registry: &KernelRegistry,
    ) -> AccelResult<Self> {
        bias_mode(desc)?;
        let operands = AffineOperands::validate(desc, layer)?;

        let bias_vectors = operands.biases.shape().at(Dim::W);
        let index_item = ItemRef::parameter(BIAS_VECTOR_INDEX_PARAM);
        let bias_vector_index = match desc.parameter(BIAS_VECTOR_INDEX_PARAM) {
            None => 0,
            Some(Parameter::Index(index)) => *index,
            Some(other) => {
                return Err(ModelError::new(
                    ConfigReason::ParameterInvalid,
                    index_item,
                    Expectation::OneOf(vec!["index".into()]),
                    other.kind_name(),
                )
                .into())
            }
        };
        if bias_vector_index >= bias_vectors {
            return Err(ModelError::new(
                ConfigReason::BiasIndex,
                index_item,
                Expectation::AtMost(u64::from(bias_vectors) - 1),
                bias_vector_index,
            )
            .into());
        }

        let weight_scales = match desc.operand(OperandRole::WeightScales) {
            Some(scales) if !scales.mode.is_disabled() => {
                let tensor = layer.validate_tensor(scales, OperandRole::WeightScales)?;
                dimension_match(&tensor, Dim::H, operands.output.shape().at(Dim::H))?;
                Some(tensor)
            }
            _ => None,
        };

        let kernel_mode = operands.kernel_mode();
        let kernels = registry
            .kernel_map::<AffineKernel>(KernelOp::AffineMultiBias, kernel_mode)?
            .clone();
        let config = operands.config(bias_vectors, bias_vector_index, weight_scales.as_ref())?;

        Ok(Self {
            operands,
            weight_scales,
            bias_vector_index,
            kernel_mode,
            kernels,
            config,
        })
    }

    pub fn bias_vector_index(&self) -> u32 {
        self.bias_vector_index
    }

    pub fn weight_scales(&self) -> Option<&Tensor> {
        self.weight_scales.as_ref()
    }

    pub fn kernel_mode(&self) -> KernelMode {
        self.kernel_mode
    }
}

impl Transform for AffineMulti {
    fn operation(&self) -> OperationKind {
        OperationKind::AffineMultiBias
    }

    fn input(&self) -> &Tensor {
        &self.operands.input
    }

    fn output(&self) -> &Tensor {
        &self.operands.output
    }

    fn operand(&self, role: OperandRole) -> AccelResult<&Tensor> {
        let tensor = match role {
            OperandRole::WeightScales => self.weight_scales.as_ref(),
            other => self.operands.operand(other),
        };
        tensor.ok_or(AccelError::OperandNotPresent(role))
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
        tracing::trace!("affine-multibias {} on {}", self.kernel_mode, accel);
        kernel.invoke(&self.config, ctx)
    }

    fn layer_descriptor(&self) -> AccelResult<LayerDescriptor> {
        let c = &self.config;
        let mut operands = vec![
            binding(&self.operands.input, OperandRole::Input)?,
            binding(&self.operands.output, OperandRole::Output)?,
            binding(&self.operands.weights, OperandRole::Weights)?,
            binding(&self.operands.biases, OperandRole::Biases)?,
        ];
        if let Some(scales) = &self.weight_scales {
            operands.push(binding(scales, OperandRole::WeightScales)?);
        }
        Ok(LayerDescriptor {
            operation: OperationKind::AffineMultiBias,
            kernel_mode: self.kernel_mode,
            config_words: vec![
                c.rows,
                c.vectors,
                c.elements,
                c.bias_vector_count,
                c.bias_vector_index,
            ],
            operands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HwGeneration;
    use crate::tensor::{Buffer, DataType, Shape, TensorDesc};
    use crate::transform::build_transform;
    use crate::validator::Validator;

    // 8 elements x 2 vectors, interleaved; vector 0 is 1..8, vector 1 all ones
    fn input() -> TensorDesc {
        let values: Vec<i16> = (1..=8).flat_map(|e| [e, 1]).collect();
        TensorDesc::new(Shape::hw(8, 2), DataType::Int16, Buffer::from_i16(&values))
    }

    fn weights() -> TensorDesc {
        let values: Vec<i16> = (0..16).map(|i| if i < 8 { 1 } else { 2 }).collect();
        TensorDesc::new(Shape::hw(2, 8), DataType::Int16, Buffer::from_i16(&values))
    }

    fn output() -> TensorDesc {
        TensorDesc::new(Shape::hw(2, 2), DataType::Int32, Buffer::zeroed(16))
    }

    fn affine(biases: TensorDesc) -> OperationDescriptor {
        OperationDescriptor::new(OperationKind::Affine)
            .with_operand(OperandRole::Input, input())
            .with_operand(OperandRole::Output, output())
            .with_operand(OperandRole::Weights, weights())
            .with_operand(OperandRole::Biases, biases)
    }

    fn int32_biases(values: &[i32]) -> TensorDesc {
        TensorDesc::new(Shape::h(values.len() as u32), DataType::Int32, Buffer::from_i32(values))
    }

    fn model_error(err: AccelError) -> ModelError {
        match err {
            AccelError::Model(e) => e,
            other => panic!("expected model error, got {}", other),
        }
    }

    #[test]
    fn test_affine_computes() {
        let desc = affine(int32_biases(&[10, -1]));
        let transform = build_transform(&desc, &Validator::default()).unwrap().unwrap();
        let mut ctx = ExecutionContext::new();
        transform
            .compute(AccelerationMode::Generic, None, &mut ctx)
            .unwrap();
        let out = transform.output().buffer().unwrap().to_i32_vec().unwrap();
        assert_eq!(out, vec![46, 18, 71, 15]);
    }

    #[test]
    fn test_operands_by_role() {
        let desc = affine(int32_biases(&[0, 0]));
        let transform = build_transform(&desc, &Validator::default()).unwrap().unwrap();
        assert_eq!(
            transform.operand(OperandRole::Weights).unwrap().shape(),
            &Shape::hw(2, 8)
        );
        assert!(matches!(
            transform.operand(OperandRole::WeightScales),
            Err(AccelError::OperandNotPresent(OperandRole::WeightScales))
        ));
    }

    #[test]
    fn test_weight_columns_must_match_elements() {
        let desc = affine(int32_biases(&[0, 0])).with_operand(
            OperandRole::Weights,
            TensorDesc::new(Shape::hw(2, 16), DataType::Int16, Buffer::zeroed(64)),
        );
        let err = model_error(build_transform(&desc, &Validator::default()).unwrap_err());
        assert_eq!(err.reason(), Some(ConfigReason::DimensionMismatch));
        assert_eq!(err.item, ItemRef::operand(OperandRole::Weights).at_dim(Dim::W));
    }

    #[test]
    fn test_wrong_bias_mode_rejected() {
        let desc = affine(int32_biases(&[0, 0]))
            .with_parameter(BIAS_MODE_PARAM, Parameter::BiasMode(BiasMode::Grouping));
        let err = model_error(build_transform(&desc, &Validator::default()).unwrap_err());
        assert_eq!(err.reason(), Some(ConfigReason::BiasMode));
    }

    #[test]
    fn test_active_list_checks() {
        let desc = affine(int32_biases(&[10, -1]));
        let transform = build_transform(&desc, &Validator::default()).unwrap().unwrap();

        assert!(transform.validate_active_list(&ActiveList::new(vec![1])).is_ok());
        let empty = transform.validate_active_list(&ActiveList::default()).unwrap_err();
        assert_eq!(empty.status, crate::error::Status::ActiveListIndicesInvalid);
        let too_many = transform
            .validate_active_list(&ActiveList::new(vec![0, 1, 1]))
            .unwrap_err();
        assert_eq!(too_many.expected, Expectation::AtMost(2));
        let out_of_range = transform.validate_active_list(&ActiveList::new(vec![2])).unwrap_err();
        assert_eq!(out_of_range.item, ItemRef::operation());
    }

    #[test]
    fn test_active_list_rejects_low_precision_bias() {
        let biases = TensorDesc::new(Shape::h(2), DataType::Int16, Buffer::from_i16(&[0, 0]));
        let transform = build_transform(&affine(biases), &Validator::new(HwGeneration::V3))
            .unwrap()
            .unwrap();
        let err = transform.validate_active_list(&ActiveList::new(vec![0])).unwrap_err();
        assert_eq!(err.reason(), Some(ConfigReason::BiasBytes));
    }

    #[test]
    fn test_diagonal_has_no_active_list_kernel() {
        let desc = OperationDescriptor::new(OperationKind::AffineDiagonal)
            .with_operand(OperandRole::Input, input())
            .with_operand(
                OperandRole::Output,
                TensorDesc::new(Shape::hw(8, 2), DataType::Int32, Buffer::zeroed(64)),
            )
            .with_operand(
                OperandRole::Weights,
                TensorDesc::new(Shape::h(8), DataType::Int16, Buffer::from_i16(&[2; 8])),
            )
            .with_operand(OperandRole::Biases, int32_biases(&[0; 8]));
        let transform = build_transform(&desc, &Validator::default()).unwrap().unwrap();
        let mut ctx = ExecutionContext::new();
        transform
            .compute(AccelerationMode::Generic, None, &mut ctx)
            .unwrap();
        let out = transform.output().buffer().unwrap().to_i32_vec().unwrap();
        assert_eq!(&out[..4], &[2, 2, 4, 2]);

        let err = transform
            .compute(AccelerationMode::Generic, Some(&ActiveList::new(vec![0])), &mut ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            AccelError::NotImplemented {
                op: KernelOp::AffineActiveList,
                ..
            }
        ));
    }

    fn multibias(index: Option<u32>) -> OperationDescriptor {
        let mut desc = OperationDescriptor::new(OperationKind::AffineMultiBias)
            .with_operand(OperandRole::Input, input())
            .with_operand(OperandRole::Output, output())
            .with_operand(OperandRole::Weights, weights())
            .with_operand(
                OperandRole::Biases,
                TensorDesc::new(
                    Shape::hw(2, 2),
                    DataType::Int32,
                    Buffer::from_i32(&[0, 100, 0, 200]),
                ),
            );
        if let Some(index) = index {
            desc = desc.with_parameter(BIAS_VECTOR_INDEX_PARAM, Parameter::Index(index));
        }
        desc
    }

    #[test]
    fn test_multibias_selects_vector() {
        let transform = build_transform(&multibias(Some(1)), &Validator::default())
            .unwrap()
            .unwrap();
        let mut ctx = ExecutionContext::new();
        transform.compute(AccelerationMode::Generic, None, &mut ctx).unwrap();
        let out = transform.output().buffer().unwrap().to_i32_vec().unwrap();
        assert_eq!(out, vec![136, 108, 272, 216]);
    }

    #[test]
    fn test_multibias_index_out_of_range() {
        let err = model_error(build_transform(&multibias(Some(2)), &Validator::default()).unwrap_err());
        assert_eq!(err.reason(), Some(ConfigReason::BiasIndex));
        assert_eq!(err.item, ItemRef::parameter(BIAS_VECTOR_INDEX_PARAM));
    }

    #[test]
    fn test_multibias_unsupported_on_v1() {
        let err = model_error(
            build_transform(&multibias(None), &Validator::new(HwGeneration::V1)).unwrap_err(),
        );
        assert_eq!(err.reason(), Some(ConfigReason::OperationUnsupported));
    }

    #[test]
    fn test_multibias_has_no_active_list() {
        let transform = build_transform(&multibias(None), &Validator::default())
            .unwrap()
            .unwrap();
        let err = transform.validate_active_list(&ActiveList::new(vec![0])).unwrap_err();
        assert_eq!(err.reason(), Some(ConfigReason::OperationUnsupported));
    }
}
