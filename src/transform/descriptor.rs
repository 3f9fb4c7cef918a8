//! Inbound operation descriptors

use std::fmt;

use crate::capability::OperationKind;
use crate::tensor::{OperandRole, Shape, TensorDesc};

/// Affine parameter 0
pub const BIAS_MODE_PARAM: u32 = 0;
/// Affine parameter 1 (grouping bias mode only)
pub const BIAS_VECTOR_INDEX_PARAM: u32 = 1;
/// Pooling parameter 0
pub const POOLING_MODE_PARAM: u32 = 0;
/// Pooling parameter 1
pub const POOLING_WINDOW_PARAM: u32 = 1;
/// Pooling parameter 2
pub const POOLING_STRIDE_PARAM: u32 = 2;

/// How biases are laid out for an affine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BiasMode {
    /// One bias per output row
    Default,
    /// Several bias vectors per row, one selected by index
    Grouping,
}

impl fmt::Display for BiasMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BiasMode::Default => write!(f, "default"),
            BiasMode::Grouping => write!(f, "grouping"),
        }
    }
}

/// Structured operation parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    BiasMode(BiasMode),
    Index(u32),
    /// Raw pooling mode: 0 disabled, 1 max, 2 sum
    PoolingMode(u32),
    Shape(Shape),
}

impl Parameter {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Parameter::BiasMode(_) => "bias-mode",
            Parameter::Index(_) => "index",
            Parameter::PoolingMode(_) => "pooling-mode",
            Parameter::Shape(_) => "shape",
        }
    }
}

/// Flat pooling settings of convolution-style layer descriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyPooling {
    /// Raw pooling mode: 0 disabled, 1 max, 2 sum
    pub pool_type: u32,
    pub pool_size: u32,
    pub pool_stride: u32,
}

/// Subset of output rows to compute
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActiveList {
    pub indices: Vec<u32>,
}

impl ActiveList {
    pub fn new(indices: Vec<u32>) -> Self {
        Self { indices }
    }

    pub fn count(&self) -> u32 {
        self.indices.len() as u32
    }
}

/// Everything needed to build one transform
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub kind: OperationKind,
    pub operands: [Option<TensorDesc>; OperandRole::COUNT],
    pub parameters: Vec<Option<Parameter>>,
    pub legacy_pooling: Option<LegacyPooling>,
}

impl OperationDescriptor {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            operands: Default::default(),
            parameters: Vec::new(),
            legacy_pooling: None,
        }
    }

    pub fn with_operand(mut self, role: OperandRole, desc: TensorDesc) -> Self {
        self.operands[role.index() as usize] = Some(desc);
        self
    }

    pub fn with_parameter(mut self, index: u32, parameter: Parameter) -> Self {
        let index = index as usize;
        if self.parameters.len() <= index {
            self.parameters.resize(index + 1, None);
        }
        self.parameters[index] = Some(parameter);
        self
    }

    pub fn with_legacy_pooling(mut self, legacy: LegacyPooling) -> Self {
        self.legacy_pooling = Some(legacy);
        self
    }

    pub fn operand(&self, role: OperandRole) -> Option<&TensorDesc> {
        self.operands[role.index() as usize].as_ref()
    }

    pub fn parameter(&self, index: u32) -> Option<&Parameter> {
        self.parameters.get(index as usize).and_then(|p| p.as_ref())
    }

    pub fn has_parameter(&self, index: u32) -> bool {
        self.parameter(index).is_some()
    }
}
