//! Pooling operand and parameter limits

use std::fmt;

use serde::Serialize;

use crate::error::ConfigReason;
use crate::tensor::{DataType, Dim, Layout, OperandRole};

use super::{CapabilityTable, DataTypeLimit, OperationKind, RangeLimit, TensorLimits};

pub const CNN_POOL_SIZE_MIN: u32 = 1;
pub const CNN_POOL_SIZE_MAX: u32 = 6;

pub const WINDOW_LIMIT: RangeLimit =
    RangeLimit::range(CNN_POOL_SIZE_MIN, CNN_POOL_SIZE_MAX, ConfigReason::PoolSize);
pub const STRIDE_LIMIT: RangeLimit =
    RangeLimit::range(CNN_POOL_SIZE_MIN, CNN_POOL_SIZE_MAX, ConfigReason::PoolStride);

/// Spatial positions per filter
pub const POSITIONS: RangeLimit = RangeLimit::range(1, 65535, ConfigReason::InputVolume);
/// Filter count: 4..=65532, multiple of 4
pub const FILTERS: RangeLimit = RangeLimit::new(4, 65532, 4, ConfigReason::InputVolume);

/// Pooling reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PoolingMode {
    Disabled,
    Max,
    Sum,
}

impl PoolingMode {
    /// Raw parameter encoding: 0 disabled, 1 max, 2 sum
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PoolingMode::Disabled),
            1 => Some(PoolingMode::Max),
            2 => Some(PoolingMode::Sum),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            PoolingMode::Disabled => 0,
            PoolingMode::Max => 1,
            PoolingMode::Sum => 2,
        }
    }
}

impl fmt::Display for PoolingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolingMode::Disabled => write!(f, "disabled"),
            PoolingMode::Max => write!(f, "max"),
            PoolingMode::Sum => write!(f, "sum"),
        }
    }
}

pub(super) fn register(table: &mut CapabilityTable) {
    table.insert(
        OperationKind::Pooling,
        OperandRole::Input,
        TensorLimits::new(
            Layout::wd(),
            DataTypeLimit::new(&[DataType::Int16, DataType::Int32], ConfigReason::InputBytes),
        )
        .with_dim(Dim::W, POSITIONS)
        .with_dim(Dim::D, FILTERS),
    );
    table.insert(
        OperationKind::Pooling,
        OperandRole::Output,
        TensorLimits::new(
            Layout::wd(),
            DataTypeLimit::new(&[DataType::Int32], ConfigReason::OutputBytes),
        )
        .with_dim(Dim::W, RangeLimit::range(1, 65535, ConfigReason::OutputVolume))
        .with_dim(Dim::D, RangeLimit::new(4, 65532, 4, ConfigReason::OutputVolume)),
    );
}
