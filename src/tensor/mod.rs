//! Tensor descriptions, shapes and data modes

pub mod buffer;
pub mod data_mode;
pub mod shape;
#[allow(clippy::module_inception)]
pub mod tensor;

use std::fmt;

use serde::Serialize;

pub use buffer::{Buffer, BufferId};
pub use data_mode::{DataMode, DataType, KernelMode, TensorMode};
pub use shape::{Dim, Layout, Shape};
pub use tensor::{Tensor, TensorDesc};

/// Role an operand plays in an operation
///
/// The index is stable and is what model errors report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OperandRole {
    Input,
    Output,
    Weights,
    Biases,
    WeightScales,
}

impl OperandRole {
    pub const ALL: [OperandRole; 5] = [
        OperandRole::Input,
        OperandRole::Output,
        OperandRole::Weights,
        OperandRole::Biases,
        OperandRole::WeightScales,
    ];

    pub const COUNT: usize = 5;

    pub fn index(self) -> u32 {
        match self {
            OperandRole::Input => 0,
            OperandRole::Output => 1,
            OperandRole::Weights => 2,
            OperandRole::Biases => 3,
            OperandRole::WeightScales => 4,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

impl fmt::Display for OperandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperandRole::Input => "input",
            OperandRole::Output => "output",
            OperandRole::Weights => "weights",
            OperandRole::Biases => "biases",
            OperandRole::WeightScales => "weight-scales",
        };
        write!(f, "{}", name)
    }
}
