//! Element types, data modes and kernel-mode dispatch keys.

use std::fmt;

use serde::Serialize;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    /// 8-byte bias element: `i32` bias, `u8` multiplier, 3 reserved bytes
    CompoundBias,
    Disabled,
}

impl DataType {
    /// Element size in bytes
    pub fn size(self) -> u32 {
        match self {
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 4,
            DataType::CompoundBias => 8,
            DataType::Disabled => 0,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::CompoundBias => "compound-bias",
            DataType::Disabled => "disabled",
        };
        write!(f, "{}", name)
    }
}

/// Storage kind of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum TensorMode {
    #[default]
    Default,
    Disabled,
}

/// How a tensor's bytes are interpreted
///
/// Element size and storage kind are derived from the data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DataMode {
    data_type: DataType,
    size: u32,
    mode: TensorMode,
}

impl DataMode {
    pub fn new(data_type: DataType) -> Self {
        let mode = if data_type == DataType::Disabled {
            TensorMode::Disabled
        } else {
            TensorMode::Default
        };
        Self {
            data_type,
            size: data_type.size(),
            mode,
        }
    }

    pub fn disabled() -> Self {
        Self::new(DataType::Disabled)
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Element size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mode(&self) -> TensorMode {
        self.mode
    }

    pub fn is_disabled(&self) -> bool {
        self.mode == TensorMode::Disabled
    }
}

impl From<DataType> for DataMode {
    fn from(data_type: DataType) -> Self {
        Self::new(data_type)
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data_type)
    }
}

/// (input, weight, bias) element types, the kernel dispatch key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KernelMode {
    pub input: DataType,
    pub weight: DataType,
    pub bias: DataType,
}

impl KernelMode {
    pub fn new(input: DataType, weight: DataType, bias: DataType) -> Self {
        Self { input, weight, bias }
    }

    /// Key for kernels that only depend on the input type (pooling)
    pub fn input_only(input: DataType) -> Self {
        Self::new(input, DataType::Disabled, DataType::Disabled)
    }
}

impl fmt::Display for KernelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.input, self.weight, self.bias)
    }
}
