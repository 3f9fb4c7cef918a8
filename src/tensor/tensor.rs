//! Caller tensor descriptions and their validated views

use std::fmt;

use crate::error::{AccelResult, ItemRef};
use crate::internal_error;

use super::{Buffer, DataMode, DataType, Shape};

/// Caller-side tensor description
#[derive(Debug, Clone)]
pub struct TensorDesc {
    pub shape: Shape,
    pub mode: DataMode,
    pub buffer: Option<Buffer>,
}

impl TensorDesc {
    pub fn new(shape: Shape, data_type: DataType, buffer: Buffer) -> Self {
        Self {
            shape,
            mode: DataMode::new(data_type),
            buffer: Some(buffer),
        }
    }

    /// Description without backing memory
    pub fn unbound(shape: Shape, data_type: DataType) -> Self {
        Self {
            shape,
            mode: DataMode::new(data_type),
            buffer: None,
        }
    }

    pub fn with_mode(mut self, mode: DataMode) -> Self {
        self.mode = mode;
        self
    }

    /// Bytes the shape needs with this element size
    pub fn required_bytes(&self) -> u64 {
        self.shape.volume() * u64::from(self.mode.size())
    }
}

/// Validated, immutable tensor view
///
/// Only constructed by the validator. The `item` records which operand it
/// was validated as and is used for error context only.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    mode: DataMode,
    buffer: Option<Buffer>,
    item: ItemRef,
}

impl Tensor {
    pub(crate) fn from_validated(desc: &TensorDesc, item: ItemRef) -> Self {
        Self {
            shape: desc.shape.clone(),
            mode: desc.mode,
            buffer: desc.buffer.clone(),
            item,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    pub fn data_type(&self) -> DataType {
        self.mode.data_type()
    }

    pub fn item(&self) -> ItemRef {
        self.item
    }

    pub fn byte_len(&self) -> usize {
        (self.shape.volume() * u64::from(self.mode.size())) as usize
    }

    pub fn buffer_opt(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Backing buffer; validated tensors that are not disabled always have one
    pub fn buffer(&self) -> AccelResult<&Buffer> {
        self.buffer
            .as_ref()
            .ok_or_else(|| internal_error!("{} has no backing buffer", self.item))
    }

    /// Description this tensor was validated from
    pub fn to_desc(&self) -> TensorDesc {
        TensorDesc {
            shape: self.shape.clone(),
            mode: self.mode,
            buffer: self.buffer.clone(),
        }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.item, self.shape, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::OperandRole;

    #[test]
    fn test_required_bytes() {
        let desc = TensorDesc::unbound(Shape::hw(16, 4), DataType::Int16);
        assert_eq!(desc.required_bytes(), 128);
        let desc = TensorDesc::unbound(Shape::h(3), DataType::CompoundBias);
        assert_eq!(desc.required_bytes(), 24);
    }

    #[test]
    fn test_unbound_tensor_reports_missing_buffer() {
        let desc = TensorDesc::unbound(Shape::h(8), DataType::Int32);
        let tensor = Tensor::from_validated(&desc, ItemRef::operand(OperandRole::Biases));
        let err = tensor.buffer().unwrap_err();
        assert!(err.to_string().contains("biases"), "{}", err);
    }
}
