//! Kernel configuration blocks and per-call execution state

use byteorder::{ByteOrder, LittleEndian};

use crate::capability::pooling::PoolingMode;
use crate::tensor::{Buffer, DataType};

/// Affine-family kernel configuration
///
/// Built once when a transform is constructed. Only the bytes behind the
/// buffers change between calls.
#[derive(Debug, Clone)]
pub struct AffineConfig {
    /// Output rows
    pub rows: u32,
    /// Interleaved vectors per input/output
    pub vectors: u32,
    /// Elements per input vector
    pub elements: u32,
    pub input: Buffer,
    pub input_type: DataType,
    pub output: Buffer,
    pub weights: Buffer,
    pub weight_type: DataType,
    pub biases: Buffer,
    pub bias_type: DataType,
    /// Bias vectors per row (grouping bias mode), 1 otherwise
    pub bias_vector_count: u32,
    pub bias_vector_index: u32,
    pub weight_scales: Option<Buffer>,
}

/// Pooling kernel configuration
#[derive(Debug, Clone)]
pub struct PoolingConfig {
    pub mode: PoolingMode,
    pub window: u32,
    pub stride: u32,
    /// Input positions (W)
    pub positions: u32,
    /// Filters (D)
    pub filters: u32,
    pub output_positions: u32,
    pub input: Buffer,
    pub input_type: DataType,
    pub output: Buffer,
}

/// Mutable per-call state shared by kernels
#[derive(Debug, Default, Clone)]
pub struct ExecutionContext {
    saturations: u64,
    invocations: u64,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs clamped to the `i32` range since the last reset
    pub fn saturations(&self) -> u64 {
        self.saturations
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn reset(&mut self) {
        self.saturations = 0;
        self.invocations = 0;
    }

    pub(crate) fn record_invocation(&mut self) {
        self.invocations += 1;
    }

    /// Clamp to `i32`, counting clamped values
    #[inline]
    pub(crate) fn saturate(&mut self, value: i64) -> i32 {
        if value > i64::from(i32::MAX) {
            self.saturations += 1;
            i32::MAX
        } else if value < i64::from(i32::MIN) {
            self.saturations += 1;
            i32::MIN
        } else {
            value as i32
        }
    }
}

/// Integer value of element `index`; compound biases yield their bias field
#[inline]
pub(crate) fn read_element(bytes: &[u8], data_type: DataType, index: usize) -> i64 {
    match data_type {
        DataType::Int8 => i64::from(bytes[index] as i8),
        DataType::Int16 => i64::from(LittleEndian::read_i16(&bytes[index * 2..])),
        DataType::Int32 => i64::from(LittleEndian::read_i32(&bytes[index * 4..])),
        DataType::CompoundBias => i64::from(LittleEndian::read_i32(&bytes[index * 8..])),
        DataType::Disabled => 0,
    }
}

/// Multiplier field of compound-bias element `index`
#[inline]
pub(crate) fn read_multiplier(bytes: &[u8], index: usize) -> i64 {
    i64::from(bytes[index * 8 + 4])
}

#[inline]
pub(crate) fn write_i32(bytes: &mut [u8], index: usize, value: i32) {
    LittleEndian::write_i32(&mut bytes[index * 4..index * 4 + 4], value);
}

/// Decode `count` elements starting at element `offset`
pub(crate) fn decode(bytes: &[u8], data_type: DataType, offset: usize, count: usize) -> Vec<i64> {
    (offset..offset + count)
        .map(|i| read_element(bytes, data_type, i))
        .collect()
}
