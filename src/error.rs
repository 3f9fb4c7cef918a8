//! Unified error handling for accelforge
//!
//! Two error families are kept apart on purpose:
//! - [`ModelError`]: caused by caller-supplied descriptors. Always carries the
//!   offending operand/parameter and the violated constraint, and is fixed by
//!   changing the model.
//! - Runtime errors ([`AccelError`] variants other than `Model`): unimplemented
//!   kernel combinations, memory-mapping exhaustion, device hangs and driver
//!   I/O failures.
//!
//! Every error maps onto the closed [`Status`] enumeration surfaced to callers.

use std::fmt;

use serde::Serialize;

use crate::kernels::{AccelerationMode, KernelMode, KernelOp};
use crate::tensor::{Dim, OperandRole};

/// Sub-reason of a model-configuration failure
///
/// Capability entries name the reason they raise, so two range checks on the
/// same dimension can still be told apart (e.g. pool size vs. pool stride).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConfigReason {
    /// Operation kind is not available on the target hardware generation
    OperationUnsupported,
    /// Tensor layout (dimensionality) does not match the capability
    ShapeRankInvalid,
    /// Input tensor dimension out of range
    InputVolume,
    /// Output tensor dimension out of range
    OutputVolume,
    /// Weight tensor dimension out of range
    WeightVolume,
    /// Bias tensor dimension out of range
    BiasVolume,
    /// Vector grouping (batch) out of range
    Grouping,
    /// Input data type not supported
    InputBytes,
    /// Output data type not supported
    OutputBytes,
    /// Weight data type not supported
    WeightBytes,
    /// Bias data type not supported
    BiasBytes,
    /// Bias mode not valid for the operation
    BiasMode,
    /// Bias vector index outside the grouped bias tensor
    BiasIndex,
    /// Operand shapes do not agree with each other
    DimensionMismatch,
    /// Required parameter not supplied
    ParameterMissing,
    /// Parameter value is not allowed
    ParameterInvalid,
    /// Pooling window out of range
    PoolSize,
    /// Pooling stride out of range
    PoolStride,
    /// Pooling mode not supported
    PoolType,
    /// Operand buffer is missing
    NullBuffer,
    /// Operand buffer is smaller than the tensor it backs
    BufferTooSmall,
    /// Any other constraint
    Other,
}

impl ConfigReason {
    fn code(self) -> i32 {
        match self {
            ConfigReason::OperationUnsupported => 1,
            ConfigReason::ShapeRankInvalid => 2,
            ConfigReason::InputVolume => 3,
            ConfigReason::OutputVolume => 4,
            ConfigReason::WeightVolume => 5,
            ConfigReason::BiasVolume => 6,
            ConfigReason::Grouping => 7,
            ConfigReason::InputBytes => 8,
            ConfigReason::OutputBytes => 9,
            ConfigReason::WeightBytes => 10,
            ConfigReason::BiasBytes => 11,
            ConfigReason::BiasMode => 12,
            ConfigReason::BiasIndex => 13,
            ConfigReason::DimensionMismatch => 14,
            ConfigReason::ParameterMissing => 15,
            ConfigReason::ParameterInvalid => 16,
            ConfigReason::PoolSize => 17,
            ConfigReason::PoolStride => 18,
            ConfigReason::PoolType => 19,
            ConfigReason::NullBuffer => 20,
            ConfigReason::BufferTooSmall => 21,
            ConfigReason::Other => 99,
        }
    }
}

/// Closed set of statuses surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    Success,
    /// Request still running after the wait timeout; wait again
    DeviceBusy,
    ModelConfigurationInvalid(ConfigReason),
    ActiveListIndicesInvalid,
    /// Operation/precision/acceleration combination has no kernel
    NotImplemented,
    MemoryNotMapped,
    /// Device confirmed hung; the session must be recreated
    DeviceHangRecoveryRequired,
    DeviceIoError,
    DeviceNotAvailable,
    Internal,
}

impl Status {
    /// Stable numeric code
    ///
    /// Model-configuration statuses occupy `-1000 - reason`, everything else
    /// a small fixed range.
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::DeviceBusy => 1,
            Status::Internal => -1,
            Status::NotImplemented => -2,
            Status::ActiveListIndicesInvalid => -3,
            Status::MemoryNotMapped => -4,
            Status::DeviceHangRecoveryRequired => -5,
            Status::DeviceIoError => -6,
            Status::DeviceNotAvailable => -7,
            Status::ModelConfigurationInvalid(reason) => -1000 - reason.code(),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    /// Warnings leave the request usable (currently only `DeviceBusy`)
    pub fn is_warning(self) -> bool {
        matches!(self, Status::DeviceBusy)
    }

    pub fn is_model_error(self) -> bool {
        matches!(
            self,
            Status::ModelConfigurationInvalid(_) | Status::ActiveListIndicesInvalid
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::ModelConfigurationInvalid(reason) => {
                write!(f, "ModelConfigurationInvalid({:?})", reason)
            }
            other => write!(f, "{:?}", other),
        }
    }
}

/// Which part of an operation a model error points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ItemKind {
    Operation,
    Operand,
    Parameter,
}

/// Reference to the operand or parameter that failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ItemRef {
    pub kind: ItemKind,
    /// Operand index (see [`OperandRole::index`]) or parameter index
    pub index: Option<u32>,
    pub dimension: Option<Dim>,
}

impl ItemRef {
    pub fn operation() -> Self {
        Self {
            kind: ItemKind::Operation,
            index: None,
            dimension: None,
        }
    }

    pub fn operand(role: OperandRole) -> Self {
        Self {
            kind: ItemKind::Operand,
            index: Some(role.index()),
            dimension: None,
        }
    }

    pub fn parameter(index: u32) -> Self {
        Self {
            kind: ItemKind::Parameter,
            index: Some(index),
            dimension: None,
        }
    }

    /// Narrow the reference to a single dimension of the item
    pub fn at_dim(mut self, dim: Dim) -> Self {
        self.dimension = Some(dim);
        self
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.index) {
            (ItemKind::Operation, _) => write!(f, "operation")?,
            (ItemKind::Operand, Some(i)) => match OperandRole::from_index(i) {
                Some(role) => write!(f, "operand #{} ({})", i, role)?,
                None => write!(f, "operand #{}", i)?,
            },
            (ItemKind::Parameter, Some(i)) => write!(f, "parameter #{}", i)?,
            (kind, None) => write!(f, "{:?}", kind)?,
        }
        if let Some(dim) = self.dimension {
            write!(f, " dim {}", dim)?;
        }
        Ok(())
    }
}

/// The constraint a value failed to satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Expectation {
    AtLeast(u64),
    AtMost(u64),
    MultipleOf(u64),
    Equal(u64),
    OneOf(Vec<String>),
    Layout(String),
    Present,
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::AtLeast(v) => write!(f, ">= {}", v),
            Expectation::AtMost(v) => write!(f, "<= {}", v),
            Expectation::MultipleOf(v) => write!(f, "multiple of {}", v),
            Expectation::Equal(v) => write!(f, "== {}", v),
            Expectation::OneOf(set) => write!(f, "one of [{}]", set.join(", ")),
            Expectation::Layout(layout) => write!(f, "layout {}", layout),
            Expectation::Present => write!(f, "present"),
        }
    }
}

/// Model-configuration error with full diagnostic context
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status} at {item}: expected {expected}, got {actual}")]
pub struct ModelError {
    pub status: Status,
    pub item: ItemRef,
    pub expected: Expectation,
    pub actual: String,
}

impl ModelError {
    pub fn new(
        reason: ConfigReason,
        item: ItemRef,
        expected: Expectation,
        actual: impl fmt::Display,
    ) -> Self {
        Self {
            status: Status::ModelConfigurationInvalid(reason),
            item,
            expected,
            actual: actual.to_string(),
        }
    }

    pub fn active_list(item: ItemRef, expected: Expectation, actual: impl fmt::Display) -> Self {
        Self {
            status: Status::ActiveListIndicesInvalid,
            item,
            expected,
            actual: actual.to_string(),
        }
    }

    /// Reason for `ModelConfigurationInvalid` errors
    pub fn reason(&self) -> Option<ConfigReason> {
        match self.status {
            Status::ModelConfigurationInvalid(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Unified error type for accelforge
#[derive(Debug, thiserror::Error)]
pub enum AccelError {
    // ========== Model errors ==========
    #[error("Invalid model: {0}")]
    Model(#[from] ModelError),

    // ========== Capability errors ==========
    /// No kernel compiled for this combination
    #[error("Not implemented: {op:?} with {mode} on {accel}")]
    NotImplemented {
        op: KernelOp,
        mode: KernelMode,
        accel: AccelerationMode,
    },

    /// Transform variant does not own the requested operand
    #[error("Operand {0} is not present in this transform")]
    OperandNotPresent(OperandRole),

    // ========== Device errors ==========
    #[error("Memory not mapped for buffer {buffer:#x} after {attempts} attempts")]
    MemoryNotMapped { buffer: usize, attempts: u32 },

    #[error("Driver issued forbidden memory id {0}")]
    ForbiddenMemoryId(u64),

    #[error("Device hang detected on request {request}: session must be recreated")]
    DeviceHang { request: u64 },

    #[error("Device I/O failure: {0}")]
    DeviceIo(String),

    /// Device finished the request with a non-success hardware status
    #[error("Request {request} failed on device: {status}")]
    RequestFailed { request: u64, status: Status },

    #[error("Device {0} not available")]
    DeviceNotAvailable(u32),

    #[error("Unknown request id {0}")]
    UnknownRequest(u64),

    #[error("Invalid request state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // ========== Internal errors ==========
    #[error("Buffer access failed: {0}")]
    BufferAccess(String),

    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl<T> From<std::sync::PoisonError<T>> for AccelError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        AccelError::LockPoisoned(err.to_string())
    }
}

pub type AccelResult<T> = std::result::Result<T, AccelError>;

impl AccelError {
    pub fn status(&self) -> Status {
        match self {
            AccelError::Model(e) => e.status,
            AccelError::NotImplemented { .. } => Status::NotImplemented,
            AccelError::MemoryNotMapped { .. } => Status::MemoryNotMapped,
            AccelError::DeviceHang { .. } => Status::DeviceHangRecoveryRequired,
            AccelError::DeviceIo(_) => Status::DeviceIoError,
            AccelError::DeviceNotAvailable(_) => Status::DeviceNotAvailable,
            AccelError::RequestFailed { status, .. } => *status,
            AccelError::OperandNotPresent(_)
            | AccelError::ForbiddenMemoryId(_)
            | AccelError::UnknownRequest(_)
            | AccelError::InvalidStateTransition { .. }
            | AccelError::BufferAccess(_)
            | AccelError::LockPoisoned(_)
            | AccelError::Internal(_) => Status::Internal,
        }
    }

    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            AccelError::Model(_) => ErrorCategory::Model,
            AccelError::NotImplemented { .. } => ErrorCategory::Capability,
            AccelError::MemoryNotMapped { .. }
            | AccelError::DeviceHang { .. }
            | AccelError::DeviceIo(_)
            | AccelError::DeviceNotAvailable(_)
            | AccelError::RequestFailed { .. } => ErrorCategory::Device,
            _ => ErrorCategory::Internal,
        }
    }

    /// Recoverable by the caller without recreating the device session
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Model)
    }

    /// The device session can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AccelError::DeviceHang { .. } | AccelError::DeviceIo(_) | AccelError::MemoryNotMapped { .. }
        )
    }

    /// Borrow the model error, if this is one
    pub fn as_model_error(&self) -> Option<&ModelError> {
        match self {
            AccelError::Model(e) => Some(e),
            _ => None,
        }
    }
}

/// Error category for handling decisions
///
/// - Model: fix the model description and rebuild
/// - Capability: the runtime was never built for this combination
/// - Device: hardware or driver failure, usually session-ending
/// - Internal: indicates a bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Model,
    Capability,
    Device,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Model => write!(f, "Model"),
            ErrorCategory::Capability => write!(f, "Capability"),
            ErrorCategory::Device => write!(f, "Device"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("request {} lost its handle", id));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::AccelError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::AccelError::Internal(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(Status::Success.code(), 0);
        assert_eq!(Status::DeviceBusy.code(), 1);
        assert_eq!(Status::NotImplemented.code(), -2);
        assert_eq!(
            Status::ModelConfigurationInvalid(ConfigReason::PoolSize).code(),
            -1017
        );
        assert_eq!(
            Status::ModelConfigurationInvalid(ConfigReason::PoolStride).code(),
            -1018
        );
    }

    #[test]
    fn test_model_error_display_names_item() {
        let err = ModelError::new(
            ConfigReason::WeightVolume,
            ItemRef::operand(OperandRole::Weights).at_dim(Dim::H),
            Expectation::AtMost(65535),
            70000,
        );
        let text = err.to_string();
        assert!(text.contains("operand #2 (weights)"), "{}", text);
        assert!(text.contains("dim H"), "{}", text);
        assert!(text.contains("<= 65535"), "{}", text);
        assert!(text.contains("70000"), "{}", text);
    }

    #[test]
    fn test_error_categories() {
        let model: AccelError = ModelError::new(
            ConfigReason::Other,
            ItemRef::operation(),
            Expectation::Present,
            "none",
        )
        .into();
        assert_eq!(model.category(), ErrorCategory::Model);
        assert!(model.is_recoverable());
        assert!(!model.is_fatal());

        let not_impl = AccelError::NotImplemented {
            op: KernelOp::Affine,
            mode: KernelMode::new(DataType::Int16, DataType::Int16, DataType::CompoundBias),
            accel: AccelerationMode::Generic,
        };
        assert_eq!(not_impl.category(), ErrorCategory::Capability);
        assert_eq!(not_impl.status(), Status::NotImplemented);
        assert!(!not_impl.is_recoverable());

        let hang = AccelError::DeviceHang { request: 3 };
        assert_eq!(hang.category(), ErrorCategory::Device);
        assert_eq!(hang.status(), Status::DeviceHangRecoveryRequired);
        assert!(hang.is_fatal());
    }

    #[test]
    fn test_status_predicates() {
        assert!(Status::DeviceBusy.is_warning());
        assert!(Status::ActiveListIndicesInvalid.is_model_error());
        assert!(Status::ModelConfigurationInvalid(ConfigReason::BiasBytes).is_model_error());
        assert!(!Status::NotImplemented.is_model_error());
    }

    #[test]
    fn test_internal_error_macro() {
        let err = internal_error!("lost {}", 7);
        assert!(matches!(err, AccelError::Internal(_)));
        assert_eq!(err.to_string(), "Internal error: lost 7");
    }

    #[test]
    fn test_poison_error_from_impl_exists() {
        use std::sync::PoisonError;
        fn convert_poison<T>(err: PoisonError<T>) -> AccelError {
            AccelError::from(err)
        }
        let _ = convert_poison::<i32> as fn(PoisonError<i32>) -> AccelError;
    }
}
