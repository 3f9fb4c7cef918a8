//! accelforge - accelerator execution runtime
//!
//! Validates layer descriptions against per-generation hardware
//! capabilities, builds immutable transforms bound to the fastest kernel
//! the host supports, and submits them to a device with bounded retry and
//! hang detection.
//!
//! ```ignore
//! let validator = Validator::new(HwGeneration::V3);
//! let transform = build_transform(&descriptor, &validator)?.expect("enabled");
//! let mut session = DeviceSession::open(SoftwareDevice::default(), SessionConfig::new())?;
//! let request = session.submit(&RequestConfig::new().with_layer(transform.into()))?;
//! session.wait(request, Duration::from_secs(1))?;
//! ```

#![allow(clippy::needless_range_loop)] // Clearer for row/column kernels
#![allow(clippy::type_complexity)] // Kernel tables are keyed by tuples

pub mod capability;
pub mod device;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod tensor;
pub mod transform;
pub mod validator;

pub use capability::{CapabilityTable, HwGeneration, OperationKind};
pub use device::{
    DeviceDriver, DeviceSession, DummyDriver, HardwareRequest, RequestConfig, RequestProfiler,
    RequestStatus, SessionConfig, SoftwareDevice,
};
pub use error::{AccelError, AccelResult, ErrorCategory, ModelError, Status};
pub use kernels::{AccelerationMode, KernelRegistry};
pub use tensor::{Buffer, DataType, OperandRole, Shape, Tensor, TensorDesc};
pub use transform::{build_transform, OperationDescriptor, Transform};
pub use validator::Validator;
