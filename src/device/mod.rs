//! Device submission layer
//!
//! [`DeviceSession`] drives a [`DeviceDriver`]:
//! - buffers are registered once and memoized by identity, retrying while the
//!   driver reports them as not yet visible
//! - submission returns immediately with a request id
//! - a wait that times out triggers a hang check; a confirmed hang poisons the
//!   session and every later submission is refused
//!
//! Sessions are `Send` but not `Sync`. Every protocol call takes `&mut self`,
//! so one session is never used from two threads at once.

pub mod config;
pub mod dummy_driver;
pub mod memory;
pub mod profiler;
pub mod request;
pub mod software;

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::HwGeneration;
use crate::error::{AccelError, AccelResult, ConfigReason, Status};
use crate::kernels::{AccelerationMode, KernelRegistry};
use crate::tensor::{Buffer, BufferId};
use crate::validator::Validator;

pub use config::{AccelerationPreference, ConfigError, SessionConfig};
pub use dummy_driver::{DummyDriver, DummyDriverStats};
pub use memory::{MappingEntry, MemoryMapTable, FORBIDDEN_MEMORY_ID};
pub use profiler::{ProfileRecord, RequestProfiler};
pub use request::{HardwareRequest, RequestConfig, RequestId, RequestLayer, RequestState};
pub use software::SoftwareDevice;

/// Raw hardware completion codes understood by [`translate_hw_status`]
pub mod hw_status {
    pub const OK: u32 = 0;
    /// Completed, at least one value was clamped
    pub const SATURATED: u32 = 1;
    pub const PARAM_ERROR: u32 = 0x10;
    pub const UNSUPPORTED: u32 = 0x20;
    pub const DMA_ERROR: u32 = 0x40;
}

/// Map a raw hardware status word onto [`Status`]
pub fn translate_hw_status(raw: u32) -> Status {
    match raw {
        hw_status::OK | hw_status::SATURATED => Status::Success,
        hw_status::PARAM_ERROR => Status::ModelConfigurationInvalid(ConfigReason::Other),
        hw_status::UNSUPPORTED => Status::NotImplemented,
        hw_status::DMA_ERROR => Status::DeviceIoError,
        _ => Status::Internal,
    }
}

/// What an opened device reports about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub name: String,
    pub generation: HwGeneration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    Mapped(u64),
    /// Registration not visible yet; try again
    NotVisible,
}

/// Driver-side token for one submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionHandle {
    pub request: RequestId,
    pub token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Finished with a raw hardware status word
    Completed(u32),
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    StillRunning,
    Hung,
}

/// Boundary to the device driver
pub trait DeviceDriver: Send {
    /// `false` when no device exists at `index`
    fn open(&mut self, index: u32) -> bool;

    fn capabilities(&self) -> AccelResult<DeviceCapabilities>;

    fn map_memory(&mut self, buffer: &Buffer) -> AccelResult<MapOutcome>;

    fn unmap_memory(&mut self, id: u64) -> AccelResult<()>;

    /// Start execution; must not block until completion
    fn submit(
        &mut self,
        request: &HardwareRequest,
        profiler: Option<&Arc<RequestProfiler>>,
    ) -> AccelResult<CompletionHandle>;

    fn wait(&mut self, handle: &CompletionHandle, timeout: Duration) -> AccelResult<WaitOutcome>;

    /// Secondary check after a wait timed out
    fn verify(&mut self, handle: &CompletionHandle) -> AccelResult<VerifyOutcome>;

    fn translate_status(&self, raw: u32) -> Status {
        translate_hw_status(raw)
    }
}

/// Result of a wait that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Completed,
    /// Timed out but the device is alive; wait again
    StillRunning,
}

impl RequestStatus {
    pub fn status(self) -> Status {
        match self {
            RequestStatus::Completed => Status::Success,
            RequestStatus::StillRunning => Status::DeviceBusy,
        }
    }
}

struct InFlight {
    request: HardwareRequest,
    handle: CompletionHandle,
}

/// Condition that makes a session refuse further submissions
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionFault {
    Hang(RequestId),
    Io { request: RequestId, message: String },
}

/// Owns one opened device and everything registered with it
pub struct DeviceSession<D: DeviceDriver> {
    driver: D,
    config: SessionConfig,
    capabilities: DeviceCapabilities,
    acceleration: AccelerationMode,
    memory: MemoryMapTable,
    in_flight: HashMap<RequestId, InFlight>,
    profiler: Option<Arc<RequestProfiler>>,
    fault: Option<SessionFault>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<D: DeviceDriver> DeviceSession<D> {
    pub fn open(mut driver: D, config: SessionConfig) -> AccelResult<Self> {
        if !driver.open(config.device_index) {
            return Err(AccelError::DeviceNotAvailable(config.device_index));
        }
        let capabilities = driver.capabilities()?;

        let registry = KernelRegistry::global();
        let acceleration = match config.acceleration {
            AccelerationPreference::Auto => registry.fastest_mode(),
            AccelerationPreference::Fixed(mode) => {
                if !registry.supports(mode) {
                    tracing::warn!(
                        "Acceleration {} not supported on this host, kernels will report NotImplemented",
                        mode
                    );
                }
                mode
            }
        };

        tracing::debug!(
            "Opened device {} ({}, {}), acceleration {}",
            config.device_index,
            capabilities.name,
            capabilities.generation,
            acceleration
        );

        Ok(Self {
            driver,
            config,
            capabilities,
            acceleration,
            memory: MemoryMapTable::new(),
            in_flight: HashMap::new(),
            profiler: None,
            fault: None,
            _not_sync: PhantomData,
        })
    }

    pub fn with_profiler(mut self, profiler: Arc<RequestProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Generation used for validation
    pub fn generation(&self) -> HwGeneration {
        self.config
            .generation_override
            .unwrap_or(self.capabilities.generation)
    }

    pub fn validator(&self) -> Validator {
        Validator::new(self.generation())
    }

    pub fn acceleration(&self) -> AccelerationMode {
        self.acceleration
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn is_hung(&self) -> bool {
        matches!(self.fault, Some(SessionFault::Hang(_)))
    }

    /// True once a hang or a driver I/O failure has made the session unusable
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    pub fn mapped_count(&self) -> usize {
        self.memory.len()
    }

    pub fn mapping(&self, buffer: BufferId) -> Option<&MappingEntry> {
        self.memory.get(buffer)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn request_state(&self, request: RequestId) -> Option<RequestState> {
        self.in_flight.get(&request).map(|f| f.request.state())
    }

    /// Register `buffer` with the device, or return its existing mapping id
    pub fn map(&mut self, buffer: &Buffer) -> AccelResult<u64> {
        if let Some(entry) = self.memory.get(buffer.id()) {
            return Ok(entry.id);
        }

        let attempts = self.config.map_retry_iterations.max(1);
        for attempt in 1..=attempts {
            match self.driver.map_memory(buffer)? {
                MapOutcome::Mapped(FORBIDDEN_MEMORY_ID) => {
                    return Err(AccelError::ForbiddenMemoryId(FORBIDDEN_MEMORY_ID));
                }
                MapOutcome::Mapped(id) => {
                    tracing::debug!(
                        "Mapped buffer {} ({} bytes) as {} after {} attempt(s)",
                        buffer.id(),
                        buffer.len(),
                        id,
                        attempt
                    );
                    return Ok(self.memory.insert(buffer, id).id);
                }
                MapOutcome::NotVisible => {
                    if attempt < attempts {
                        tracing::trace!("buffer {} not visible yet (attempt {})", buffer.id(), attempt);
                        std::thread::sleep(self.config.map_retry_delay);
                    }
                }
            }
        }

        tracing::warn!("Buffer {} not mapped after {} attempts", buffer.id(), attempts);
        Err(AccelError::MemoryNotMapped {
            buffer: buffer.id().0,
            attempts,
        })
    }

    /// Release the mapping of `buffer`; unknown buffers are ignored
    pub fn unmap(&mut self, buffer: BufferId) -> AccelResult<()> {
        match self.memory.remove(buffer) {
            Some(entry) => self.release(entry),
            None => Ok(()),
        }
    }

    /// Release a mapping by id; unknown ids are ignored
    pub fn unmap_id(&mut self, id: u64) -> AccelResult<()> {
        match self.memory.remove_id(id) {
            Some(entry) => self.release(entry),
            None => Ok(()),
        }
    }

    fn release(&mut self, entry: MappingEntry) -> AccelResult<()> {
        if let Some(ticket) = entry.ticket {
            if self.in_flight.contains_key(&ticket) {
                tracing::warn!(
                    "Unmapping {} while request {} is still in flight",
                    entry.id,
                    ticket
                );
            }
        }
        self.driver.unmap_memory(entry.id)?;
        tracing::debug!("Unmapped {} ({} bytes)", entry.id, entry.size);
        Ok(())
    }

    /// Build, register and submit a request
    pub fn submit(&mut self, config: &RequestConfig) -> AccelResult<RequestId> {
        let request = HardwareRequest::build(config)?;
        self.submit_request(request)
    }

    pub fn submit_request(&mut self, mut request: HardwareRequest) -> AccelResult<RequestId> {
        match &self.fault {
            Some(SessionFault::Hang(request)) => {
                return Err(AccelError::DeviceHang { request: *request });
            }
            Some(SessionFault::Io { request, message }) => {
                return Err(AccelError::DeviceIo(format!(
                    "session unusable after request {}: {}",
                    request, message
                )));
            }
            None => {}
        }
        request.set_default_acceleration(self.acceleration);

        for buffer in request.buffers() {
            match self.map(&buffer) {
                Ok(id) => {
                    request.bind_mapping(buffer.id(), id);
                    self.memory.stamp(buffer.id(), request.id());
                }
                Err(e) => {
                    request.transition(RequestState::Failed)?;
                    return Err(e);
                }
            }
        }
        request.transition(RequestState::MemoryRegistered)?;

        let id = request.id();
        if let Some(profiler) = &self.profiler {
            profiler.record_submit(id)?;
        }
        let handle = match self.driver.submit(&request, self.profiler.as_ref()) {
            Ok(handle) => handle,
            Err(e) => {
                request.transition(RequestState::Failed)?;
                self.record_completion(id, e.status())?;
                return Err(e);
            }
        };
        request.transition(RequestState::Submitted)?;
        tracing::debug!("Submitted request {} (token {})", id, handle.token);

        self.in_flight.insert(id, InFlight { request, handle });
        Ok(id)
    }

    /// Wait up to `min(timeout, recovery_timeout)` for `request`
    ///
    /// `Ok(StillRunning)` leaves the request in flight. Every other outcome
    /// retires it.
    pub fn wait(&mut self, request: RequestId, timeout: Duration) -> AccelResult<RequestStatus> {
        let effective = timeout.min(self.config.recovery_timeout);
        let handle = self
            .in_flight
            .get(&request)
            .map(|f| f.handle)
            .ok_or(AccelError::UnknownRequest(request))?;

        let outcome = match self.driver.wait(&handle, effective) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail_wait(request, e)),
        };

        match outcome {
            WaitOutcome::Completed(raw) => {
                let status = self.driver.translate_status(raw);
                if status.is_success() {
                    self.retire(request, RequestState::Completed, status)?;
                    tracing::debug!("Request {} completed (raw {:#x})", request, raw);
                    Ok(RequestStatus::Completed)
                } else {
                    self.retire(request, RequestState::Failed, status)?;
                    tracing::warn!("Request {} failed with {} (raw {:#x})", request, status, raw);
                    Err(AccelError::RequestFailed { request, status })
                }
            }
            WaitOutcome::Pending => {
                if let Some(flight) = self.in_flight.get_mut(&request) {
                    flight.request.transition(RequestState::TimedOut)?;
                }
                let verified = match self.driver.verify(&handle) {
                    Ok(verified) => verified,
                    Err(e) => return Err(self.fail_wait(request, e)),
                };
                match verified {
                    VerifyOutcome::StillRunning => {
                        tracing::debug!("Request {} still running after {:?}", request, effective);
                        Ok(RequestStatus::StillRunning)
                    }
                    VerifyOutcome::Hung => {
                        self.retire(request, RequestState::Failed, Status::DeviceHangRecoveryRequired)?;
                        self.fault = Some(SessionFault::Hang(request));
                        tracing::error!("Device hang on request {}, session needs recreation", request);
                        Err(AccelError::DeviceHang { request })
                    }
                }
            }
        }
    }

    /// Retire `request` after a driver error; I/O failures end the session
    fn fail_wait(&mut self, request: RequestId, err: AccelError) -> AccelError {
        if let Err(e) = self.retire(request, RequestState::Failed, err.status()) {
            tracing::warn!("Failed to retire request {}: {}", request, e);
        }
        if let AccelError::DeviceIo(message) = &err {
            tracing::error!("Driver I/O failure on request {}, session needs recreation", request);
            self.fault = Some(SessionFault::Io {
                request,
                message: message.clone(),
            });
        }
        err
    }

    fn retire(&mut self, request: RequestId, state: RequestState, status: Status) -> AccelResult<()> {
        if let Some(mut flight) = self.in_flight.remove(&request) {
            flight.request.transition(state)?;
        }
        self.record_completion(request, status)
    }

    fn record_completion(&self, request: RequestId, status: Status) -> AccelResult<()> {
        match &self.profiler {
            Some(profiler) => profiler.record_completion(request, status),
            None => Ok(()),
        }
    }
}

impl<D: DeviceDriver> fmt::Debug for DeviceSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_index", &self.config.device_index)
            .field("generation", &self.generation())
            .field("acceleration", &self.acceleration)
            .field("mapped", &self.memory.len())
            .field("in_flight", &self.in_flight.len())
            .field("fault", &self.fault)
            .finish()
    }
}

impl<D: DeviceDriver> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        if !self.in_flight.is_empty() {
            tracing::warn!(
                "Closing device session with {} request(s) in flight",
                self.in_flight.len()
            );
        }
        for id in self.memory.ids() {
            if let Err(e) = self.driver.unmap_memory(id) {
                tracing::warn!("Failed to unmap {} on session close: {}", id, e);
            }
        }
        self.memory = MemoryMapTable::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_hw_status() {
        assert_eq!(translate_hw_status(hw_status::OK), Status::Success);
        assert_eq!(translate_hw_status(hw_status::SATURATED), Status::Success);
        assert_eq!(translate_hw_status(hw_status::DMA_ERROR), Status::DeviceIoError);
        assert_eq!(translate_hw_status(hw_status::UNSUPPORTED), Status::NotImplemented);
        assert!(translate_hw_status(hw_status::PARAM_ERROR).is_model_error());
        assert_eq!(translate_hw_status(0xdead), Status::Internal);
    }

    #[test]
    fn test_request_status_mapping() {
        assert_eq!(RequestStatus::Completed.status(), Status::Success);
        assert_eq!(RequestStatus::StillRunning.status(), Status::DeviceBusy);
        assert!(RequestStatus::StillRunning.status().is_warning());
    }

    #[test]
    fn test_open_failure() {
        let err = DeviceSession::open(DummyDriver::new().with_open_failure(), SessionConfig::new())
            .unwrap_err();
        assert!(matches!(err, AccelError::DeviceNotAvailable(0)));
    }

    #[test]
    fn test_map_is_memoized() {
        let mut session = DeviceSession::open(DummyDriver::new(), SessionConfig::new()).unwrap();
        let buffer = Buffer::zeroed(16);
        let first = session.map(&buffer).unwrap();
        let second = session.map(&buffer.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(session.driver().stats().map_calls, 1);
        assert_eq!(session.mapped_count(), 1);
    }

    #[test]
    fn test_map_retries_until_visible() {
        let config = SessionConfig::new().with_map_retry(5, Duration::ZERO);
        let mut session = DeviceSession::open(DummyDriver::new().with_map_delay(3), config).unwrap();
        session.map(&Buffer::zeroed(8)).unwrap();
        assert_eq!(session.driver().stats().map_calls, 4);
    }

    #[test]
    fn test_map_exhaustion() {
        let config = SessionConfig::new().with_map_retry(3, Duration::ZERO);
        let mut session = DeviceSession::open(DummyDriver::new().with_map_delay(10), config).unwrap();
        let err = session.map(&Buffer::zeroed(8)).unwrap_err();
        assert!(matches!(err, AccelError::MemoryNotMapped { attempts: 3, .. }));
        assert_eq!(err.status(), Status::MemoryNotMapped);
        assert_eq!(session.mapped_count(), 0);
    }

    #[test]
    fn test_forbidden_id() {
        let mut session =
            DeviceSession::open(DummyDriver::new().with_forbidden_id(), SessionConfig::new()).unwrap();
        let err = session.map(&Buffer::zeroed(8)).unwrap_err();
        assert!(matches!(err, AccelError::ForbiddenMemoryId(0)));
        assert_eq!(err.status(), Status::Internal);
    }

    #[test]
    fn test_unmap_is_idempotent() {
        let mut session = DeviceSession::open(DummyDriver::new(), SessionConfig::new()).unwrap();
        let buffer = Buffer::zeroed(8);
        let id = session.map(&buffer).unwrap();
        session.unmap(buffer.id()).unwrap();
        session.unmap(buffer.id()).unwrap();
        session.unmap_id(id).unwrap();
        assert_eq!(session.driver().stats().unmap_calls, 1);
        assert_eq!(session.mapped_count(), 0);
    }

    #[test]
    fn test_drop_releases_all_mappings() {
        let driver = DummyDriver::new();
        let stats = driver.shared_stats();
        {
            let mut session = DeviceSession::open(driver, SessionConfig::new()).unwrap();
            session.map(&Buffer::zeroed(8)).unwrap();
            session.map(&Buffer::zeroed(8)).unwrap();
        }
        let stats = stats.lock().unwrap();
        assert_eq!(stats.unmap_calls, 2);
        assert_eq!(stats.live_mappings, 0);
    }

    #[test]
    fn test_generation_override() {
        let session = DeviceSession::open(
            DummyDriver::new().with_generation(HwGeneration::V3),
            SessionConfig::new().with_generation(HwGeneration::V1),
        )
        .unwrap();
        assert_eq!(session.capabilities().generation, HwGeneration::V3);
        assert_eq!(session.generation(), HwGeneration::V1);
        assert_eq!(session.validator().generation(), HwGeneration::V1);
    }

    #[test]
    fn test_unknown_request() {
        let mut session = DeviceSession::open(DummyDriver::new(), SessionConfig::new()).unwrap();
        let err = session.wait(12345, Duration::ZERO).unwrap_err();
        assert!(matches!(err, AccelError::UnknownRequest(12345)));
    }
}
