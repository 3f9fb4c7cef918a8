//! Scriptable driver for tests
//!
//! Never executes anything. Map, wait and verify answers come from scripts
//! set up by the test, and every call is counted in [`DummyDriverStats`].
//!
//! ```rust,ignore
//! let driver = DummyDriver::new()
//!     .with_map_delay(2)
//!     .push_wait(WaitOutcome::Pending)
//!     .push_verify(VerifyOutcome::Hung);
//! let stats = driver.shared_stats();
//! let session = DeviceSession::open(driver, SessionConfig::new())?;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::capability::HwGeneration;
use crate::error::{AccelError, AccelResult};
use crate::tensor::{Buffer, BufferId};

use super::request::{HardwareRequest, RequestId};
use super::{
    hw_status, CompletionHandle, DeviceCapabilities, DeviceDriver, MapOutcome, RequestProfiler,
    VerifyOutcome, WaitOutcome,
};

/// Call counters, shared so they outlive the session that owns the driver
#[derive(Debug, Default, Clone)]
pub struct DummyDriverStats {
    pub open_calls: usize,
    pub map_calls: usize,
    pub unmap_calls: usize,
    pub submit_calls: usize,
    pub wait_calls: usize,
    pub verify_calls: usize,
    /// Mappings handed out and not yet released
    pub live_mappings: usize,
    pub submitted: Vec<RequestId>,
    /// Size of the last serialized request
    pub last_request_bytes: usize,
    pub last_wait_timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct DummyDriver {
    generation: HwGeneration,
    open_fails: bool,
    forbidden_id: bool,
    fail_submit: bool,
    fail_wait: bool,
    fail_verify: bool,
    map_delay: u32,
    map_attempts: HashMap<BufferId, u32>,
    mapped: HashSet<u64>,
    next_id: u64,
    next_token: u64,
    completion_status: u32,
    waits: VecDeque<WaitOutcome>,
    verifies: VecDeque<VerifyOutcome>,
    stats: Arc<Mutex<DummyDriverStats>>,
}

impl Default for DummyDriver {
    fn default() -> Self {
        Self {
            generation: HwGeneration::default(),
            open_fails: false,
            forbidden_id: false,
            fail_submit: false,
            fail_wait: false,
            fail_verify: false,
            map_delay: 0,
            map_attempts: HashMap::new(),
            mapped: HashSet::new(),
            next_id: 1,
            next_token: 1,
            completion_status: hw_status::OK,
            waits: VecDeque::new(),
            verifies: VecDeque::new(),
            stats: Arc::new(Mutex::new(DummyDriverStats::default())),
        }
    }
}

impl DummyDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_generation(mut self, generation: HwGeneration) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_open_failure(mut self) -> Self {
        self.open_fails = true;
        self
    }

    /// Report every mapping as id 0
    pub fn with_forbidden_id(mut self) -> Self {
        self.forbidden_id = true;
        self
    }

    pub fn with_submit_failure(mut self) -> Self {
        self.fail_submit = true;
        self
    }

    /// Fail every wait with an I/O error
    pub fn with_wait_failure(mut self) -> Self {
        self.fail_wait = true;
        self
    }

    /// Fail every verify with an I/O error
    pub fn with_verify_failure(mut self) -> Self {
        self.fail_verify = true;
        self
    }

    /// Answer `NotVisible` this many times per buffer before mapping it
    pub fn with_map_delay(mut self, attempts: u32) -> Self {
        self.map_delay = attempts;
        self
    }

    /// Raw status reported by unscripted completions
    pub fn with_completion_status(mut self, raw: u32) -> Self {
        self.completion_status = raw;
        self
    }

    /// Queue a wait answer; unscripted waits complete
    pub fn push_wait(mut self, outcome: WaitOutcome) -> Self {
        self.waits.push_back(outcome);
        self
    }

    /// Queue a verify answer; unscripted verifies report still running
    pub fn push_verify(mut self, outcome: VerifyOutcome) -> Self {
        self.verifies.push_back(outcome);
        self
    }

    pub fn stats(&self) -> DummyDriverStats {
        self.lock_stats().clone()
    }

    pub fn shared_stats(&self) -> Arc<Mutex<DummyDriverStats>> {
        Arc::clone(&self.stats)
    }

    pub fn reset(&mut self) {
        self.map_attempts.clear();
        self.mapped.clear();
        self.waits.clear();
        self.verifies.clear();
        *self.lock_stats() = DummyDriverStats::default();
    }

    fn lock_stats(&self) -> MutexGuard<'_, DummyDriverStats> {
        // counters stay meaningful even if a test thread panicked holding them
        match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DeviceDriver for DummyDriver {
    fn open(&mut self, _index: u32) -> bool {
        self.lock_stats().open_calls += 1;
        !self.open_fails
    }

    fn capabilities(&self) -> AccelResult<DeviceCapabilities> {
        Ok(DeviceCapabilities {
            name: "dummy".to_string(),
            generation: self.generation,
        })
    }

    fn map_memory(&mut self, buffer: &Buffer) -> AccelResult<MapOutcome> {
        self.lock_stats().map_calls += 1;

        let attempts = self.map_attempts.entry(buffer.id()).or_insert(0);
        if *attempts < self.map_delay {
            *attempts += 1;
            return Ok(MapOutcome::NotVisible);
        }
        self.map_attempts.remove(&buffer.id());

        if self.forbidden_id {
            return Ok(MapOutcome::Mapped(0));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.mapped.insert(id);
        self.lock_stats().live_mappings += 1;
        Ok(MapOutcome::Mapped(id))
    }

    fn unmap_memory(&mut self, id: u64) -> AccelResult<()> {
        let released = self.mapped.remove(&id);
        let mut stats = self.lock_stats();
        stats.unmap_calls += 1;
        if released {
            stats.live_mappings -= 1;
        }
        Ok(())
    }

    fn submit(
        &mut self,
        request: &HardwareRequest,
        _profiler: Option<&Arc<RequestProfiler>>,
    ) -> AccelResult<CompletionHandle> {
        let bytes = request.to_bytes()?;
        {
            let mut stats = self.lock_stats();
            stats.submit_calls += 1;
            stats.submitted.push(request.id());
            stats.last_request_bytes = bytes.len();
        }
        if self.fail_submit {
            return Err(AccelError::DeviceIo("scripted submit failure".into()));
        }
        let token = self.next_token;
        self.next_token += 1;
        Ok(CompletionHandle {
            request: request.id(),
            token,
        })
    }

    fn wait(&mut self, _handle: &CompletionHandle, timeout: Duration) -> AccelResult<WaitOutcome> {
        {
            let mut stats = self.lock_stats();
            stats.wait_calls += 1;
            stats.last_wait_timeout = Some(timeout);
        }
        if self.fail_wait {
            return Err(AccelError::DeviceIo("scripted wait failure".into()));
        }
        Ok(self
            .waits
            .pop_front()
            .unwrap_or(WaitOutcome::Completed(self.completion_status)))
    }

    fn verify(&mut self, _handle: &CompletionHandle) -> AccelResult<VerifyOutcome> {
        self.lock_stats().verify_calls += 1;
        if self.fail_verify {
            return Err(AccelError::DeviceIo("scripted verify failure".into()));
        }
        Ok(self.verifies.pop_front().unwrap_or(VerifyOutcome::StillRunning))
    }
}
