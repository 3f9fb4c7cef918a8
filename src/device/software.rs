//! Host-backed device
//!
//! Requests run on a single worker thread with the CPU kernels, in
//! submission order. Completion is signalled through a condition variable so
//! `wait` honours its timeout without polling.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::capability::HwGeneration;
use crate::error::{AccelError, AccelResult};
use crate::internal_error;
use crate::kernels::{AccelerationMode, ExecutionContext};
use crate::tensor::{Buffer, BufferId};

use super::request::HardwareRequest;
use super::{
    hw_status, CompletionHandle, DeviceCapabilities, DeviceDriver, MapOutcome, RequestProfiler,
    VerifyOutcome, WaitOutcome,
};

#[derive(Debug, Default)]
struct Completion {
    raw: Mutex<Option<u32>>,
    ready: Condvar,
}

impl Completion {
    fn finish(&self, raw: u32) {
        let mut slot = match self.raw.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(raw);
        self.ready.notify_all();
    }
}

struct Job {
    request: HardwareRequest,
    completion: Arc<Completion>,
    profiler: Option<Arc<RequestProfiler>>,
    delay: Duration,
}

#[derive(Debug)]
struct Worker {
    sender: Sender<Job>,
    handle: JoinHandle<()>,
}

/// [`DeviceDriver`] executing requests on the host
#[derive(Debug)]
pub struct SoftwareDevice {
    generation: HwGeneration,
    device_count: u32,
    execution_delay: Duration,
    worker: Option<Worker>,
    next_mapping: u64,
    mapped: HashMap<u64, BufferId>,
    next_token: u64,
    jobs: HashMap<u64, Arc<Completion>>,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new(HwGeneration::default())
    }
}

impl SoftwareDevice {
    pub fn new(generation: HwGeneration) -> Self {
        Self {
            generation,
            device_count: 1,
            execution_delay: Duration::ZERO,
            worker: None,
            next_mapping: 1,
            mapped: HashMap::new(),
            next_token: 1,
            jobs: HashMap::new(),
        }
    }

    /// Sleep before each request, to exercise timeouts
    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    pub fn is_open(&self) -> bool {
        self.worker.is_some()
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped.len()
    }

    fn spawn_worker() -> std::io::Result<Worker> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name("accelforge-sw-device".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    run_job(job);
                }
                tracing::trace!("software device worker exiting");
            })?;
        Ok(Worker { sender, handle })
    }
}

fn run_job(job: Job) {
    let id = job.request.id();
    if !job.delay.is_zero() {
        thread::sleep(job.delay);
    }
    if let Some(profiler) = &job.profiler {
        if let Err(e) = profiler.record_execution_start(id) {
            tracing::warn!("profiler: {}", e);
        }
    }

    let accel = job.request.acceleration().unwrap_or(AccelerationMode::Generic);
    let mut ctx = ExecutionContext::new();
    let raw = match job.request.execute(accel, &mut ctx) {
        Ok(()) if ctx.saturations() > 0 => {
            tracing::debug!("request {} saturated {} value(s)", id, ctx.saturations());
            hw_status::SATURATED
        }
        Ok(()) => hw_status::OK,
        Err(e) => {
            tracing::warn!("request {} failed on software device: {}", id, e);
            raw_status_for(&e)
        }
    };

    if let Some(profiler) = &job.profiler {
        if let Err(e) = profiler.record_execution_end(id) {
            tracing::warn!("profiler: {}", e);
        }
    }
    job.completion.finish(raw);
}

fn raw_status_for(err: &AccelError) -> u32 {
    match err {
        AccelError::NotImplemented { .. } => hw_status::UNSUPPORTED,
        e if e.status().is_model_error() => hw_status::PARAM_ERROR,
        _ => hw_status::DMA_ERROR,
    }
}

impl DeviceDriver for SoftwareDevice {
    fn open(&mut self, index: u32) -> bool {
        if index >= self.device_count {
            return false;
        }
        if self.worker.is_some() {
            return true;
        }
        match Self::spawn_worker() {
            Ok(worker) => {
                self.worker = Some(worker);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to start software device worker: {}", e);
                false
            }
        }
    }

    fn capabilities(&self) -> AccelResult<DeviceCapabilities> {
        Ok(DeviceCapabilities {
            name: "software".to_string(),
            generation: self.generation,
        })
    }

    fn map_memory(&mut self, buffer: &Buffer) -> AccelResult<MapOutcome> {
        let id = self.next_mapping;
        self.next_mapping += 1;
        self.mapped.insert(id, buffer.id());
        Ok(MapOutcome::Mapped(id))
    }

    fn unmap_memory(&mut self, id: u64) -> AccelResult<()> {
        self.mapped.remove(&id);
        Ok(())
    }

    fn submit(
        &mut self,
        request: &HardwareRequest,
        profiler: Option<&Arc<RequestProfiler>>,
    ) -> AccelResult<CompletionHandle> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| AccelError::DeviceIo("software device not open".into()))?;

        for buffer in request.buffers() {
            let registered = request
                .mapping(buffer.id())
                .map_or(false, |id| self.mapped.contains_key(&id));
            if !registered {
                return Err(internal_error!(
                    "request {}: buffer {} not registered",
                    request.id(),
                    buffer.id()
                ));
            }
        }

        let completion = Arc::new(Completion::default());
        let job = Job {
            request: request.clone(),
            completion: Arc::clone(&completion),
            profiler: profiler.cloned(),
            delay: self.execution_delay,
        };
        worker
            .sender
            .send(job)
            .map_err(|_| AccelError::DeviceIo("software device worker stopped".into()))?;

        let token = self.next_token;
        self.next_token += 1;
        self.jobs.insert(token, completion);
        Ok(CompletionHandle {
            request: request.id(),
            token,
        })
    }

    fn wait(&mut self, handle: &CompletionHandle, timeout: Duration) -> AccelResult<WaitOutcome> {
        let completion = self
            .jobs
            .get(&handle.token)
            .cloned()
            .ok_or(AccelError::UnknownRequest(handle.request))?;

        let slot = completion.raw.lock()?;
        let (slot, _) = completion
            .ready
            .wait_timeout_while(slot, timeout, |raw| raw.is_none())?;
        match *slot {
            Some(raw) => {
                self.jobs.remove(&handle.token);
                Ok(WaitOutcome::Completed(raw))
            }
            None => Ok(WaitOutcome::Pending),
        }
    }

    fn verify(&mut self, handle: &CompletionHandle) -> AccelResult<VerifyOutcome> {
        if !self.jobs.contains_key(&handle.token) {
            return Err(AccelError::UnknownRequest(handle.request));
        }
        let alive = self
            .worker
            .as_ref()
            .map_or(false, |w| !w.handle.is_finished());
        Ok(if alive {
            VerifyOutcome::StillRunning
        } else {
            VerifyOutcome::Hung
        })
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            drop(worker.sender);
            if worker.handle.join().is_err() {
                tracing::warn!("software device worker panicked");
            }
        }
    }
}
