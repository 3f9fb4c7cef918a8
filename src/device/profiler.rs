//! Per-request timing
//!
//! Timestamps come from [`Instant`], so they are monotonic within a process.
//! The session records submission and completion; drivers may add the
//! execution window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{AccelResult, Status};

use super::request::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileRecord {
    pub submitted: Option<Instant>,
    pub execution_start: Option<Instant>,
    pub execution_end: Option<Instant>,
    pub completed: Option<Instant>,
    pub outcome: Option<Status>,
}

impl ProfileRecord {
    /// Submission to completion
    pub fn total(&self) -> Option<Duration> {
        Some(self.completed?.saturating_duration_since(self.submitted?))
    }

    /// Time spent executing on the device
    pub fn execution(&self) -> Option<Duration> {
        Some(self.execution_end?.saturating_duration_since(self.execution_start?))
    }
}

/// Shared between a session and its driver
#[derive(Debug, Default)]
pub struct RequestProfiler {
    records: Mutex<HashMap<RequestId, ProfileRecord>>,
}

impl RequestProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F: FnOnce(&mut ProfileRecord)>(&self, request: RequestId, f: F) -> AccelResult<()> {
        let mut records = self.records.lock()?;
        f(records.entry(request).or_default());
        Ok(())
    }

    pub fn record_submit(&self, request: RequestId) -> AccelResult<()> {
        self.update(request, |r| r.submitted = Some(Instant::now()))
    }

    pub fn record_execution_start(&self, request: RequestId) -> AccelResult<()> {
        self.update(request, |r| r.execution_start = Some(Instant::now()))
    }

    pub fn record_execution_end(&self, request: RequestId) -> AccelResult<()> {
        self.update(request, |r| r.execution_end = Some(Instant::now()))
    }

    pub fn record_completion(&self, request: RequestId, outcome: Status) -> AccelResult<()> {
        self.update(request, |r| {
            r.completed = Some(Instant::now());
            r.outcome = Some(outcome);
        })
    }

    pub fn get(&self, request: RequestId) -> AccelResult<Option<ProfileRecord>> {
        Ok(self.records.lock()?.get(&request).copied())
    }

    pub fn len(&self) -> AccelResult<usize> {
        Ok(self.records.lock()?.len())
    }

    pub fn clear(&self) -> AccelResult<()> {
        self.records.lock()?.clear();
        Ok(())
    }
}
