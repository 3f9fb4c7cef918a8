//! Shared helpers for integration tests
//!
//! Descriptors here are small, hand-checked layers whose expected outputs are
//! documented next to each builder in [`fixtures`].

#![allow(dead_code)]

pub mod fixtures;

use std::time::Duration;

use accelforge::device::SessionConfig;
use accelforge::error::{AccelError, ModelError};

pub use fixtures::*;

/// Session config that never sleeps between map attempts
pub fn fast_session(map_attempts: u32) -> SessionConfig {
    SessionConfig::new()
        .with_map_retry(map_attempts, Duration::ZERO)
        .with_recovery_timeout(Duration::from_secs(5))
}

/// Unwrap the model error inside `err`, panicking on any other kind
pub fn model_error(err: AccelError) -> ModelError {
    match err {
        AccelError::Model(e) => e,
        other => panic!("expected a model error, got {:?}", other),
    }
}
