//! Hooks standing in for platform scripts in tests.
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::HookError;
use crate::hooks::PlatformHook;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: String,
    pub args: Vec<Value>,
}

/// Records every call it receives. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingHook {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl RecordingHook {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<RecordedCall> {
        self.calls.lock().unwrap().last().cloned()
    }
}

impl PlatformHook for RecordingHook {
    fn call(&self, method: &str, args: Vec<Value>) -> Result<(), HookError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: method.to_owned(),
            args,
        });
        Ok(())
    }
}

/// Rejects every call, like a platform script throwing.
#[derive(Clone, Default)]
pub struct FailingHook;

impl PlatformHook for FailingHook {
    fn call(&self, method: &str, _args: Vec<Value>) -> Result<(), HookError> {
        Err(HookError::Rejected(format!("{method} blew up")))
    }
}
