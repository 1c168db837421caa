use crate::error::StoreError;
use bytes::Bytes;
use std::sync::Mutex;

/// StateMachine is the host state machine committed commands are applied to.
/// The applier guarantees exactly-once invocation per committed index, in
/// index order, so implementations need not be idempotent.
pub trait StateMachine: Send + Sync {
    fn apply(&self, data: Bytes) -> Result<Bytes, StoreError>;
}

/// MemoryStateMachine records every applied command and echoes the payload
/// back as the command result.
pub struct MemoryStateMachine {
    applied: Mutex<Vec<Bytes>>,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        MemoryStateMachine {
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn applied(&self) -> Vec<Bytes> {
        self.applied
            .lock()
            .expect("state machine mutex poisoned")
            .clone()
    }
}

impl Default for MemoryStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for MemoryStateMachine {
    fn apply(&self, data: Bytes) -> Result<Bytes, StoreError> {
        self.applied
            .lock()
            .expect("state machine mutex poisoned")
            .push(data.clone());
        Ok(data)
    }
}
