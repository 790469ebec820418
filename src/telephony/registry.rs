//! # Session Registry
//!
//! Tracks the live audio bridge for every active call, keyed by call SID.
//!
//! ## Guarantees:
//! - **At most one bridge per call**: a second media socket for the same
//!   call is rejected at registration, before it can touch the engine
//! - **Bounded concurrency**: the stream ceiling is checked under the same
//!   write lock that inserts, so a burst of registrations cannot overshoot
//!   it
//! - **Exactly-once removal**: however many cleanup paths race, only one
//!   gets the bridge back and runs teardown with it

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::telephony::bridge::AudioBridge;

/// Why a registration was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    /// The call already has a live bridge
    AlreadyActive,

    /// The registry already holds `limit` bridges
    AtCapacity(usize),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::AlreadyActive => write!(f, "call already has an active stream"),
            RegisterError::AtCapacity(limit) => {
                write!(f, "concurrent stream limit of {} reached", limit)
            }
        }
    }
}

pub struct SessionRegistry {
    bridges: RwLock<HashMap<String, Arc<AudioBridge>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            bridges: RwLock::new(HashMap::new()),
        }
    }

    /// Register the bridge for a call, holding the registry to `limit`
    /// entries.
    ///
    /// ## Returns:
    /// `Err` if the call already has a live bridge or the registry is
    /// full. Both checks happen under the write lock that creates the
    /// entry, so racing sockets can neither double-register a call nor
    /// push the registry past the ceiling.
    pub fn register(
        &self,
        call_sid: &str,
        bridge: Arc<AudioBridge>,
        limit: usize,
    ) -> Result<(), RegisterError> {
        let mut bridges = self.bridges.write().unwrap();

        if bridges.contains_key(call_sid) {
            return Err(RegisterError::AlreadyActive);
        }
        if bridges.len() >= limit {
            return Err(RegisterError::AtCapacity(limit));
        }

        debug!(call_sid = %call_sid, "Registered audio bridge");
        bridges.insert(call_sid.to_string(), bridge);
        Ok(())
    }

    pub fn get(&self, call_sid: &str) -> Option<Arc<AudioBridge>> {
        self.bridges.read().unwrap().get(call_sid).cloned()
    }

    /// Remove and return the bridge for a call.
    ///
    /// The entry leaves the map under the write lock, so concurrent
    /// cleanup paths see it `Some` exactly once.
    pub fn remove(&self, call_sid: &str) -> Option<Arc<AudioBridge>> {
        let removed = self.bridges.write().unwrap().remove(call_sid);
        if removed.is_some() {
            debug!(call_sid = %call_sid, "Removed audio bridge");
        }
        removed
    }

    pub fn is_active(&self, call_sid: &str) -> bool {
        self.bridges.read().unwrap().contains_key(call_sid)
    }

    pub fn active_count(&self) -> usize {
        self.bridges.read().unwrap().len()
    }

    pub fn active_call_sids(&self) -> Vec<String> {
        self.bridges.read().unwrap().keys().cloned().collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
