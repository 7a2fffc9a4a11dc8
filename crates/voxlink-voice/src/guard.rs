//! Exclusive ownership of the microphone and of signaling subscriptions.
//!
//! Both the session manager and the fallback transport acquire through the
//! same guard, so whichever initializes second is rejected instead of
//! silently opening a second capture stream.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{VoiceError, VoiceResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Resource {
    Capture,
    Topic { topic: String, user: String },
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Capture => write!(f, "capture stream"),
            Resource::Topic { topic, user } => write!(f, "subscription {topic} for {user}"),
        }
    }
}

/// Registry of live single-owner resources
#[derive(Clone, Default)]
pub struct ResourceGuard {
    held: Arc<Mutex<HashSet<Resource>>>,
}

impl ResourceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Resource>> {
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn claim(&self, resource: Resource) -> VoiceResult<Claim> {
        let mut held = self.lock();
        if held.contains(&resource) {
            return Err(VoiceError::AlreadyInitialized(resource.to_string()));
        }
        debug!("Claimed {resource}");
        held.insert(resource.clone());
        Ok(Claim {
            guard: self.clone(),
            resource: Some(resource),
        })
    }

    /// Claim the local microphone
    pub fn claim_capture(&self) -> VoiceResult<Claim> {
        self.claim(Resource::Capture)
    }

    /// Claim the subscription of `user` on `topic`
    pub fn claim_topic(&self, topic: &str, user: &str) -> VoiceResult<Claim> {
        self.claim(Resource::Topic {
            topic: topic.to_string(),
            user: user.to_string(),
        })
    }

    pub fn capture_held(&self) -> bool {
        self.lock().contains(&Resource::Capture)
    }

    pub fn held_count(&self) -> usize {
        self.lock().len()
    }
}

/// RAII claim; releases the resource when dropped
pub struct Claim {
    guard: ResourceGuard,
    resource: Option<Resource>,
}

impl Claim {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(resource) = self.resource.take() {
            debug!("Released {resource}");
            self.guard.lock().remove(&resource);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.release_inner();
    }
}
