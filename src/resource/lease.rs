//! Scoped leases for heavy device-resident resources.
//!
//! The pipeline's memory budget accommodates exactly one large model at a
//! time, so every stage wraps its model in a lease obtained from the
//! `ResourceArbiter`. The arbiter enforces the single-resident invariant:
//! at most one resource class is in {Loading, Resident, Unloading} across
//! the whole process. Release happens in `Drop`, so a lease can never
//! outlive its stage — success, error or unwind.

use std::fmt;
use std::ops::Deref;
use std::sync::{Condvar, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ResourceError;

// ═══════════════════════════════════════════════════════════
// Constants — estimated model footprints
// ═══════════════════════════════════════════════════════════

/// Vision/OCR document model (bytes).
const VISION_FOOTPRINT_BYTES: u64 = 4_200_000_000;
/// Bi-encoder embedding model for retrieval (bytes).
const RETRIEVAL_FOOTPRINT_BYTES: u64 = 1_100_000_000;
/// Clinical reasoning LLM, Q8 quantization (bytes).
const REASONING_FOOTPRINT_BYTES: u64 = 9_600_000_000;
/// Voice-cloning speech synthesis model (bytes).
const VOICE_FOOTPRINT_BYTES: u64 = 3_400_000_000;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Classes of heavy device-resident resources, one per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Vision,
    Retrieval,
    Reasoning,
    Voice,
}

impl ResourceClass {
    /// Declared memory cost used for the static admission check.
    pub fn estimated_footprint_bytes(&self) -> u64 {
        match self {
            Self::Vision => VISION_FOOTPRINT_BYTES,
            Self::Retrieval => RETRIEVAL_FOOTPRINT_BYTES,
            Self::Reasoning => REASONING_FOOTPRINT_BYTES,
            Self::Voice => VOICE_FOOTPRINT_BYTES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Retrieval => "retrieval",
            Self::Reasoning => "reasoning",
            Self::Voice => "voice",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Unloaded,
    Loading,
    Resident,
    Unloading,
}

/// What `reserve` does when another class is currently resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Return `ResourceError::Busy` immediately.
    FailFast,
    /// Wait until the resident lease is released.
    Block,
}

/// One observed lease state change, kept for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseTransition {
    pub class: ResourceClass,
    pub state: LeaseState,
    pub at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════
// Arbiter
// ═══════════════════════════════════════════════════════════

/// Owner of the device memory budget.
///
/// All lease state lives on the arbiter instance, scoped to whoever
/// constructed it — never in module globals, so two orchestrators cannot
/// couple through hidden process-wide state.
pub struct ResourceArbiter {
    budget_bytes: u64,
    busy_policy: BusyPolicy,
    active: Mutex<Option<ResourceClass>>,
    released: Condvar,
    transitions: Mutex<Vec<LeaseTransition>>,
}

impl ResourceArbiter {
    pub fn new(budget_bytes: u64, busy_policy: BusyPolicy) -> Self {
        Self {
            budget_bytes,
            busy_policy,
            active: Mutex::new(None),
            released: Condvar::new(),
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Admit a resource class and mark it `Loading`.
    ///
    /// The admission check is static: the declared footprint is compared
    /// against the configured budget, with no free-memory introspection.
    /// A footprint over budget fails with `Exhausted` even when nothing
    /// else is resident.
    pub fn reserve(&self, class: ResourceClass) -> Result<Reservation<'_>, ResourceError> {
        self.reserve_with_footprint(class, class.estimated_footprint_bytes())
    }

    /// Like `reserve`, with an explicit footprint (used by tests and by
    /// backends that know their quantization variant).
    pub fn reserve_with_footprint(
        &self,
        class: ResourceClass,
        footprint_bytes: u64,
    ) -> Result<Reservation<'_>, ResourceError> {
        if footprint_bytes > self.budget_bytes {
            return Err(ResourceError::Exhausted {
                requested: footprint_bytes,
                budget: self.budget_bytes,
            });
        }

        let mut active = self.active.lock().unwrap();
        while let Some(current) = *active {
            match self.busy_policy {
                BusyPolicy::FailFast => return Err(ResourceError::Busy { active: current }),
                BusyPolicy::Block => active = self.released.wait(active).unwrap(),
            }
        }
        *active = Some(class);
        drop(active);

        self.record(class, LeaseState::Loading);
        tracing::debug!(class = %class, footprint_bytes, "Resource reserved");

        Ok(Reservation {
            arbiter: self,
            class,
            armed: true,
        })
    }

    /// The class currently holding the device, if any.
    pub fn resident(&self) -> Option<ResourceClass> {
        *self.active.lock().unwrap()
    }

    /// Snapshot of every lease transition observed so far.
    pub fn transition_log(&self) -> Vec<LeaseTransition> {
        self.transitions.lock().unwrap().clone()
    }

    fn record(&self, class: ResourceClass, state: LeaseState) {
        self.transitions.lock().unwrap().push(LeaseTransition {
            class,
            state,
            at: Utc::now(),
        });
    }

    /// Orderly release after the resource was resident.
    fn release(&self, class: ResourceClass) {
        self.record(class, LeaseState::Unloading);
        self.clear(class);
    }

    /// Loader failed: the lease goes straight to `Unloaded`, never leaving
    /// a half-initialized resource registered as resident.
    fn abort(&self, class: ResourceClass) {
        self.clear(class);
    }

    fn clear(&self, class: ResourceClass) {
        let mut active = self.active.lock().unwrap();
        // Idempotent: clearing an already-released class is a no-op.
        if *active == Some(class) {
            *active = None;
        }
        drop(active);
        self.record(class, LeaseState::Unloaded);
        self.released.notify_one();
        tracing::debug!(class = %class, "Resource released");
    }
}

// ═══════════════════════════════════════════════════════════
// Reservation + Lease
// ═══════════════════════════════════════════════════════════

/// An admitted slot in `Loading` state, waiting for its loader to run.
pub struct Reservation<'a> {
    arbiter: &'a ResourceArbiter,
    class: ResourceClass,
    armed: bool,
}

impl<'a> Reservation<'a> {
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    /// Run the loader and transition to `Resident`.
    ///
    /// A loader error propagates unchanged; the slot is released before
    /// this function returns, so the caller never has to clean up.
    pub fn load<T, E>(mut self, loader: impl FnOnce() -> Result<T, E>) -> Result<Lease<'a, T>, E> {
        let resource = loader()?; // Drop of `self` aborts the slot on Err
        self.armed = false;
        self.arbiter.record(self.class, LeaseState::Resident);
        Ok(Lease {
            arbiter: self.arbiter,
            class: self.class,
            resource,
            released: false,
        })
    }
}

impl fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("class", &self.class)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.arbiter.abort(self.class);
        }
    }
}

/// Exclusive ownership of one loaded, device-resident resource.
///
/// Dropping the lease unloads the resource. Dereferences to the loaded
/// value, so stages use it like the model handle it wraps.
pub struct Lease<'a, T> {
    arbiter: &'a ResourceArbiter,
    class: ResourceClass,
    resource: T,
    released: bool,
}

impl<T> Lease<'_, T> {
    pub fn class(&self) -> ResourceClass {
        self.class
    }
}

impl<T> Deref for Lease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.arbiter.release(self.class);
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
