pub mod lease;

pub use lease::{
    BusyPolicy, Lease, LeaseState, LeaseTransition, Reservation, ResourceArbiter, ResourceClass,
};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Resource busy: {active} is currently resident")]
    Busy { active: ResourceClass },

    #[error("Resource exhausted: {requested} bytes requested, budget is {budget} bytes")]
    Exhausted { requested: u64, budget: u64 },
}
