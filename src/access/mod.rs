//! Access gating.
//!
//! [`AccessGate`] is a pure function from [`UserAccessFacts`] and the current
//! path to a [`RouteDecision`]. [`AccessFactsResolver`] reads those facts
//! from the profile tables and the subscription ledger for each decision.

mod facts;
mod gate;

pub use facts::{AccessFactsResolver, InMemoryProfileStore, OnboardingProfile, ProfileStore, UserProfile};
pub use gate::{
    AccessGate, AccessPaths, Destination, Fact, GATE_RULES, GateRule, RouteDecision, Step,
    UserAccessFacts, decide, evaluate,
};
