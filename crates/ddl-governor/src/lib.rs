//! DDL Governor -- node quality scoring and relay routing.
//!
//! Pure computation, no I/O. The federation layer feeds round-trip timings
//! into the [`Scorer`] after every exchange and asks the [`Router`] where to
//! send a relay envelope when a node cannot be reached directly.

pub mod router;
pub mod score;

pub use router::{Path, ReachabilityGraph, Router};
pub use score::{ScoreError, ScoreParams, Scorer, UNREACHABLE_SCORE};
