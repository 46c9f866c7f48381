//! Parrot agents for Aviary.
//!
//! A parrot is a polymorphic specialist satisfying the `Parrot` contract:
//! `name`, `self_describe`, `execute`, `session_stats`. The universal
//! parrot runs declaratively configured LLM turns with tools; the geek and
//! evolution parrots delegate to persistent runner sessions. Turn stats are
//! shared by composition through [`TurnStats`].

pub mod cognition;
pub mod evolution;
pub mod geek;
pub mod parrot;
pub mod registry;
pub mod stats;
pub mod universal;

pub use cognition::Cognition;
pub use evolution::EvolutionParrot;
pub use geek::GeekParrot;
pub use parrot::Parrot;
pub use registry::ExpertRegistry;
pub use stats::TurnStats;
pub use universal::{ParrotConfig, Strategy, UniversalParrot};
