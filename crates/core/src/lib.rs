//! The Aviary turn service.
//!
//! Wires router, agents, orchestrator, context and block persistence into
//! the end-to-end chat-turn pipeline, and runs the crash-recovery pass at
//! startup.

pub mod service;

pub use service::{TurnResult, TurnService, TurnServiceDeps};
