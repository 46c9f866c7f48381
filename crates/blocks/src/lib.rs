//! Block persistence for Aviary.
//!
//! A block is the canonical record of one user↔assistant turn: its inputs,
//! the assistant text, the ordered event stream, resource stats, and cost.
//! Round numbers are dense per conversation and assigned at insert; status
//! moves strictly forward through `pending → streaming → {completed, error}`.

pub mod model;
pub mod store;
pub mod view;

pub use model::{Block, BlockMode, BlockStatus, BlockType, NewBlock, UserInput};
pub use store::{BlockOutcome, BlockStore};
pub use view::{legacy_messages, LegacyMessage};
