//! The hot-multiplexed subprocess runner (CCR) for Aviary.
//!
//! Holds persistent subprocess-backed sessions for code/evolution agents,
//! keyed by `UUIDv5(namespace, "aviary:conversation:{id}")`. Identical ids
//! resolve to the same live subprocess across turns (zero cold-start);
//! conversations and mode namespaces are physically isolated. A danger
//! gate screens every prompt before it reaches the subprocess stdin.

pub mod danger;
pub mod protocol;
pub mod runner;
pub mod session;
pub mod stats;

pub use danger::{DangerDetector, DangerHit};
pub use protocol::{EventMeta, EventWithMeta, ResultPayload, SubprocessEvent};
pub use runner::{CodeRunner, ExecuteConfig, PERMISSION_BYPASS};
pub use session::{Session, SessionState};
pub use stats::SessionAccumulator;
