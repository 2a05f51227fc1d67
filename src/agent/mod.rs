//! Agent-side runtime
//!
//! What a live agent process runs to take part in hot swaps: it obeys
//! `pause`/`resume` and answers `ping` on its control topic.

pub mod runtime;

pub use runtime::AgentRuntime;
