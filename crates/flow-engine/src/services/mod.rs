//! Service layer for the flow control plane.
//!
//! Services encapsulate business logic and coordinate
//! between handlers and the stores.

pub mod flow;

pub use flow::{FlowExecutionStateDto, FlowService, FlowSummary};
