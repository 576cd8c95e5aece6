//! Flow execution engine.
//!
//! - [`interpreter`]: the one-step state machine
//! - [`evaluator`]: branch condition predicates
//! - [`retry`]: backoff policy for failed steps
//! - [`clock`]: injectable time source

pub mod clock;
pub mod evaluator;
pub mod interpreter;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use evaluator::{ConditionError, ConditionEvaluator, JinjaConditionEvaluator};
pub use interpreter::{Interpreter, Transition};
pub use retry::{ExponentialBackoff, RetryPolicy};
