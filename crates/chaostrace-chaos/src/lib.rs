//! §4.5/§4.6 Chaos injection: a hook effector that executes one chaos
//! action against the sandboxed database, and a trigger-driven
//! scheduler that watches intercepted events and a wall-clock ticker
//! to decide when to fire one.

pub mod hooks;
pub mod scheduler;

pub use hooks::{ActionContext, ChaosError, ChaosHooks, ExecutionResult};
pub use scheduler::ChaosScheduler;
