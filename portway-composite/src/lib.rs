pub mod orchestrator;
pub mod template;

pub use orchestrator::{CompositeOrchestrator, StepInvoker};
