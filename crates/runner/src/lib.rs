//! Sightline Test Runner
//!
//! Loads test descriptors, runs each test in its own disposable machine
//! and reports what passed, failed and errored.

pub mod descriptor;
pub mod interrupt;
pub mod orchestrator;
pub mod report;
pub mod script;

pub use descriptor::{discover, TestDescriptor};
pub use interrupt::{run_interruptible, Ended, Signal};
pub use orchestrator::{Orchestrator, OrchestratorSettings, Phase, SessionFactory, VncSessionFactory};
pub use report::{RunReport, TestRecord};
pub use script::{Script, ScriptContext, ScriptRegistry, ScriptValue, Step, StepScript};
