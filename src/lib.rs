pub mod browser;
pub mod classify;
pub mod config;
pub mod driver;
pub mod perception;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod snapshots;
pub mod vision;

pub use browser::{BrowserConfig, ChromiumDriver};
pub use perception::{LoopConfig, PerceptionLoop};
pub use registry::{RunId, RunRegistry, RunState, Step, StepKind};
pub use resolver::{ActionIntent, ActionOutcome, ActionResolver, ErrorKind};
