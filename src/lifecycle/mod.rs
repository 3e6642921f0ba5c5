// Version Lifecycle Controller: open/close rules over derived version state.

pub mod controller;
pub mod state;

pub use controller::{CloseOptions, OpenOptions, VersionLifecycleController};
pub use state::{LifecycleTerminals, VersionPhase, VersionState};
