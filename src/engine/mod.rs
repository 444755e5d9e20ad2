pub mod explorer;
pub mod finding;
pub mod interpreter;
pub mod memory;
pub mod options;
pub mod state;
pub mod watchdog;

pub use explorer::*;
pub use finding::*;
pub use options::{ExplorationOptions, Strategy};
pub use state::{Argument, Entry};
pub use watchdog::*;
