pub mod command;
pub mod context;
pub mod control;

pub use command::*;
pub use context::*;
pub use control::*;
