pub mod agent;
pub mod artifact;
pub mod digest;
pub mod error;
pub mod event;
pub mod fsutil;
pub mod mode;

pub use agent::*;
pub use artifact::*;
pub use digest::*;
pub use error::*;
pub use event::*;
pub use mode::*;
