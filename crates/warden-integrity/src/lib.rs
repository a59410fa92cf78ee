pub mod artifact;
pub mod gate;
pub mod runtime;
pub mod store;

pub use artifact::*;
pub use gate::*;
pub use runtime::*;
pub use store::*;
