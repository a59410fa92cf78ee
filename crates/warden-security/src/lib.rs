pub mod circuit_breaker;
pub mod keys;
pub mod retry;
pub mod second_factor;

pub use circuit_breaker::*;
pub use keys::*;
pub use retry::*;
pub use second_factor::*;
