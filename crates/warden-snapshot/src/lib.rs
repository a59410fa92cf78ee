pub mod crypto;
pub mod manager;
pub mod manifest;

pub use crypto::*;
pub use manager::*;
pub use manifest::*;
