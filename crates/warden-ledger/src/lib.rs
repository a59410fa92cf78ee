pub mod chain;
pub mod chainpack;
pub mod counter;
pub mod entry;
pub mod file;
pub mod memory;
pub mod merkle;
pub mod signer;
pub mod traits;

pub use chain::*;
pub use chainpack::*;
pub use counter::*;
pub use entry::*;
pub use file::*;
pub use memory::*;
pub use merkle::*;
pub use signer::*;
pub use traits::*;
