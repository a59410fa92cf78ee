pub mod budget;
pub mod handle;
pub mod process;
pub mod protocol;
pub mod resource;
pub mod supervisor;
pub mod worker;

pub use budget::*;
pub use handle::*;
pub use process::*;
pub use protocol::*;
pub use resource::*;
pub use supervisor::*;
pub use worker::*;
