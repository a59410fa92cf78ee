pub mod alert;
pub mod machine;

pub use alert::*;
pub use machine::*;
