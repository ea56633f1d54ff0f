pub mod panic;
pub mod serde;
