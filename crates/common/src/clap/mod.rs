pub mod log;
pub mod tunnel;
