pub mod digest;
pub mod errors;
pub mod fs_atomic;
pub mod ids;
pub mod tagged;
pub mod time;
