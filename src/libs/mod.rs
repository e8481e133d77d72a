#[macro_use]
pub mod int_like;
pub mod sysfs;
