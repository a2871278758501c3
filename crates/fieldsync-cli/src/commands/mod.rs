pub mod add;
pub mod common;
pub mod conflicts;
pub mod failed;
pub mod pending;
pub mod status;
pub mod sync;
