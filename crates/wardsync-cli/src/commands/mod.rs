pub mod common;
pub mod record;
pub mod status;
pub mod sync;
