pub mod phase;
pub mod signals;
