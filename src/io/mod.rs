pub mod base;
pub mod mpmc;
pub mod ringbuffer;
pub mod tracker;
