pub mod config;
pub mod control;
pub mod error;
mod feeder;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod sequential;
pub mod sink;
mod test;
pub mod utils;
mod worker;

pub mod prelude;

pub use utils::logger::Throttle;
