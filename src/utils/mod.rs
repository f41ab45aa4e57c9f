pub use cancel_token::*;
pub use core_pinner::*;
pub use gauge::*;

mod cancel_token;
pub mod config_io;
mod core_pinner;
mod gauge;
pub mod logger;
