pub mod error;
pub mod net;
pub mod utils;
