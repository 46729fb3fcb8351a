pub mod config;
pub mod home;
pub mod stream;

pub use config::*;
pub use home::*;
pub use stream::*;
