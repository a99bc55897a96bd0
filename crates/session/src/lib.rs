pub mod auth;
pub mod config;
pub mod received;
pub mod stream;

pub use auth::*;
pub use config::*;
pub use received::*;
pub use stream::*;
