pub mod clock;
pub mod config;
pub mod error;
pub mod events;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use events::*;
