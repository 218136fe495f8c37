// kvpool-common - Shared types for the kvpool client
//
// Errors, configuration and reply values used by every layer of the client.

pub mod config;
pub mod error;
pub mod reply;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use reply::*;
