// exported modules
pub mod error;
pub mod http;
pub mod model;

// host impls
pub mod github;

// re-exports
pub use error::*;
pub use github::GitHubClient;
pub use model::*;

// internal modules
mod util;
