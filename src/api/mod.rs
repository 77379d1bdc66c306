pub mod endpoints;
pub mod error;
pub mod transport;
pub mod types;

pub use endpoints::Api;
pub use error::ApiError;
