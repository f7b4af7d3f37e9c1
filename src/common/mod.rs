pub mod error;

pub use error::HostError;
