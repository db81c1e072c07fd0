pub mod context;
pub mod error;
pub mod limits;
pub mod model;
pub mod prompt;
pub mod service;
pub mod title;

#[cfg(test)]
pub(crate) mod testing;

pub use error::ChatError;
pub use service::{ChatConfig, ChatService};
