// Public API
pub mod runtime;
pub use runtime::{Builder, Runtime};

// Exports
pub(crate) use runtime::RuntimeConfig;

pub(crate) mod scheduler;
pub(crate) mod worker;

#[cfg(test)]
mod tests;
