/// Shared helpers: polling, cancellation, local commands, parsing
pub mod cancel;
pub mod command;
pub mod polling;
pub mod quantity;
pub mod version;
