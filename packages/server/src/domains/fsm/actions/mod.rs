pub mod initialize;

pub use initialize::{HandlerConfig, InitializeHandler, InitializeResult, InitializeSnapshot};
