pub mod initialize;

pub use initialize::{InitializeCommand, JobSpec};
