//! Flow compilation: weakly connected components of operation nodes,
//! leveled into jobs of parallel steps.

pub mod compiler;
pub mod model;

pub use compiler::derive_flows;
pub use model::{Flow, Job, Step};
