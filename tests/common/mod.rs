#![allow(dead_code)] // Each test binary uses a different subset of the helpers

pub mod faulty_store;
pub mod harness;
pub mod mock_inference;
pub mod mock_resolver;

pub use faulty_store::*;
pub use harness::*;
pub use mock_inference::*;
pub use mock_resolver::*;
