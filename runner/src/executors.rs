pub mod bounded;


pub use bounded::{BoundedRunner, RunnerHandle};
