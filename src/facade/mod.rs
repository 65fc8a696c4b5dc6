pub mod engine;

pub use engine::IndexEngine;
