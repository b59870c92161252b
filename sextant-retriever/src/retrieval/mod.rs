pub mod chunker;
pub mod content;
pub mod indexing_engine;
pub mod pipeline;
pub mod reconstruction;
