pub mod agents;
pub mod decode;
pub mod error;
pub mod llm;
pub mod renderer;
pub mod runs;
pub mod story_track;
pub mod voices;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
