pub mod characters;
pub mod decomposer;
pub mod export;
pub mod image;
pub mod images;
pub mod llm;
pub mod narration;
pub mod setup;
pub mod story;
pub mod tts;
pub mod video;
pub mod workflow;
