pub mod audio;
pub mod json_repair;
pub mod retry;
pub mod text;
