pub mod download;
pub mod streaming;
