//! Hearth HTTP daemon: the gateway between the family's browsers, the story
//! catalog in SQLite, and the S3-compatible blob store holding the videos.

pub mod auth;
pub mod keygen;
pub mod server;
pub mod storage;
pub mod telemetry;
