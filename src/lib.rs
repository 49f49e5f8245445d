//! lyric-render - Render job pipeline for lyric videos
//!
//! Turns a word-level transcript into captions burned onto a video with ffmpeg,
//! runs each render as a cancellable background job and keeps remote clients'
//! view of the job consistent across an unreliable WebSocket channel.

pub mod cancel;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod invoker;
pub mod lifecycle;
pub mod media;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod store;
pub mod subtitle;
