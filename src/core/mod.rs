pub mod bot;
pub mod chat_stream;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod persistence;
pub mod prompt;
pub mod session;
pub mod storage;
pub mod transport;
