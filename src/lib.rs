//! Mimic is a terminal chat client for talking to named AI personas.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the chat session engine: prompt assembly, stream frame
//!   decoding, memory extraction, observer notification, and the
//!   file-backed store with its background persistence queue.
//! - [`ui`] renders the full-screen terminal view and runs the event loop
//!   that feeds user input into a session.
//! - [`cli`] parses arguments and runs the setup, list, create, kill and
//!   chat commands.
//! - [`api`] defines the chat completion payloads.
//!
//! The binary (`src/main.rs`) routes straight into [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod ui;
pub mod utils;
