//! Viva API Library Crate
//!
//! This library contains the web service around an examination: the
//! application state, session persistence, REST handlers, the WebSocket
//! session that drives an [`Examination`](viva_core::examination::Examination),
//! and routing. The binaries are thin wrappers around it.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;

#[cfg(test)]
mod test_support;
