#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! bctl library: both ends of a keysplitting-authenticated kubectl tunnel.
//!
//! - `daemon`: local HTTPS endpoint kubectl talks to
//! - `agent`: in-cluster side that runs requests with impersonation
//! - `keysplitting`: Ed25519 hash-chained Syn/SynAck/Data/DataAck engine
//! - `transport`: SignalR websocket pipes to the relay
//! - `message`: envelopes carried on those pipes
//! - `action`: action paths and their payloads
//! - `config`: flags, environment and tunnel tuning
//! - `error`: crate-wide error type

pub mod action;
pub mod agent;
pub mod config;
pub mod daemon;
pub mod error;
pub mod keysplitting;
pub mod message;
pub mod transport;

pub use error::{Error, Result};
