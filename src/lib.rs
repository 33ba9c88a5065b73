//! Host-side transport driver for the Surface Serial Hub (SSH) protocol: a
//! framed, sequenced, retried request/response link to an embedded
//! controller over UART.
//!
//! This crate owns framing, reassembly, retry/timeout handling, and event
//! dispatch. It does not configure the UART itself, does not manage system
//! power, does not know how to parse any particular EC command's payload,
//! and does not aggregate more than one link — all of that is a client
//! driver's job, built on top of [`Controller`].

#[macro_use]
extern crate failure;

pub mod config;
pub mod controller;
pub mod crc16;
pub mod error;
pub mod event;
pub mod frame;
pub mod link;
pub mod queue;
pub mod reassembler;
pub mod test_support;
pub mod types;
pub mod workqueue;

pub use config::Config;
pub use controller::{Controller, ControllerState};
pub use error::{Error, Result};
pub use event::{Delay, Event};
pub use link::Link;
pub use types::{Request, ResponseBuffer};
