//! Simulated BIT 802E instrument.
//!
//! A full-state emulation of the interface card and its BOP supply:
//! register model ([`device`]), SCPI interpretation, the background LIST
//! execution engine, and the two-port TCP front end ([`server`]). Useful
//! for exercising the controller stack without hardware, and for tests
//! that need a deterministic instrument.

pub mod device;
mod interpreter;
mod sequencer;
pub mod server;

pub use device::{
    Device, DeviceObserver, ListDirection, ListGeneration, LogDirection, Registers, SourceMode,
};
pub use server::{ScpiServer, ServerConfig, ServerHandle};
