//! Control and emulation of the Kepco BIT 802E SCPI interface card.
//!
//! The BIT 802E puts a Kepco BOP power supply on the network with a
//! line-oriented SCPI protocol on two TCP ports: a Telnet-flavored
//! endpoint on 5024 (which echoes input and may inject negotiation bytes)
//! and a raw socket endpoint on 5025. This crate provides both sides of
//! that wire:
//!
//! - **Controller**: [`KepcoClient`] handles the transport quirks (echo
//!   draining, IAC filtering, command pacing against the card's ~25 ms
//!   throughput floor, transparent reconnects); [`ListUploader`] drives
//!   the documented chunked upload/verify/run procedure for waveform
//!   point lists; [`discovery`] sweeps a subnet for instruments;
//!   [`waveform`] generates point lists within the hardware's dwell
//!   limits.
//! - **Instrument**: [`sim`] is a full-state simulator (register model,
//!   SCPI interpreter, background LIST sequencer and the two-port TCP
//!   server) so everything above can run against a deterministic peer.
//!
//! # Getting Started
//!
//! ```no_run
//! use kepco_bit802e::{KepcoClient, ListUploader, Quantity};
//!
//! let client = KepcoClient::new();
//! client.connect("192.168.1.100".parse().unwrap(), None)?;
//! println!("{}", client.identity()?);
//!
//! // Upload one second of a 100-point ramp and run it twice.
//! let points: Vec<f64> = (0..100).map(|i| i as f64 * 0.05).collect();
//! let mut uploader = ListUploader::new(&client)
//!     .on_progress(|sent, total| println!("{sent}/{total}"));
//! uploader.upload_chunk(&points, 0.01, Quantity::Volt)?;
//! uploader.run(Quantity::Volt, 2)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Running against the simulator instead of hardware:
//!
//! ```no_run
//! use kepco_bit802e::sim::{Device, ScpiServer, ServerConfig};
//!
//! let device = Device::new();
//! let telnet = ScpiServer::bind(device.clone(), ServerConfig::on_port(5024).with_echo(true))?;
//! let socket = ScpiServer::bind(device.clone(), ServerConfig::on_port(5025))?;
//! let _telnet = telnet.spawn();
//! let _socket = socket.spawn();
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod client;
pub mod discovery;
mod error;
pub mod scpi;
pub mod sim;
pub mod telnet;
pub mod upload;
pub mod waveform;

// Crate-level error types
pub use error::{Error, Result};

// Controller-side types
pub use client::{KepcoClient, Transport, SCPI_CMD_GAP, SOCKET_PORT, TELNET_PORT};
pub use upload::{ListUploader, UploadError};

// Shared protocol vocabulary
pub use scpi::Quantity;

// Simulator types
pub use sim::{Device, DeviceObserver, LogDirection, Registers, ScpiServer, ServerConfig};
