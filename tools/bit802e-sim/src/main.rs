//! Headless BIT 802E simulator.
//!
//! Emulates the card's two TCP endpoints (Telnet-style with echo on 5024,
//! raw socket on 5025) so the controller stack can be exercised without
//! hardware. All instrument traffic is written to the process log.

use std::sync::Arc;
use std::thread;

use clap::Parser;

use kepco_bit802e::sim::{Device, DeviceObserver, LogDirection, ScpiServer, ServerConfig};

#[derive(Parser)]
#[command(name = "bit802e-sim", about = "Kepco BIT 802E instrument simulator")]
struct Args {
    /// Telnet-style port (echoes input back to the sender)
    #[arg(long, default_value_t = kepco_bit802e::TELNET_PORT)]
    telnet_port: u16,

    /// Raw socket port (no echo)
    #[arg(long, default_value_t = kepco_bit802e::SOCKET_PORT)]
    socket_port: u16,
}

/// Forwards instrument traffic to the process log.
struct LogObserver;

impl DeviceObserver for LogObserver {
    fn log(&self, direction: LogDirection, text: &str) {
        match direction {
            LogDirection::Rx => log::info!("rx  {text}"),
            LogDirection::Tx => log::info!("tx  {text}"),
            LogDirection::Sys => log::info!("{text}"),
        }
    }
}

fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let device = Device::with_observer(Arc::new(LogObserver));

    let telnet = ScpiServer::bind(
        device.clone(),
        ServerConfig::on_port(args.telnet_port).with_echo(true),
    )?;
    let socket = ScpiServer::bind(device.clone(), ServerConfig::on_port(args.socket_port))?;
    log::info!(
        "BIT 802E simulator up: telnet {} / socket {}",
        telnet.local_addr()?,
        socket.local_addr()?
    );

    let _telnet = telnet.spawn();
    let _socket = socket.spawn();
    loop {
        thread::park();
    }
}
