//! TCP front end of the simulated instrument.
//!
//! One [`ScpiServer`] owns one listener. The real card exposes two: a
//! Telnet-flavored endpoint on 5024 that echoes every received line back
//! to its sender, and a plain socket endpoint on 5025. Bind one server per
//! port against the same [`Device`] to emulate that.
//!
//! Each connection gets its own thread reading newline-terminated command
//! lines. The server remembers which connection most recently started a
//! LIST run; if that connection drops, the run is stopped so it cannot
//! outlive its controller.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::sim::device::{Device, LogDirection, MAX_RX_LINE_BYTES};

const BIND_ATTEMPTS: usize = 20;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);
const ACCEPT_POLL: Duration = Duration::from_millis(100);
const LISTEN_BACKLOG: i32 = 4;

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    /// Echo every received line back to its sender (Telnet emulation).
    pub echo: bool,
    /// Poll interval for the per-connection read loop.
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Ephemeral loopback listener, the testing default.
    pub fn new() -> Self {
        ServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            echo: false,
            read_timeout: Duration::from_millis(500),
        }
    }

    /// Listen on a specific port on all interfaces.
    pub fn on_port(port: u16) -> Self {
        Self::new().with_bind_address(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

#[derive(Default)]
struct ServerShared {
    /// Connection that most recently started a LIST run.
    list_owner: Option<u64>,
    /// Live client sockets, kept for forced shutdown on stop().
    clients: HashMap<u64, TcpStream>,
}

/// A bound, not-yet-running SCPI listener.
pub struct ScpiServer {
    device: Device,
    config: ServerConfig,
    listener: TcpListener,
    running: Arc<AtomicBool>,
    shared: Arc<Mutex<ServerShared>>,
}

impl ScpiServer {
    /// Bind the listener, retrying briefly while the address is still held
    /// by a dying predecessor. Any failure other than "address in use" is
    /// returned immediately.
    pub fn bind(device: Device, config: ServerConfig) -> io::Result<Self> {
        let listener = bind_with_retry(config.bind_address)?;
        listener.set_nonblocking(true)?;
        Ok(ScpiServer {
            device,
            config,
            listener,
            running: Arc::new(AtomicBool::new(true)),
            shared: Arc::new(Mutex::new(ServerShared::default())),
        })
    }

    /// The actually bound address (resolves ephemeral ports).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop on a background thread.
    pub fn spawn(self) -> ServerHandle {
        let addr = self.listener.local_addr().expect("listener has an address");
        let running = Arc::clone(&self.running);
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || self.run());
        ServerHandle {
            addr,
            running,
            shared,
            handle: Some(handle),
        }
    }

    fn run(self) {
        let mut next_id: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    next_id += 1;
                    let id = next_id;
                    let _ = stream.set_nonblocking(false);
                    if let Err(e) = stream.set_read_timeout(Some(self.config.read_timeout)) {
                        log::warn!("failed to set read timeout for {peer}: {e}");
                        continue;
                    }
                    if let Ok(clone) = stream.try_clone() {
                        self.shared.lock().unwrap().clients.insert(id, clone);
                    }
                    self.device
                        .log(LogDirection::Sys, &format!("Client connected: {peer}"));

                    let device = self.device.clone();
                    let running = Arc::clone(&self.running);
                    let shared = Arc::clone(&self.shared);
                    let echo = self.config.echo;
                    thread::spawn(move || {
                        handle_client(device, stream, peer, id, echo, running, shared)
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Handle to a running server. Dropping it stops the listener and closes
/// every client connection.
pub struct ServerHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    shared: Arc<Mutex<ServerShared>>,
    handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the accept loop and close all client connections.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let clients: Vec<TcpStream> = {
            let mut shared = self.shared.lock().unwrap();
            shared.list_owner = None;
            shared.clients.drain().map(|(_, stream)| stream).collect()
        };
        for stream in clients {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_with_retry(addr: SocketAddr) -> io::Result<TcpListener> {
    let mut last_err = None;
    for attempt in 0..BIND_ATTEMPTS {
        match try_bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if attempt == 0 {
                    log::debug!("{addr} in use, retrying");
                }
                last_err = Some(e);
                thread::sleep(BIND_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "bind failed")))
}

fn try_bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn handle_client(
    device: Device,
    mut stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    echo: bool,
    running: Arc<AtomicBool>,
    shared: Arc<Mutex<ServerShared>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; 1024];

    'connection: while running.load(Ordering::SeqCst) {
        let n = match stream.read(&mut read_buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(_) => break,
        };
        buf.extend_from_slice(&read_buf[..n]);

        // A stream that never sends a newline is malformed; drop it before
        // it eats all memory.
        if buf.len() > MAX_RX_LINE_BYTES && !buf.contains(&b'\n') {
            device.push_error(-223, "Too much data");
            device.log(
                LogDirection::Sys,
                "Dropped oversized unterminated input line",
            );
            buf.clear();
            continue;
        }

        while let Some(newline) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let cmd = text.trim();
            if cmd.is_empty() {
                continue;
            }

            if echo && stream.write_all(format!("{cmd}\r\n").as_bytes()).is_err() {
                break 'connection;
            }

            let upper = cmd.to_ascii_uppercase();
            if upper == "VOLT:MODE LIST" || upper == "CURR:MODE LIST" {
                shared.lock().unwrap().list_owner = Some(id);
            }

            if let Some(response) = device.process(cmd) {
                if stream
                    .write_all(format!("{response}\n").as_bytes())
                    .is_err()
                {
                    break 'connection;
                }
            }
        }
    }

    let owned_running_list = {
        let mut shared = shared.lock().unwrap();
        shared.clients.remove(&id);
        if shared.list_owner == Some(id) {
            shared.list_owner = None;
            true
        } else {
            false
        }
    };
    if owned_running_list {
        device.stop_list();
    }
    device.log(LogDirection::Sys, &format!("Client disconnected: {peer}"));
}
