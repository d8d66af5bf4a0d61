//! SCPI transport client for the BIT 802E.
//!
//! The card is a slow, single-channel peer with a tiny (~253 byte) input
//! buffer, and its Telnet endpoint echoes every command back. Three habits
//! keep it alive:
//!
//! - every command is paced by a mandatory gap, slept *inside* the
//!   exclusive section so concurrent callers cannot beat the card's
//!   documented throughput floor;
//! - after each command the self-echo is drained, because unread echo
//!   bytes pile up in the card's TCP send buffer until it blocks trying to
//!   echo and stops reading commands entirely;
//! - query responses are read through a filter that strips Telnet IAC
//!   negotiation and discards the echoed command line.
//!
//! All traffic to one instrument is serialized through one internal lock,
//! matching the hardware's single command channel.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::telnet;

/// Telnet-flavored endpoint; tried first, per the manual.
pub const TELNET_PORT: u16 = 5024;

/// Plain socket endpoint; the fallback.
pub const SOCKET_PORT: u16 = 5025;

/// Minimum enforced delay between consecutive commands. The manual quotes
/// ~25 ms of per-command throughput; 35 ms leaves margin.
pub const SCPI_CMD_GAP: Duration = Duration::from_millis(35);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_TIMEOUT: Duration = Duration::from_secs(3);
/// How long the card gets to deliver unsolicited negotiation after connect.
const NEGOTIATION_SETTLE: Duration = Duration::from_millis(100);
/// Drain window for the single in-flight echo after a command.
const ECHO_DRAIN: Duration = Duration::from_millis(20);
/// Drain window for accumulated stale bytes before a query.
const STALE_DRAIN: Duration = Duration::from_millis(50);
/// Cap on buffered partial-line bytes while waiting for a response.
const PENDING_LIMIT: usize = 8192;

/// Which endpoint a connection went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Telnet,
    Socket,
    Custom,
}

struct ClientInner {
    stream: Option<TcpStream>,
    /// Last known address, for transparent reconnects.
    addr: Option<IpAddr>,
    port: u16,
    transport: Transport,
}

/// Thread-safe SCPI client for one instrument.
pub struct KepcoClient {
    inner: Mutex<ClientInner>,
    command_gap: Duration,
}

impl Default for KepcoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl KepcoClient {
    pub fn new() -> Self {
        KepcoClient {
            inner: Mutex::new(ClientInner {
                stream: None,
                addr: None,
                port: TELNET_PORT,
                transport: Transport::Telnet,
            }),
            command_gap: SCPI_CMD_GAP,
        }
    }

    /// Override the inter-command pacing gap. The default is the hardware
    /// throughput floor; benches against the simulator can go lower.
    pub fn with_command_gap(mut self, gap: Duration) -> Self {
        self.command_gap = gap;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().stream.is_some()
    }

    /// The transport of the current (or last) connection.
    pub fn transport(&self) -> Transport {
        self.inner.lock().unwrap().transport
    }

    /// Connect to an instrument.
    ///
    /// With no explicit port the documented precedence applies: Telnet
    /// 5024 first, then socket 5025. Returns the transport that answered.
    pub fn connect(&self, ip: IpAddr, port: Option<u16>) -> Result<Transport> {
        let attempts: Vec<(u16, Transport)> = match port {
            Some(p) => vec![(p, Transport::Custom)],
            None => vec![
                (TELNET_PORT, Transport::Telnet),
                (SOCKET_PORT, Transport::Socket),
            ],
        };

        let mut inner = self.inner.lock().unwrap();
        let mut last_err = String::new();
        for (target, transport) in attempts {
            match open_stream(ip, target) {
                Ok(stream) => {
                    inner.stream = Some(stream);
                    inner.addr = Some(ip);
                    inner.port = target;
                    inner.transport = transport;
                    log::info!("connected to {ip} via {transport:?} ({target})");
                    return Ok(transport);
                }
                Err(e) => last_err = e.to_string(),
            }
        }
        inner.stream = None;
        Err(Error::Connect(last_err))
    }

    pub fn disconnect(&self) {
        self.inner.lock().unwrap().stream = None;
    }

    /// Send a command that expects no response.
    ///
    /// Holds the exclusive section through the pacing gap, then drains the
    /// in-flight echo.
    pub fn send_cmd(&self, cmd: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        ensure_connected(&mut inner)?;
        let result = (|| {
            let stream = inner.stream.as_mut().ok_or(Error::NotConnected)?;
            stream.write_all(format!("{cmd}\n").as_bytes())?;
            thread::sleep(self.command_gap);
            drain(stream, ECHO_DRAIN, true);
            Ok(())
        })();
        if result.as_ref().is_err_and(Error::is_disconnecting) {
            inner.stream = None;
        }
        result
    }

    /// Send a query and wait for its response line.
    pub fn send_query(&self, cmd: &str) -> Result<String> {
        self.send_query_timeout(cmd, RECV_TIMEOUT)
    }

    /// Send a query with an explicit response deadline.
    pub fn send_query_timeout(&self, cmd: &str, timeout: Duration) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        ensure_connected(&mut inner)?;
        let telnet = inner.port == TELNET_PORT;
        let result = (|| {
            let stream = inner.stream.as_mut().ok_or(Error::NotConnected)?;
            // Residue from prior unread echoes would be mistaken for the
            // response; clear it first.
            drain(stream, STALE_DRAIN, false);
            stream.write_all(format!("{cmd}\n").as_bytes())?;
            recv_response(stream, cmd, timeout, telnet)
        })();
        if result.as_ref().is_err_and(Error::is_disconnecting) {
            inner.stream = None;
        }
        result
    }

    /// Block the card's command processor until pending operations finish.
    ///
    /// `*WAI` is a command, not a query, so unlike `*OPC?` it cannot time
    /// out waiting for a reply.
    pub fn sync(&self) -> Result<()> {
        self.send_cmd("*WAI")
    }

    /// Read queued `SYST:ERR?` entries until the `0,"No error"` sentinel.
    pub fn drain_errors(&self) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        for _ in 0..20 {
            let response = self.send_query("SYST:ERR?")?;
            let response = response.trim();
            if response.starts_with('0') || response.contains("No error") {
                break;
            }
            errors.push(response.to_string());
        }
        Ok(errors)
    }

    /// Query the instrument identity (`*IDN?`).
    pub fn identity(&self) -> Result<String> {
        self.send_query("*IDN?")
    }
}

fn open_stream(ip: IpAddr, port: u16) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&SocketAddr::new(ip, port), CONNECT_TIMEOUT)?;
    // The card may push Telnet negotiation right after accepting; let it
    // arrive, then throw it away.
    thread::sleep(NEGOTIATION_SETTLE);
    stream.set_nonblocking(true)?;
    let mut scratch = [0u8; 1024];
    let _ = (&stream).read(&mut scratch);
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(stream)
}

/// Attempt one transparent reconnect using the last known address.
fn ensure_connected(inner: &mut ClientInner) -> Result<()> {
    if inner.stream.is_some() {
        return Ok(());
    }
    let ip = inner.addr.ok_or(Error::NotConnected)?;
    log::debug!("reconnecting to {ip}:{}", inner.port);
    match open_stream(ip, inner.port) {
        Ok(stream) => {
            inner.stream = Some(stream);
            Ok(())
        }
        Err(e) => Err(Error::Connect(e.to_string())),
    }
}

/// Bounded drain of whatever is already in flight. `once` reads a single
/// buffer (enough for one echo line); otherwise reads until quiet. Errors
/// are ignored; this is cleanup, not protocol.
fn drain(stream: &TcpStream, timeout: Duration, once: bool) {
    if stream.set_read_timeout(Some(timeout)).is_err() {
        return;
    }
    let mut scratch = [0u8; 4096];
    loop {
        match (&*stream).read(&mut scratch) {
            Ok(0) | Err(_) => break,
            Ok(_) if once => break,
            Ok(_) => {}
        }
    }
    let _ = stream.set_read_timeout(Some(RECV_TIMEOUT));
}

/// Read until a complete, non-empty line arrives that is not the echo of
/// `sent_cmd`. Telnet negotiation bytes are stripped before line-splitting.
fn recv_response(
    stream: &mut TcpStream,
    sent_cmd: &str,
    timeout: Duration,
    telnet: bool,
) -> Result<String> {
    let echo = sent_cmd.trim();
    let deadline = Instant::now() + timeout;
    let mut raw: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 512];

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        stream.set_read_timeout(Some(deadline - now))?;
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                let _ = stream.set_read_timeout(Some(RECV_TIMEOUT));
                return Err(Error::ConnectionClosed);
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                break
            }
            Err(e) => {
                let _ = stream.set_read_timeout(Some(RECV_TIMEOUT));
                return Err(e.into());
            }
        };
        raw.extend_from_slice(&chunk[..n]);

        let clean = if telnet {
            telnet::strip_iac(&raw)
        } else {
            raw.clone()
        };
        let text = ascii_text(&clean);
        let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
        let mut lines: Vec<&str> = normalized.split('\n').collect();
        let trailing = lines.pop().unwrap_or("");
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line == echo {
                continue;
            }
            let _ = stream.set_read_timeout(Some(RECV_TIMEOUT));
            return Ok(line.to_string());
        }
        // Only echo or blank lines so far; keep the partial tail.
        raw = trailing.as_bytes().to_vec();
        if raw.len() > PENDING_LIMIT {
            break;
        }
    }

    let _ = stream.set_read_timeout(Some(RECV_TIMEOUT));
    // Deadline passed; salvage a terminator-less residue if it is usable.
    if !raw.is_empty() {
        let text = ascii_text(&raw);
        let text = text.trim();
        if !text.is_empty() && text != echo {
            return Ok(text.to_string());
        }
    }
    Err(Error::Timeout {
        command: sent_cmd.to_string(),
        timeout,
    })
}

/// Decode bytes as ASCII, dropping anything else.
fn ascii_text(data: &[u8]) -> String {
    data.iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::device::Device;
    use crate::sim::server::{ScpiServer, ServerConfig};

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn start_sim(echo: bool) -> (Device, crate::sim::server::ServerHandle) {
        let device = Device::new();
        let server =
            ScpiServer::bind(device.clone(), ServerConfig::new().with_echo(echo)).unwrap();
        (device, server.spawn())
    }

    fn client() -> KepcoClient {
        KepcoClient::new().with_command_gap(Duration::from_millis(2))
    }

    #[test]
    fn query_skips_echo_on_echoing_peer() {
        let (_device, handle) = start_sim(true);
        let client = client();
        client.connect(localhost(), Some(handle.addr().port())).unwrap();
        assert_eq!(client.transport(), Transport::Custom);
        let idn = client.identity().unwrap();
        assert_ne!(idn, "*IDN?");
        assert!(idn.contains("KEPCO"));
    }

    #[test]
    fn send_cmd_then_query_roundtrip() {
        let (_device, handle) = start_sim(true);
        let client = client();
        client.connect(localhost(), Some(handle.addr().port())).unwrap();
        client.send_cmd("VOLT 5.0").unwrap();
        assert_eq!(client.send_query("VOLT?").unwrap(), "5.000000E+00");
    }

    #[test]
    fn connect_refused_reports_failure() {
        let client = KepcoClient::new();
        // Port 1 on loopback is essentially never listening.
        let err = client.connect(localhost(), Some(1)).unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
        assert!(!client.is_connected());
    }

    #[test]
    fn operations_without_connection_fail_cleanly() {
        let client = KepcoClient::new();
        assert!(matches!(
            client.send_cmd("OUTP ON").unwrap_err(),
            Error::NotConnected
        ));
        assert!(matches!(
            client.send_query("VOLT?").unwrap_err(),
            Error::NotConnected
        ));
    }

    #[test]
    fn reconnects_transparently_after_disconnect() {
        let (_device, handle) = start_sim(false);
        let client = client();
        client.connect(localhost(), Some(handle.addr().port())).unwrap();
        client.disconnect();
        assert!(!client.is_connected());
        // The next operation reconnects on its own.
        assert!(client.identity().unwrap().contains("KEPCO"));
        assert!(client.is_connected());
    }

    #[test]
    fn drain_errors_collects_until_sentinel() {
        let (device, handle) = start_sim(false);
        let client = client();
        client.connect(localhost(), Some(handle.addr().port())).unwrap();
        device.push_error(-100, "Command error");
        device.push_error(-221, "Settings conflict");
        let errors = client.drain_errors().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("-100"));
        assert!(errors[1].starts_with("-221"));
        assert!(client.drain_errors().unwrap().is_empty());
    }

    #[test]
    fn compound_query_roundtrip() {
        let (_device, handle) = start_sim(false);
        let client = client();
        client.connect(localhost(), Some(handle.addr().port())).unwrap();
        client.send_cmd("VOLT 2.0;:CURR 0.5").unwrap();
        assert_eq!(
            client.send_query("VOLT?;:CURR?").unwrap(),
            "2.000000E+00;5.000000E-01"
        );
    }
}
