//! Instrument discovery over a /24 subnet.
//!
//! Probes hosts with a short `*IDN?` exchange on the documented ports, in
//! manual precedence order (Telnet 5024, then socket 5025). Probing is
//! deliberately shallow (one connect, one query, one read) so a full
//! subnet sweep stays fast.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::client::{SOCKET_PORT, TELNET_PORT};

/// Per-host probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Hosts probed concurrently.
const PROBE_BATCH: usize = 50;

/// Progress callback granularity.
const PROGRESS_EVERY: usize = 10;

/// An instrument that answered a probe.
#[derive(Debug, Clone)]
pub struct DiscoveredInstrument {
    pub addr: IpAddr,
    pub port: u16,
    pub identity: String,
}

/// Probe one host on the documented ports.
pub fn probe(ip: IpAddr, timeout: Duration) -> Option<DiscoveredInstrument> {
    [TELNET_PORT, SOCKET_PORT]
        .into_iter()
        .find_map(|port| probe_at(ip, port, timeout))
}

/// Probe one specific endpoint with an identity query.
pub fn probe_at(ip: IpAddr, port: u16, timeout: Duration) -> Option<DiscoveredInstrument> {
    let mut stream = TcpStream::connect_timeout(&SocketAddr::new(ip, port), timeout).ok()?;
    stream.set_read_timeout(Some(timeout)).ok()?;
    stream.set_write_timeout(Some(timeout)).ok()?;
    stream.write_all(b"*IDN?\n").ok()?;
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).ok()?;
    let response: String = buf[..n]
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect();
    let response = response.trim();
    let upper = response.to_ascii_uppercase();
    if !response.is_empty()
        && (upper.contains("KEPCO") || upper.contains("BOP") || upper.contains("BIT"))
    {
        Some(DiscoveredInstrument {
            addr: ip,
            port,
            identity: response.to_string(),
        })
    } else {
        None
    }
}

/// Sweep every host of `base`'s /24 network.
///
/// Probes run in batches of worker threads; `on_progress` fires with
/// `(probed, total)` roughly every ten hosts.
pub fn scan_subnet<F>(base: Ipv4Addr, on_progress: F) -> Vec<DiscoveredInstrument>
where
    F: FnMut(usize, usize) + Send,
{
    let octets = base.octets();
    let hosts: Vec<IpAddr> = (1..=254)
        .map(|h| IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], h)))
        .collect();
    let total = hosts.len();

    let found = Mutex::new(Vec::new());
    let probed = AtomicUsize::new(0);
    let progress = Mutex::new(on_progress);
    let (found_ref, probed_ref, progress_ref) = (&found, &probed, &progress);

    for batch in hosts.chunks(PROBE_BATCH) {
        thread::scope(|scope| {
            for &ip in batch {
                scope.spawn(move || {
                    let hit = probe(ip, PROBE_TIMEOUT);
                    let count = probed_ref.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(instrument) = hit {
                        log::info!("found {} at {}:{}", instrument.identity, ip, instrument.port);
                        found_ref.lock().unwrap().push(instrument);
                    }
                    if count % PROGRESS_EVERY == 0 {
                        (progress_ref.lock().unwrap())(count, total);
                    }
                });
            }
        });
    }

    found.into_inner().unwrap()
}
