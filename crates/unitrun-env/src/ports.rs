//! Deterministic host port allocation.

use std::collections::BTreeSet;
use std::net::TcpListener;

use crate::error::{EnvError, EnvResult};

/// Picks host ports: the service default if free, else the first free port
/// in `default+1 ..= default+probe_range`.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    pub probe_range: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self { probe_range: 10 }
    }
}

impl PortAllocator {
    pub fn new(probe_range: u16) -> Self {
        Self { probe_range }
    }

    /// `reserved` holds ports already handed out by this process.
    pub fn allocate(
        &self,
        service: &str,
        default_port: u16,
        reserved: &BTreeSet<u16>,
    ) -> EnvResult<u16> {
        let last = default_port.saturating_add(self.probe_range);
        (default_port..=last)
            .find(|port| !reserved.contains(port) && is_port_free(*port))
            .ok_or_else(|| EnvError::PortExhausted {
                service: service.to_string(),
                first: default_port,
                last,
            })
    }
}

/// Whether a listener can bind `127.0.0.1:<port>` right now.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
