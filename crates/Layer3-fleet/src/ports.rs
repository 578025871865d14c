//! Port allocation

use ssm_foundation::{ActionCode, Result, ServersConfig};
use std::collections::HashSet;
use std::net::TcpListener;
use tracing::debug;

/// Inclusive range instances may be given ports from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }
}

impl From<&ServersConfig> for PortRange {
    fn from(config: &ServersConfig) -> Self {
        Self::new(config.min_port, config.max_port)
    }
}

/// Whether nothing on the host is bound to `port`
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Lowest port in `range` that no instance holds and `is_free` accepts
pub fn allocate_port(
    range: PortRange,
    held: &HashSet<u16>,
    is_free: impl Fn(u16) -> bool,
) -> Result<u16> {
    for port in range.min..=range.max {
        if held.contains(&port) {
            continue;
        }
        if is_free(port) {
            return Ok(port);
        }
        debug!(port, "Port bound on host, skipping");
    }
    Err(ActionCode::PortsExhausted.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_held_ports() {
        let held: HashSet<u16> = [25565, 25566].into_iter().collect();
        let port = allocate_port(PortRange::new(25565, 25570), &held, |_| true).unwrap();
        assert_eq!(port, 25567);
    }

    #[test]
    fn test_skips_host_bound_ports() {
        let port = allocate_port(PortRange::new(25565, 25570), &HashSet::new(), |p| p > 25568).unwrap();
        assert_eq!(port, 25569);
    }

    #[test]
    fn test_exhausted() {
        let held: HashSet<u16> = (30000..=30002).collect();
        let err = allocate_port(PortRange::new(30000, 30002), &held, |_| true).unwrap_err();
        assert!(err.is_action(ActionCode::PortsExhausted));
    }

    #[test]
    fn test_max_port_is_usable() {
        let port = allocate_port(PortRange::new(u16::MAX, u16::MAX), &HashSet::new(), |_| true).unwrap();
        assert_eq!(port, u16::MAX);
    }

    #[test]
    fn test_bound_port_is_not_free() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_free(port));
    }
}
