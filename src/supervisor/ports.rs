//! Listen-port reservations for sub-agents.

use std::collections::HashSet;
use std::net::TcpListener;

use tracing::debug;

use super::SupervisorError;

/// Hands out ports from `[min, max]` that are neither reserved nor bound by
/// someone else, round-robin from the last reservation.
#[derive(Debug)]
pub struct PortRegistry {
    min: u16,
    max: u16,
    last: Option<u16>,
    reserved: HashSet<u16>,
}

impl PortRegistry {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max: max.max(min),
            last: None,
            reserved: HashSet::new(),
        }
    }

    pub fn reserve(&mut self) -> Result<u16, SupervisorError> {
        let span = u32::from(self.max - self.min) + 1;
        let start = self.last.map_or(self.min, |last| self.next_after(last));

        let mut port = start;
        for _ in 0..span {
            if !self.reserved.contains(&port) && is_free(port) {
                self.reserved.insert(port);
                self.last = Some(port);
                debug!(port, "Reserved listen port");
                return Ok(port);
            }
            port = self.next_after(port);
        }

        Err(SupervisorError::NoFreePort {
            min: self.min,
            max: self.max,
        })
    }

    pub fn release(&mut self, port: u16) {
        if self.reserved.remove(&port) {
            debug!(port, "Released listen port");
        }
    }

    const fn next_after(&self, port: u16) -> u16 {
        if port >= self.max {
            self.min
        } else {
            port + 1
        }
    }
}

fn is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Find a run of bindable ports at or above `from`. Each test uses its
    /// own `from` so parallel tests do not bind each other's ports.
    fn free_range(from: u16, len: u16) -> (u16, u16) {
        let mut start = from;
        'outer: while start < 60_000 {
            for port in start..start + len {
                if !is_free(port) {
                    start = port + 1;
                    continue 'outer;
                }
            }
            return (start, start + len - 1);
        }
        panic!("no free port range");
    }

    #[test]
    fn reserves_distinct_ports_then_exhausts() {
        let (min, max) = free_range(47_000, 3);
        let mut registry = PortRegistry::new(min, max);

        let mut ports = vec![
            registry.reserve().unwrap(),
            registry.reserve().unwrap(),
            registry.reserve().unwrap(),
        ];
        ports.sort_unstable();
        assert_eq!(ports, vec![min, min + 1, max]);

        assert!(matches!(
            registry.reserve(),
            Err(SupervisorError::NoFreePort { .. })
        ));
    }

    #[test]
    fn released_port_is_reused() {
        let (min, max) = free_range(47_100, 2);
        let mut registry = PortRegistry::new(min, max);
        let a = registry.reserve().unwrap();
        let _b = registry.reserve().unwrap();

        registry.release(a);
        assert_eq!(registry.reserve().unwrap(), a);
    }

    #[test]
    fn skips_ports_bound_elsewhere() {
        let (min, max) = free_range(47_200, 2);
        let _holder = TcpListener::bind(("0.0.0.0", min)).unwrap();
        let mut registry = PortRegistry::new(min, max);
        assert_eq!(registry.reserve().unwrap(), max);
    }
}
