use std::net::UdpSocket;
use std::sync::Arc;

/// Fire-and-forget statsd counters. Every metric is optional: a reporter
/// without a socket swallows updates, so call sites never branch.
#[derive(Clone)]
pub struct StatsReporter {
    inner: Option<Arc<StatsInner>>,
    prefix: String,
}

struct StatsInner {
    socket: UdpSocket,
    target: String,
}

#[derive(Clone)]
pub struct StatsReporterFactory {
    inner: Option<Arc<StatsInner>>,
    base_prefix: Option<String>,
}

impl StatsReporterFactory {
    pub fn new(host: Option<&str>, port: u16, base_prefix: Option<&str>) -> Self {
        let inner = host.and_then(|host| {
            let socket = match UdpSocket::bind("0.0.0.0:0") {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!("Failed to bind statsd socket, metrics disabled: {}", e);
                    return None;
                }
            };
            Some(Arc::new(StatsInner {
                socket,
                target: format!("{}:{}", host, port),
            }))
        });
        Self {
            inner,
            base_prefix: base_prefix.map(str::to_string),
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: None,
            base_prefix: None,
        }
    }

    /// Reporter scoped to one (account, container); metric names come out
    /// as `<base>.<account>.<container>.<metric>`.
    pub fn instance(&self, account: &str, container: &str) -> StatsReporter {
        let mut parts = Vec::new();
        if let Some(base) = &self.base_prefix {
            parts.push(base.as_str());
        }
        parts.push(account);
        parts.push(container);
        StatsReporter {
            inner: self.inner.clone(),
            prefix: parts.join("."),
        }
    }
}

impl StatsReporter {
    pub fn increment(&self, metric: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.send(&format!("{}.{}:{}|c", self.prefix, metric, count));
    }

    pub fn timing(&self, metric: &str, millis: u64) {
        self.send(&format!("{}.{}:{}|ms", self.prefix, metric, millis));
    }

    pub fn error(&self, kind: &str) {
        self.increment(&format!("errors.{}", kind), 1);
    }

    fn send(&self, payload: &str) {
        if let Some(inner) = &self.inner {
            // Lost datagrams are acceptable; blocking the engine is not.
            let _ = inner.socket.send_to(payload.as_bytes(), &inner.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_reporter_is_noop() {
        let reporter = StatsReporterFactory::disabled().instance("AUTH_a", "c");
        reporter.increment("copied_objects", 3);
        reporter.error("auth");
    }

    #[test]
    fn test_counter_wire_format() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let factory = StatsReporterFactory::new(Some("127.0.0.1"), port, Some("strato"));
        let reporter = factory.instance("AUTH_a", "c");

        reporter.increment("scanned", 7);
        let mut buf = [0u8; 256];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"strato.AUTH_a.c.scanned:7|c");

        reporter.increment("scanned", 0);
        reporter.timing("pass", 120);
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"strato.AUTH_a.c.pass:120|ms");
    }
}
