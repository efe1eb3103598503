#![forbid(unsafe_code)]

use std::net::SocketAddr;

/// Parsed `quic://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	/// Returns `host:port` (host preserved, IPv6 stays bracketed).
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Convert to `SocketAddr` only if the host is an IP literal.
	pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
		self.hostport()
			.parse()
			.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
	}

	/// Parse a QUIC endpoint string in the form `quic://host:port`.
	pub fn parse(s: &str) -> Result<Self, String> {
		let s = s.trim();
		if s.is_empty() {
			return Err("endpoint must be non-empty (expected quic://host:port)".to_string());
		}

		let rest = s
			.strip_prefix("quic://")
			.ok_or_else(|| format!("invalid endpoint (expected quic://host:port): {s}"))?;

		if rest.contains('/') || rest.contains('?') || rest.contains('#') {
			return Err(format!(
				"invalid endpoint (expected quic://host:port without path/query/fragment): {s}"
			));
		}

		let (host, port_str) = rest
			.rsplit_once(':')
			.ok_or_else(|| format!("invalid endpoint (missing :port, expected quic://host:port): {s}"))?;

		let host = host.trim();
		if host.is_empty() {
			return Err(format!("invalid endpoint host (expected quic://host:port): {s}"));
		}

		if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
			return Err(format!(
				"invalid endpoint host (IPv6 must be bracketed like quic://[::1]:18210): {s}"
			));
		}

		let port: u16 = port_str
			.trim()
			.parse()
			.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

		if port == 0 {
			return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
		}

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_ipv4_endpoint() {
		let ep = QuicEndpoint::parse("quic://127.0.0.1:18210").expect("parse");
		assert_eq!(ep.host, "127.0.0.1");
		assert_eq!(ep.port, 18210);
		assert!(ep.to_socket_addr_if_ip_literal().is_ok());
	}

	#[test]
	fn parses_bracketed_ipv6() {
		let ep = QuicEndpoint::parse("quic://[::1]:9000").expect("parse");
		assert_eq!(ep.host, "[::1]");
		assert!(ep.to_socket_addr_if_ip_literal().is_ok());
	}

	#[test]
	fn rejects_bad_endpoints() {
		assert!(QuicEndpoint::parse("").is_err());
		assert!(QuicEndpoint::parse("tcp://1.2.3.4:1").is_err());
		assert!(QuicEndpoint::parse("quic://host").is_err());
		assert!(QuicEndpoint::parse("quic://host:0").is_err());
		assert!(QuicEndpoint::parse("quic://::1:9000").is_err());
		assert!(QuicEndpoint::parse("quic://h:1/path").is_err());
	}
}
