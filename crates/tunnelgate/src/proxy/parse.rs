use once_cell::sync::Lazy;
use regex::bytes::Regex;
use thiserror::Error;

// Request-line shapes recognized on the accept path. Anything else is a 400.
static CONNECT_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^CONNECT\s+([^:]+):(\d+)\s+HTTP/(1\.0|1\.1)").unwrap());
static GENERIC_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^(\S+)\s+(\S+)\s+HTTP/(1\.0|1\.1)").unwrap());

const OK_200_11: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
const OK_200_10: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";
const BAD_REQUEST_11: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const BAD_REQUEST_10: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\r\n";
// 403 paired with "Not Found" is long-standing observable behavior; keep it.
const NOT_FOUND_11: &[u8] = b"HTTP/1.1 403 Not Found\r\n\r\n";
const NOT_FOUND_10: &[u8] = b"HTTP/1.0 403 Not Found\r\n\r\n";

pub fn ok_200(http11: bool) -> &'static [u8] {
	if http11 { OK_200_11 } else { OK_200_10 }
}

pub fn bad_request_400(http11: bool) -> &'static [u8] {
	if http11 { BAD_REQUEST_11 } else { BAD_REQUEST_10 }
}

pub fn not_found_403(http11: bool) -> &'static [u8] {
	if http11 { NOT_FOUND_11 } else { NOT_FOUND_10 }
}

/// Position of the `\r\n\r\n` header terminator, if present.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestKind {
	/// Opaque-tunnel mode: answer 200, then splice.
	Connect,
	/// Forwarding mode: replay the received bytes origin-ward verbatim.
	Forward,
}

#[derive(Debug, PartialEq)]
pub struct ParsedRequest {
	pub kind: RequestKind,
	pub host: String,
	pub port: u16,
	pub http11: bool,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RequestError {
	/// A CONNECT request carried bytes beyond the header terminator. The
	/// socket is closed without a response.
	#[error("unexpected bytes after CONNECT header")]
	TrailingBytes,
	#[error("malformed request line")]
	Malformed,
	#[error("missing or empty host")]
	MissingHost { http11: bool },
	#[error("invalid port")]
	BadPort { http11: bool },
}

impl RequestError {
	/// Version for the failure response; 1.1 when the request line never
	/// told us otherwise.
	pub fn http11(&self) -> bool {
		match self {
			RequestError::MissingHost { http11 } | RequestError::BadPort { http11 } => *http11,
			_ => true,
		}
	}
}

/// Classify a complete request header. `buf` holds every byte read so far
/// and `header_end` is the offset of `\r\n\r\n` within it.
pub fn classify(buf: &[u8], header_end: usize) -> Result<ParsedRequest, RequestError> {
	let header = &buf[..header_end];

	if let Some(caps) = CONNECT_RE.captures(header) {
		let http11 = &caps[3] == b"1.1";
		// CONNECT must not be followed by payload before the 200 goes out.
		if header_end + 4 != buf.len() {
			return Err(RequestError::TrailingBytes);
		}
		let host = String::from_utf8_lossy(&caps[1]).into_owned();
		let port = parse_port(&caps[2]).ok_or(RequestError::BadPort { http11 })?;
		return Ok(ParsedRequest {
			kind: RequestKind::Connect,
			host,
			port,
			http11,
		});
	}

	let caps = GENERIC_RE.captures(header).ok_or(RequestError::Malformed)?;
	let http11 = &caps[3] == b"1.1";
	let (host, port) = host_header(header).ok_or(RequestError::MissingHost { http11 })?;
	if host.is_empty() {
		return Err(RequestError::MissingHost { http11 });
	}
	let port = match port {
		None => 80,
		Some(p) => parse_port(p.as_bytes()).ok_or(RequestError::BadPort { http11 })?,
	};
	Ok(ParsedRequest {
		kind: RequestKind::Forward,
		host,
		port,
		http11,
	})
}

fn parse_port(bytes: &[u8]) -> Option<u16> {
	std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Scan header lines for `Host:`, token-wise and case-insensitive. The
/// value may carry an explicit `host:port`.
fn host_header(header: &[u8]) -> Option<(String, Option<String>)> {
	for line in header.split(|&b| b == b'\n') {
		let mut tokens = line
			.split(|b: &u8| b.is_ascii_whitespace())
			.filter(|t| !t.is_empty());
		let Some(name) = tokens.next() else { continue };
		if !name.eq_ignore_ascii_case(b"host:") {
			continue;
		}
		let value = String::from_utf8_lossy(tokens.next()?).into_owned();
		return Some(match value.split_once(':') {
			None => (value, None),
			Some((host, port)) => (host.to_string(), Some(port.to_string())),
		});
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	fn classify_buf(buf: &[u8]) -> Result<ParsedRequest, RequestError> {
		let end = find_header_end(buf).expect("no header terminator");
		classify(buf, end)
	}

	#[test]
	fn connect_request_is_recognized() {
		let parsed = classify_buf(b"CONNECT example.test:443 HTTP/1.1\r\n\r\n").unwrap();
		assert_eq!(parsed.kind, RequestKind::Connect);
		assert_eq!(parsed.host, "example.test");
		assert_eq!(parsed.port, 443);
		assert!(parsed.http11);
	}

	#[test]
	fn connect_http10_sets_version_flag() {
		let parsed = classify_buf(b"CONNECT h:80 HTTP/1.0\r\n\r\n").unwrap();
		assert!(!parsed.http11);
	}

	#[test]
	fn connect_with_extra_headers_is_fine() {
		let parsed =
			classify_buf(b"CONNECT example.test:443 HTTP/1.1\r\nUser-Agent: x\r\n\r\n").unwrap();
		assert_eq!(parsed.kind, RequestKind::Connect);
	}

	#[test]
	fn connect_with_trailing_byte_is_rejected() {
		let buf = b"CONNECT example.test:443 HTTP/1.1\r\n\r\nX";
		let end = find_header_end(buf).unwrap();
		assert_eq!(classify(buf, end), Err(RequestError::TrailingBytes));
	}

	#[test]
	fn connect_port_overflow_is_rejected() {
		let err = classify_buf(b"CONNECT h:99999 HTTP/1.1\r\n\r\n").unwrap_err();
		assert_eq!(err, RequestError::BadPort { http11: true });
	}

	#[test]
	fn forward_request_takes_target_from_host_header() {
		let parsed =
			classify_buf(b"GET http://h.test/x HTTP/1.0\r\nHost: h.test\r\n\r\n").unwrap();
		assert_eq!(parsed.kind, RequestKind::Forward);
		assert_eq!(parsed.host, "h.test");
		assert_eq!(parsed.port, 80);
		assert!(!parsed.http11);
	}

	#[test]
	fn host_header_port_overrides_default() {
		let parsed =
			classify_buf(b"GET / HTTP/1.1\r\nhOsT: h.test:8443\r\n\r\n").unwrap();
		assert_eq!(parsed.host, "h.test");
		assert_eq!(parsed.port, 8443);
	}

	#[test]
	fn missing_host_is_rejected_with_client_version() {
		let err = classify_buf(b"GET / HTTP/1.0\r\nAccept: */*\r\n\r\n").unwrap_err();
		assert_eq!(err, RequestError::MissingHost { http11: false });
		assert!(!err.http11());
	}

	#[test]
	fn garbage_request_line_is_malformed() {
		let err = classify_buf(b"nonsense\r\n\r\n").unwrap_err();
		assert_eq!(err, RequestError::Malformed);
		assert!(err.http11());
	}

	#[test]
	fn failure_responses_are_bit_exact() {
		assert_eq!(bad_request_400(true), b"HTTP/1.1 400 Bad Request\r\n\r\n");
		assert_eq!(bad_request_400(false), b"HTTP/1.0 400 Bad Request\r\n\r\n");
		// DNS failures answer 403 with the literal text "Not Found".
		assert_eq!(not_found_403(true), b"HTTP/1.1 403 Not Found\r\n\r\n");
		assert_eq!(not_found_403(false), b"HTTP/1.0 403 Not Found\r\n\r\n");
	}

	#[test]
	fn header_terminator_is_located_exactly() {
		assert_eq!(find_header_end(b"abc\r\n\r\nrest"), Some(3));
		assert_eq!(find_header_end(b"abc\r\n\r"), None);
	}
}
