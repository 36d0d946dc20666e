//! External IP discovery through a plain-text HTTP echo endpoint.
//!
//! The commander identifies workers by whatever IP they report, so this
//! only needs to be stable per worker, not authoritative.

use std::time::Duration;

use gradegrid_protocol::{ProtocolError, Result};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking lookup; call from `spawn_blocking` in async contexts.
pub fn discover(echo_url: &str) -> Result<String> {
    let body = ureq::get(echo_url)
        .timeout(LOOKUP_TIMEOUT)
        .call()
        .map_err(|e| ProtocolError::Transport(format!("ip lookup against {echo_url}: {e}")))?
        .into_string()?;
    let ip = body.trim();
    if ip.is_empty() {
        return Err(ProtocolError::Protocol(format!(
            "ip echo endpoint {echo_url} returned an empty body"
        )));
    }
    Ok(ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// One-shot plain-text HTTP server on an ephemeral port.
    fn spawn_echo(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn discover_trims_the_echoed_body() {
        let url = spawn_echo("203.0.113.77\n");
        assert_eq!(discover(&url).unwrap(), "203.0.113.77");
    }

    #[test]
    fn empty_body_is_an_error() {
        let url = spawn_echo("  \n");
        assert!(discover(&url).is_err());
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_error() {
        // Reserved port on localhost with nothing listening.
        let err = discover("http://127.0.0.1:1/ip").unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(_)));
    }
}
