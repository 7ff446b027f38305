//! The structured response every caller receives.

use serde::{Deserialize, Serialize};

use crate::envelope::wrapped_bytes;
use crate::error::Result;

/// Status returned when the broker rejected a publish or the downstream
/// reset the connection.
pub const STATUS_UNAVAILABLE: u16 = 503;
/// Status returned on a client- or executor-side timeout.
pub const STATUS_TIMEOUT: u16 = 504;

/// Hop-by-hop headers stripped before a reply is re-emitted by a front-end.
const HOP_HEADERS: [&str; 3] = ["transfer-encoding", "date", "connection"];

/// Structured RPC result: `{status, body, headers}`.
///
/// The invariant of the whole system is that a caller always receives a
/// well-formed `Reply`, even under full infrastructure failure. The 503 and
/// 504 constructors build the synthetic replies used on those paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: u16,
    #[serde(with = "wrapped_bytes")]
    pub body: Vec<u8>,
    /// Ordered header sequence; order is preserved across the wire.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl Reply {
    pub fn new(status: u16, body: Vec<u8>, headers: Vec<(String, String)>) -> Self {
        Self {
            status,
            body,
            headers,
        }
    }

    pub fn ok(body: Vec<u8>) -> Self {
        Self::new(200, body, Vec::new())
    }

    /// Synthetic reply for a rejected publish or a downstream reset.
    pub fn service_unavailable() -> Self {
        Self::new(
            STATUS_UNAVAILABLE,
            b"503 Service Unavailable".to_vec(),
            Vec::new(),
        )
    }

    /// Synthetic reply for a timed-out call or executor.
    pub fn gateway_timeout() -> Self {
        Self::new(STATUS_TIMEOUT, b"504 Gateway Timeout".to_vec(), Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Reply> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Drops hop-by-hop headers a front-end must not forward verbatim.
    pub fn without_hop_headers(mut self) -> Self {
        self.headers
            .retain(|(name, _)| !HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_round_trip() {
        let reply = Reply::new(
            200,
            b"<html>hello</html>".to_vec(),
            vec![
                ("Content-Type".to_string(), "text/html".to_string()),
                ("Content-Length".to_string(), "18".to_string()),
            ],
        );

        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn header_order_is_preserved() {
        let headers: Vec<(String, String)> = (0..16)
            .map(|i| (format!("X-H{i}"), format!("v{i}")))
            .collect();
        let reply = Reply::new(200, Vec::new(), headers.clone());
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded.headers, headers);
    }

    #[test]
    fn synthetic_replies_carry_reserved_statuses() {
        assert_eq!(Reply::service_unavailable().status, STATUS_UNAVAILABLE);
        assert_eq!(Reply::gateway_timeout().status, STATUS_TIMEOUT);
    }

    #[test]
    fn binary_body_survives_the_wire() {
        let body: Vec<u8> = vec![0, 159, 146, 150, 255, 0, 10, 13];
        let reply = Reply::ok(body.clone());
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn hop_headers_are_stripped() {
        let reply = Reply::new(
            200,
            Vec::new(),
            vec![
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Date".to_string(), "now".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
            ],
        )
        .without_hop_headers();

        assert_eq!(
            reply.headers,
            vec![("Content-Type".to_string(), "text/plain".to_string())]
        );
    }
}
