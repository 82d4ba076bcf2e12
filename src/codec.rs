//! Wire codec boundary for the signaling protocol.
//!
//! The proxy core does not parse full protocol grammar; it only needs the
//! handful of fields the router and transaction layers dispatch on. The
//! [`MessageDecoder`] and [`MessageEncoder`] traits mark that boundary, and
//! [`SignalingCodec`] provides a line-oriented implementation that scans a
//! buffered message for exactly those fields. The encoder re-serializes the
//! raw text with the metadata's pending edits applied in append order.

use bytes::{Bytes, BytesMut};

use crate::{
    error::{ProxyError, Result},
    message::{EditOp, MessageMetadata, Method, MsgKind},
};

/// Converts buffered bytes into zero or more decoded messages.
pub trait MessageDecoder: Send {
    /// Attempt to decode one complete message from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `src`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] for malformed input the decoder
    /// cannot skip past.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MessageMetadata>>;
}

/// Serializes a message with its pending edits applied.
pub trait MessageEncoder: Send + Sync {
    /// Produce wire bytes for the message.
    fn encode(&self, metadata: &MessageMetadata) -> Bytes;
}

/// Line-oriented codec extracting dispatch-relevant fields.
///
/// Messages are a start line plus header lines, terminated by an empty
/// line; a `Content-Length` header extends the message by that many body
/// bytes. Only the first `Via` and `Route` headers are inspected.
#[derive(Clone, Debug, Default)]
pub struct SignalingCodec {
    domain_param: Option<String>,
}

impl SignalingCodec {
    /// Construct a codec.
    ///
    /// `domain_param` names the route-header parameter carrying the match
    /// domain; when absent the domain falls back to the request-URI host.
    #[must_use]
    pub fn new(domain_param: Option<String>) -> Self { Self { domain_param } }
}

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

impl MessageDecoder for SignalingCodec {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MessageMetadata>> {
        let Some(header_end) = find_terminator(src) else {
            return Ok(None);
        };

        let header_len = header_end + HEADER_TERMINATOR.len();
        let headers = std::str::from_utf8(&src[..header_end])
            .map_err(|_| ProxyError::Protocol("message is not valid UTF-8".into()))?;

        let body_len = content_length(headers)?;
        let total = header_len + body_len;
        if src.len() < total {
            return Ok(None);
        }

        let raw = src.split_to(total);
        let text = std::str::from_utf8(&raw)
            .map_err(|_| ProxyError::Protocol("message body is not valid UTF-8".into()))?;

        self.parse(text).map(Some)
    }
}

impl SignalingCodec {
    fn parse(&self, text: &str) -> Result<MessageMetadata> {
        let mut metadata = MessageMetadata::new(text.to_owned());
        let mut lines = text.split("\r\n");

        let start_line = lines
            .next()
            .ok_or_else(|| ProxyError::Protocol("empty message".into()))?;
        self.parse_start_line(start_line, &mut metadata)?;

        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim() {
                n if n.eq_ignore_ascii_case("Via") => metadata.set_transaction_id(value),
                n if n.eq_ignore_ascii_case("Route") && metadata.top_route().is_err() => {
                    self.parse_top_route(value, &mut metadata);
                }
                n if n.eq_ignore_ascii_case("CSeq") => {
                    if let Some(method) = value.split_ascii_whitespace().nth(1) {
                        metadata.set_resp_method(Method::from_token(method));
                    }
                }
                _ => {}
            }
        }

        if metadata.domain().is_err() {
            let host = metadata
                .request_uri()
                .ok()
                .and_then(uri_host)
                .map(ToOwned::to_owned);
            if let Some(host) = host {
                metadata.set_domain(host);
            }
        }

        Ok(metadata)
    }

    fn parse_start_line(&self, line: &str, metadata: &mut MessageMetadata) -> Result<()> {
        let mut tokens = line.split_ascii_whitespace();
        let first = tokens
            .next()
            .ok_or_else(|| ProxyError::Protocol("empty start line".into()))?;

        if first.contains('/') {
            // "SIP/2.0 200 OK"
            metadata.set_msg_kind(MsgKind::Response);
        } else {
            let uri = tokens
                .next()
                .ok_or_else(|| ProxyError::Protocol(format!("request line `{line}` has no URI")))?;
            metadata.set_msg_kind(MsgKind::Request);
            metadata.set_method(Method::from_token(first));
            metadata.set_request_uri(uri);
        }
        Ok(())
    }

    fn parse_top_route(&self, value: &str, metadata: &mut MessageMetadata) {
        metadata.set_top_route(value);
        if let Some(ep) = param_value(value, "ep") {
            metadata.set_route_ep(ep);
        }
        if let Some(opaque) = param_value(value, "opaque") {
            metadata.set_route_opaque(opaque);
        }
        if let Some(param) = &self.domain_param {
            if let Some(domain) = param_value(value, param) {
                metadata.set_domain(domain);
            }
        }
    }
}

/// Encoder applying pending metadata edits to the raw text.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalingEncoder;

impl MessageEncoder for SignalingEncoder {
    fn encode(&self, metadata: &MessageMetadata) -> Bytes {
        let mut text = metadata.raw_msg().to_owned();
        for edit in metadata.edits() {
            match edit {
                EditOp::InsertAfter { marker, value } => {
                    if let Some(pos) = text.find(marker.as_str()) {
                        text.insert_str(pos + marker.len(), value);
                    } else {
                        tracing::warn!(marker = %marker, "edit marker not found, edit skipped");
                    }
                }
                EditOp::AppendHeader { name, value } => {
                    if let Some(pos) = text.find("\r\n\r\n") {
                        text.insert_str(pos + 2, &format!("{name}: {value}\r\n"));
                    }
                }
            }
        }
        Bytes::from(text)
    }
}

fn find_terminator(src: &BytesMut) -> Option<usize> {
    src.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn content_length(headers: &str) -> Result<usize> {
    for line in headers.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                return value
                    .trim()
                    .parse()
                    .map_err(|_| ProxyError::Protocol(format!("bad content length `{value}`")));
            }
        }
    }
    Ok(0)
}

/// Extract `name=value` from a parameter list such as a route header.
pub(crate) fn param_value<'a>(source: &'a str, name: &str) -> Option<&'a str> {
    let mut search = source;
    while let Some(pos) = search.find(name) {
        let rest = &search[pos + name.len()..];
        let preceded = pos == 0
            || matches!(
                search.as_bytes()[pos - 1],
                b';' | b'?' | b'&' | b'<' | b' '
            );
        if preceded && rest.starts_with('=') {
            let value = &rest[1..];
            let end = value.find([';', '>', '&']).unwrap_or(value.len());
            return Some(&value[..end]);
        }
        search = &search[pos + name.len()..];
    }
    None
}

/// Host portion of a `sip:` URI, without user info, port, or parameters.
fn uri_host(uri: &str) -> Option<&str> {
    let uri = uri.strip_prefix('<').unwrap_or(uri);
    let rest = uri.split_once(':').map_or(uri, |(_, rest)| rest);
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    let end = rest.find([':', ';', '>']).unwrap_or(rest.len());
    let host = &rest[..end];
    (!host.is_empty()).then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> String {
        concat!(
            "INVITE sip:alice@a.example.com SIP/2.0\r\n",
            "Via: SIP/2.0/TCP 10.0.0.1:5060;branch=abc123;rport\r\n",
            "Route: <sip:proxy.example.com;ep=10.0.0.9;opaque=tok1>\r\n",
            "CSeq: 1 INVITE\r\n",
            "\r\n",
        )
        .to_owned()
    }

    #[test]
    fn decodes_request_fields() {
        let mut codec = SignalingCodec::new(None);
        let mut buf = BytesMut::from(invite().as_str());
        let metadata = codec.decode(&mut buf).unwrap().expect("complete message");

        assert_eq!(metadata.msg_kind(), Ok(MsgKind::Request));
        assert_eq!(metadata.method(), Ok(Method::Invite));
        assert_eq!(metadata.transaction_id(), Ok("abc123"));
        assert_eq!(metadata.domain(), Ok("a.example.com"));
        assert_eq!(metadata.route_ep(), Ok("10.0.0.9"));
        assert_eq!(metadata.route_opaque(), Ok("tok1"));
        assert!(buf.is_empty());
    }

    #[test]
    fn domain_parameter_on_route_takes_precedence() {
        let mut codec = SignalingCodec::new(Some("x-suri".into()));
        let raw = concat!(
            "INVITE sip:alice@a.example.com SIP/2.0\r\n",
            "Via: SIP/2.0/TCP 10.0.0.1;branch=b1\r\n",
            "Route: <sip:proxy;x-suri=b.example.com>\r\n",
            "\r\n",
        );
        let mut buf = BytesMut::from(raw);
        let metadata = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(metadata.domain(), Ok("b.example.com"));
    }

    #[test]
    fn decodes_response_with_cseq_method() {
        let raw = concat!(
            "SIP/2.0 200 OK\r\n",
            "Via: SIP/2.0/TCP 10.0.0.1;branch=abc123\r\n",
            "CSeq: 1 INVITE\r\n",
            "\r\n",
        );
        let mut codec = SignalingCodec::new(None);
        let mut buf = BytesMut::from(raw);
        let metadata = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(metadata.msg_kind(), Ok(MsgKind::Response));
        assert_eq!(metadata.resp_method(), Ok(Method::Invite));
        assert_eq!(metadata.transaction_id(), Ok("abc123"));
    }

    #[test]
    fn incomplete_message_returns_none_and_keeps_bytes() {
        let mut codec = SignalingCodec::new(None);
        let mut buf = BytesMut::from("INVITE sip:a@b SIP/2.0\r\nVia: x;branch=1\r\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(!buf.is_empty());
    }

    #[test]
    fn body_bytes_are_consumed_with_the_message() {
        let raw = concat!(
            "INVITE sip:a@b.example.com SIP/2.0\r\n",
            "Via: x;branch=b2\r\n",
            "Content-Length: 4\r\n",
            "\r\n",
            "abcd",
        );
        let mut codec = SignalingCodec::new(None);
        let mut buf = BytesMut::from(raw);
        let metadata = codec.decode(&mut buf).unwrap().unwrap();
        assert!(metadata.raw_msg().ends_with("abcd"));
        assert!(buf.is_empty());
    }

    #[test]
    fn two_messages_decode_in_sequence() {
        let mut codec = SignalingCodec::new(None);
        let mut buf = BytesMut::from(format!("{}{}", invite(), invite()).as_str());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encoder_applies_edits_in_append_order() {
        let mut codec = SignalingCodec::new(None);
        let mut buf = BytesMut::from(invite().as_str());
        let mut metadata = codec.decode(&mut buf).unwrap().unwrap();

        metadata.push_edit(EditOp::InsertAfter {
            marker: "branch=abc123".into(),
            value: ";ep=10.0.0.2".into(),
        });
        metadata.push_edit(EditOp::AppendHeader {
            name: "X-Relayed-By".into(),
            value: "sipframe".into(),
        });

        let bytes = SignalingEncoder.encode(&metadata);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("branch=abc123;ep=10.0.0.2;rport"));
        assert!(text.contains("X-Relayed-By: sipframe\r\n"));
    }

    #[test]
    fn missing_marker_skips_edit() {
        let mut metadata = MessageMetadata::new("INVITE sip:a@b SIP/2.0\r\n\r\n".into());
        metadata.push_edit(EditOp::InsertAfter {
            marker: "nowhere".into(),
            value: "x".into(),
        });
        let bytes = SignalingEncoder.encode(&metadata);
        assert_eq!(&bytes[..], metadata.raw_msg().as_bytes());
    }
}
