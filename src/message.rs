//! Typed view over one decoded signaling message.
//!
//! `MessageMetadata` carries the fields the routing and transaction layers
//! need, extracted by the decoder from one wire message. Fields are optional
//! because they may come from either the transport or the protocol layer;
//! accessors return [`UnsetField`] instead of a sentinel so callers handle
//! absence explicitly. Pending re-encode edits accumulate in an ordered
//! list and are applied by the encoder when the message is serialized.

use crate::error::UnsetField;

/// Direction of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Request,
    Response,
}

/// Method of a request, or of the request a response answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Register,
    Update,
    Refer,
    Subscribe,
    Notify,
    Ack,
    Bye,
    Cancel,
    Unknown,
}

impl Method {
    /// Parse a method token from the wire.
    #[must_use]
    pub fn from_token(token: &str) -> Self {
        match token {
            "INVITE" => Self::Invite,
            "REGISTER" => Self::Register,
            "UPDATE" => Self::Update,
            "REFER" => Self::Refer,
            "SUBSCRIBE" => Self::Subscribe,
            "NOTIFY" => Self::Notify,
            "ACK" => Self::Ack,
            "BYE" => Self::Bye,
            "CANCEL" => Self::Cancel,
            _ => Self::Unknown,
        }
    }
}

/// One deferred edit applied when the message is re-serialized.
///
/// Edits are deferred because the insertion point is only known once the
/// rest of the message is finalized. They are appended, never removed, and
/// applied strictly in append order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    /// Insert `value` immediately after the first occurrence of `marker`.
    InsertAfter { marker: String, value: String },
    /// Append a header line before the end of the header block.
    AppendHeader { name: String, value: String },
}

/// Metadata about one signaling message.
///
/// Created by the decoder; owned by the transaction driving it. The
/// transaction identifier, once derived from the `branch=` parameter, is
/// immutable for the lifetime of the object.
#[derive(Debug, Default)]
pub struct MessageMetadata {
    msg_kind: Option<MsgKind>,
    method: Option<Method>,
    resp_method: Option<Method>,
    ep: Option<String>,
    route_ep: Option<String>,
    route_opaque: Option<String>,
    request_uri: Option<String>,
    top_route: Option<String>,
    domain: Option<String>,
    transaction_id: Option<String>,
    destination: Option<String>,
    raw_msg: String,
    edits: Vec<EditOp>,
}

impl MessageMetadata {
    /// Create metadata backed by the raw message text.
    #[must_use]
    pub fn new(raw_msg: String) -> Self {
        Self {
            raw_msg,
            ..Self::default()
        }
    }

    /// Message direction.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] if the decoder never classified the message.
    pub fn msg_kind(&self) -> Result<MsgKind, UnsetField> {
        self.msg_kind.ok_or(UnsetField("msg_kind"))
    }

    /// Request method.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] if no method was decoded.
    pub fn method(&self) -> Result<Method, UnsetField> { self.method.ok_or(UnsetField("method")) }

    /// For responses, the method of the request being answered.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] if the response carried no usable `CSeq`.
    pub fn resp_method(&self) -> Result<Method, UnsetField> {
        self.resp_method.ok_or(UnsetField("resp_method"))
    }

    /// Encapsulating endpoint address stamped into the message.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] if no endpoint has been stamped.
    pub fn ep(&self) -> Result<&str, UnsetField> { field(&self.ep, "ep") }

    /// Endpoint parameter of the top route header.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] if the route carried no endpoint parameter.
    pub fn route_ep(&self) -> Result<&str, UnsetField> { field(&self.route_ep, "route_ep") }

    /// Opaque token of the top route header.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] if the route carried no opaque parameter.
    pub fn route_opaque(&self) -> Result<&str, UnsetField> {
        field(&self.route_opaque, "route_opaque")
    }

    /// Request-URI of a request message.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] for responses or undecoded requests.
    pub fn request_uri(&self) -> Result<&str, UnsetField> { field(&self.request_uri, "request_uri") }

    /// Full value of the topmost route header.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] if the message carried no route header.
    pub fn top_route(&self) -> Result<&str, UnsetField> { field(&self.top_route, "top_route") }

    /// Domain the routing table is matched against.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] if neither the request-URI nor the route
    /// header yielded a domain.
    pub fn domain(&self) -> Result<&str, UnsetField> { field(&self.domain, "domain") }

    /// Transaction identifier derived from the `branch=` parameter.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] if no `branch=` parameter was found; such a
    /// message is undispatchable and must be treated as a protocol error.
    pub fn transaction_id(&self) -> Result<&str, UnsetField> {
        field(&self.transaction_id, "transaction_id")
    }

    /// Resolved destination host, set by an earlier affinity lookup.
    ///
    /// # Errors
    ///
    /// Returns [`UnsetField`] until a destination has been resolved.
    pub fn destination(&self) -> Result<&str, UnsetField> { field(&self.destination, "destination") }

    /// Raw message text as received from the wire.
    #[must_use]
    pub fn raw_msg(&self) -> &str { &self.raw_msg }

    /// Pending edits in append order.
    #[must_use]
    pub fn edits(&self) -> &[EditOp] { &self.edits }

    pub fn set_msg_kind(&mut self, kind: MsgKind) { self.msg_kind = Some(kind); }

    pub fn set_method(&mut self, method: Method) { self.method = Some(method); }

    pub fn set_resp_method(&mut self, method: Method) { self.resp_method = Some(method); }

    pub fn set_ep(&mut self, ep: impl Into<String>) { self.ep = Some(ep.into()); }

    pub fn set_route_ep(&mut self, ep: impl Into<String>) { self.route_ep = Some(ep.into()); }

    pub fn set_route_opaque(&mut self, opaque: impl Into<String>) {
        self.route_opaque = Some(opaque.into());
    }

    pub fn set_request_uri(&mut self, uri: impl Into<String>) { self.request_uri = Some(uri.into()); }

    pub fn set_top_route(&mut self, route: impl Into<String>) { self.top_route = Some(route.into()); }

    pub fn set_domain(&mut self, domain: impl Into<String>) { self.domain = Some(domain.into()); }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = Some(destination.into());
    }

    /// Queue a deferred edit to apply at encode time.
    pub fn push_edit(&mut self, edit: EditOp) { self.edits.push(edit); }

    /// Derive the transaction identifier from a full header value.
    ///
    /// Locates the `branch=` parameter and extracts the token up to the
    /// next `;` or `>` (or end of string). If `branch=` is absent the
    /// identifier stays unset. Once derived, the identifier is immutable:
    /// later calls are ignored.
    pub fn set_transaction_id(&mut self, header: &str) {
        if self.transaction_id.is_some() {
            return;
        }
        let Some(start) = header.find("branch=") else {
            return;
        };
        let token = &header[start + "branch=".len()..];
        let end = token.find([';', '>']).unwrap_or(token.len());
        self.transaction_id = Some(token[..end].to_owned());
    }

    /// Clear the transaction identifier. Test-only escape hatch.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn reset_transaction_id(&mut self) { self.transaction_id = None; }
}

fn field<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, UnsetField> {
    value.as_deref().ok_or(UnsetField(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_parameter_terminated_by_angle_bracket() {
        let mut metadata = MessageMetadata::default();
        metadata.set_transaction_id("SIP/2.0/TCP 10.0.0.1:5060;branch=abc123>");
        assert_eq!(metadata.transaction_id(), Ok("abc123"));
    }

    #[test]
    fn branch_parameter_terminated_by_semicolon() {
        let mut metadata = MessageMetadata::default();
        metadata.set_transaction_id("SIP/2.0/TCP 10.0.0.1:5060;branch=abc123;tag=1");
        assert_eq!(metadata.transaction_id(), Ok("abc123"));
    }

    #[test]
    fn branch_parameter_at_end_of_header() {
        let mut metadata = MessageMetadata::default();
        metadata.set_transaction_id("SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bK77ef");
        assert_eq!(metadata.transaction_id(), Ok("z9hG4bK77ef"));
    }

    #[test]
    fn missing_branch_leaves_id_unset() {
        let mut metadata = MessageMetadata::default();
        metadata.set_transaction_id("SIP/2.0/TCP 10.0.0.1:5060;rport");
        assert_eq!(metadata.transaction_id(), Err(UnsetField("transaction_id")));
    }

    #[test]
    fn transaction_id_is_set_once() {
        let mut metadata = MessageMetadata::default();
        metadata.set_transaction_id("Via: x;branch=first");
        metadata.set_transaction_id("Via: x;branch=second");
        assert_eq!(metadata.transaction_id(), Ok("first"));
    }

    #[test]
    fn unset_accessors_name_the_field() {
        let metadata = MessageMetadata::default();
        assert_eq!(metadata.domain(), Err(UnsetField("domain")));
        assert_eq!(metadata.destination(), Err(UnsetField("destination")));
    }

    #[test]
    fn empty_value_is_distinct_from_unset() {
        let mut metadata = MessageMetadata::default();
        metadata.set_domain("");
        assert_eq!(metadata.domain(), Ok(""));
    }

    #[test]
    fn edits_preserve_append_order() {
        let mut metadata = MessageMetadata::default();
        metadata.push_edit(EditOp::InsertAfter {
            marker: "a".into(),
            value: "1".into(),
        });
        metadata.push_edit(EditOp::AppendHeader {
            name: "X".into(),
            value: "2".into(),
        });
        assert_eq!(metadata.edits().len(), 2);
        assert!(matches!(metadata.edits()[0], EditOp::InsertAfter { .. }));
    }
}
