use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

/// Opaque acknowledgment id issued by the service for one delivery.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AckId(String);

impl AckId {
    /// Creates an ack id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the length of the id in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the id is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AckId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for AckId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<AckId> for String {
    fn from(id: AckId) -> Self {
        id.0
    }
}

/// A message pulled from the service, owned by the application until it is acked or nacked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    ack_id: AckId,
    attributes: HashMap<String, String>,
    payload: Bytes,
    size: usize,
}

impl ReceivedMessage {
    /// Creates a message with no attributes and an estimated size.
    pub fn new(ack_id: impl Into<AckId>, payload: impl Into<Bytes>) -> Self {
        Self::with_attributes(ack_id, payload, HashMap::new())
    }

    /// Creates a message with attributes and an estimated size.
    pub fn with_attributes(
        ack_id: impl Into<AckId>,
        payload: impl Into<Bytes>,
        attributes: HashMap<String, String>,
    ) -> Self {
        let ack_id = ack_id.into();
        let payload = payload.into();
        let size = Self::estimate_size(&ack_id, &payload, &attributes);

        Self {
            ack_id,
            attributes,
            payload,
            size,
        }
    }

    /// Overrides the size estimate used for flow control.
    #[must_use]
    pub const fn sized(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// The ack id for this delivery.
    #[must_use]
    pub const fn ack_id(&self) -> &AckId {
        &self.ack_id
    }

    /// Message attributes.
    #[must_use]
    pub const fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    /// Message payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Approximate size in bytes. Only used for flow control.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Splits the message into its ack id, payload and attributes.
    #[must_use]
    pub fn into_parts(self) -> (AckId, Bytes, HashMap<String, String>) {
        (self.ack_id, self.payload, self.attributes)
    }

    fn estimate_size(ack_id: &AckId, payload: &Bytes, attributes: &HashMap<String, String>) -> usize {
        let attributes_size: usize = attributes.iter().map(|(k, v)| k.len() + v.len()).sum();

        payload.len() + attributes_size + ack_id.len()
    }
}
