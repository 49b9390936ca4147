use serde_json::Value;

use super::{JsonMap, SequenceId, BODY_ATTACHMENTS};

/// One revision in flight: constructed from an inbound `rev` or read out of
/// the store for an outbound one, then discarded once the exchange ends.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub id: String,
    pub rev_id: String,
    pub deleted: bool,
    /// Business body with all reserved keys stripped.
    pub body: JsonMap,
    /// Attachment metadata keyed by attachment name.
    pub attachments: JsonMap,
    /// Raw `_exp` value as found in the body; the database owns the grammar
    /// (integer seconds, RFC3339, or relative duration).
    pub expiry: Option<Value>,
    /// Revision ancestry, newest first, excluding `rev_id` itself.
    pub history: Vec<String>,
    pub sequence: Option<SequenceId>,
}

impl Document {
    pub fn new(id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev_id: rev_id.into(),
            ..Default::default()
        }
    }

    /// The body as it travels on the wire: the business body plus the
    /// `_attachments` map when the revision carries any. `_id`/`_rev` stay
    /// in message properties, never in the body.
    pub fn wire_body(&self) -> JsonMap {
        let mut body = self.body.clone();
        if !self.attachments.is_empty() {
            body.insert(BODY_ATTACHMENTS.into(), Value::Object(self.attachments.clone()));
        }
        body
    }

    /// Digests of every attachment referenced by this revision.
    pub fn attachment_digests(&self) -> Vec<String> {
        self.attachments
            .values()
            .filter_map(|meta| meta.get("digest").and_then(Value::as_str))
            .map(String::from)
            .collect()
    }
}
