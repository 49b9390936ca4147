//! Typed views over raw BLIP messages.
//!
//! Adapters parse lazily and report malformed input through the handler
//! error path; none of them panic on peer-controlled data.

use tidegate_blip::BlipMessage;

use crate::db::{SequenceId, SyncDatabase};
use crate::error::SyncError;

pub const PROFILE_GET_CHECKPOINT: &str = "getCheckpoint";
pub const PROFILE_SET_CHECKPOINT: &str = "setCheckpoint";
pub const PROFILE_SUB_CHANGES: &str = "subChanges";
pub const PROFILE_CHANGES: &str = "changes";
pub const PROFILE_PROPOSE_CHANGES: &str = "proposeChanges";
pub const PROFILE_REV: &str = "rev";
pub const PROFILE_NOREV: &str = "norev";
pub const PROFILE_GET_ATTACHMENT: &str = "getAttachment";
pub const PROFILE_PROVE_ATTACHMENT: &str = "proveAttachment";

pub const PROP_CLIENT: &str = "client";
pub const PROP_REV: &str = "rev";
pub const PROP_ID: &str = "id";
pub const PROP_SINCE: &str = "since";
pub const PROP_BATCH: &str = "batch";
pub const PROP_CONTINUOUS: &str = "continuous";
pub const PROP_ACTIVE_ONLY: &str = "active_only";
pub const PROP_FILTER: &str = "filter";
pub const PROP_CHANNELS: &str = "channels";
pub const PROP_DOC_IDS: &str = "docIDs";
pub const PROP_FUTURE: &str = "future";
pub const PROP_DELETED: &str = "deleted";
pub const PROP_HISTORY: &str = "history";
pub const PROP_DELTA_SRC: &str = "deltaSrc";
pub const PROP_NO_CONFLICTS: &str = "noconflicts";
pub const PROP_SEQUENCE: &str = "sequence";
pub const PROP_DIGEST: &str = "digest";
pub const PROP_COMPRESS: &str = "compress";
pub const PROP_DELTAS: &str = "deltas";
pub const PROP_ERROR: &str = "error";
pub const PROP_REASON: &str = "reason";
pub const PROP_HANDLER: &str = "handler";

/// The only filter the subscription endpoint recognizes.
pub const CHANNEL_FILTER: &str = "sync_gateway/bychannel";

pub(crate) fn required_property<'a>(msg: &'a BlipMessage, key: &str) -> Result<&'a str, SyncError> {
    match msg.property(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(SyncError::bad_request(format!("missing required property {key:?}"))),
    }
}

pub(crate) fn bool_property(msg: &BlipMessage, key: &str) -> Result<bool, SyncError> {
    match msg.property(key) {
        None | Some("") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(SyncError::bad_request(format!(
            "invalid boolean {other:?} for property {key:?}"
        ))),
    }
}

/// `getCheckpoint` / `setCheckpoint`.
pub struct CheckpointMessage<'a> {
    msg: &'a BlipMessage,
}

impl<'a> CheckpointMessage<'a> {
    pub fn new(msg: &'a BlipMessage) -> Self {
        Self { msg }
    }

    pub fn client(&self) -> Result<&'a str, SyncError> {
        required_property(self.msg, PROP_CLIENT)
    }

    pub fn rev(&self) -> Option<&'a str> {
        self.msg.property(PROP_REV)
    }
}

/// Parsed `subChanges` parameters.
#[derive(Debug, Clone)]
pub struct SubChangesParams {
    pub since: SequenceId,
    pub batch_size: usize,
    pub continuous: bool,
    pub active_only: bool,
    pub filter: Option<String>,
    pub channels: Vec<String>,
    pub doc_ids: Vec<String>,
    pub future: bool,
}

impl SubChangesParams {
    pub fn parse(
        msg: &BlipMessage,
        db: &dyn SyncDatabase,
        default_batch_size: usize,
    ) -> Result<Self, SyncError> {
        let since = match msg.property(PROP_SINCE) {
            Some(s) => db.parse_sequence_id(s)?,
            None => db.create_zero_since_value(),
        };
        let batch_size = match msg.property(PROP_BATCH) {
            Some(b) => b
                .parse::<usize>()
                .map_err(|_| SyncError::bad_request(format!("invalid batch size {b:?}")))?
                .max(1),
            None => default_batch_size,
        };
        let channels = msg
            .property(PROP_CHANNELS)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let doc_ids = match msg.property(PROP_DOC_IDS) {
            None | Some("") => Vec::new(),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|_| SyncError::bad_request(format!("invalid docIDs list {raw:?}")))?,
        };
        Ok(Self {
            since,
            batch_size,
            continuous: bool_property(msg, PROP_CONTINUOUS)?,
            active_only: bool_property(msg, PROP_ACTIVE_ONLY)?,
            filter: msg.property(PROP_FILTER).map(String::from),
            channels,
            doc_ids,
            future: bool_property(msg, PROP_FUTURE)?,
        })
    }
}

/// Inbound `rev`.
pub struct RevMessage<'a> {
    msg: &'a BlipMessage,
}

impl<'a> RevMessage<'a> {
    pub fn new(msg: &'a BlipMessage) -> Self {
        Self { msg }
    }

    pub fn id(&self) -> Result<&'a str, SyncError> {
        required_property(self.msg, PROP_ID)
    }

    pub fn rev(&self) -> Result<&'a str, SyncError> {
        required_property(self.msg, PROP_REV)
    }

    pub fn delta_src(&self) -> Option<&'a str> {
        self.msg.property(PROP_DELTA_SRC).filter(|s| !s.is_empty())
    }

    pub fn history(&self) -> Vec<String> {
        self.msg
            .property(PROP_HISTORY)
            .map(|h| {
                h.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn deleted(&self) -> Result<bool, SyncError> {
        bool_property(self.msg, PROP_DELETED)
    }

    pub fn no_conflicts(&self) -> Result<bool, SyncError> {
        bool_property(self.msg, PROP_NO_CONFLICTS)
    }

    pub fn sequence(&self) -> Option<&'a str> {
        self.msg.property(PROP_SEQUENCE)
    }
}

/// `getAttachment` / `proveAttachment`.
pub struct AttachmentMessage<'a> {
    msg: &'a BlipMessage,
}

impl<'a> AttachmentMessage<'a> {
    pub fn new(msg: &'a BlipMessage) -> Self {
        Self { msg }
    }

    pub fn digest(&self) -> Result<&'a str, SyncError> {
        required_property(self.msg, PROP_DIGEST)
    }

    pub fn compress(&self) -> Result<bool, SyncError> {
        bool_property(self.msg, PROP_COMPRESS)
    }
}
