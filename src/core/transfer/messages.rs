//! Control-plane messages of the transfer protocol.
//!
//! JSON text frames on the transfer channels, next to the binary blocks:
//!
//! ```json
//! {"type":"head","id":"...","fileName":"a.bin","fileSize":10, ...}
//! {"type":"request-head"}
//! {"type":"request-content","ranges":[0,[2,5]]}
//! {"type":"complete"}
//! ```

use crate::core::meta::FileMetaData;
use crate::core::range::ChunkRange;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferMessage {
    /// Metadata announcement.
    Head(FileMetaData),
    RequestHead,
    /// Chunks the sender should (re)send.
    RequestContent { ranges: Vec<ChunkRange> },
    /// End-of-transfer marker.
    Complete,
}

impl TransferMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            TransferMessage::Head(_) => "head",
            TransferMessage::RequestHead => "request-head",
            TransferMessage::RequestContent { .. } => "request-content",
            TransferMessage::Complete => "complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::meta::tests::sample;
    use serde_json::json;

    #[test]
    fn head_flattens_metadata() {
        let msg = TransferMessage::Head(sample(10, 4));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "head");
        assert_eq!(value["fileSize"], 10);
        assert_eq!(value["id"], "file-1");
        assert_eq!(serde_json::from_value::<TransferMessage>(value).unwrap(), msg);
    }

    #[test]
    fn kebab_case_tags() {
        assert_eq!(
            serde_json::to_value(TransferMessage::RequestHead).unwrap(),
            json!({"type": "request-head"})
        );
        let req: TransferMessage =
            serde_json::from_str(r#"{"type":"request-content","ranges":[1,[3,4]]}"#).unwrap();
        assert_eq!(
            req,
            TransferMessage::RequestContent {
                ranges: vec![ChunkRange::Single(1), ChunkRange::Span(3, 4)]
            }
        );
        assert!(serde_json::from_str::<TransferMessage>(r#"{"type":"text","body":"hi"}"#).is_err());
    }
}
