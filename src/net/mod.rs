//! Network-facing half of a session: the inbound message stream.
//!
//! Individual game messages are opaque to the session machinery apart from
//! the few UI-tree operations the pump dispatches on. Sentinels that force
//! a pump to change ownership travel through the same ordered queue as real
//! traffic, so a blocked pump always observes them in order.

mod handle;

pub use handle::{ConnectionId, ConsumerLease, SessionHandle};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-assigned widget identifier.
pub type WidgetId = i32;

/// Parent id used by the server for top-level widgets.
pub const ROOT_WIDGET: WidgetId = 0;

/// UI-tree operations sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    NewWidget {
        id: WidgetId,
        kind: String,
        parent: WidgetId,
        #[serde(default)]
        pargs: Vec<Value>,
        #[serde(default)]
        cargs: Vec<Value>,
    },
    WidgetMessage {
        id: WidgetId,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    AddWidget {
        id: WidgetId,
        parent: WidgetId,
        #[serde(default)]
        pargs: Vec<Value>,
    },
    Destroy {
        id: WidgetId,
    },
    /// Hold back messages to `bars` until `deps` exist.
    Barrier {
        deps: Vec<WidgetId>,
        bars: Vec<WidgetId>,
    },
}

impl ProtocolMessage {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewWidget { .. } => "new_widget",
            Self::WidgetMessage { .. } => "widget_message",
            Self::AddWidget { .. } => "add_widget",
            Self::Destroy { .. } => "destroy",
            Self::Barrier { .. } => "barrier",
        }
    }
}

/// One entry of a session's inbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Protocol(ProtocolMessage),
    /// The session was demoted: the foreground pump hands the queue to a
    /// background pump and returns.
    Detach,
    /// The session was promoted: the background pump relinquishes the queue.
    Promoted,
}

impl From<ProtocolMessage> for Envelope {
    fn from(msg: ProtocolMessage) -> Self {
        Self::Protocol(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn protocol_message_kind_names() {
        assert_eq!(ProtocolMessage::Destroy { id: 3 }.kind(), "destroy");
        assert_eq!(
            ProtocolMessage::Barrier {
                deps: vec![],
                bars: vec![]
            }
            .kind(),
            "barrier"
        );
    }

    #[test]
    fn protocol_message_parses_tagged_json() {
        let msg: ProtocolMessage = serde_json::from_value(json!({
            "type": "new_widget",
            "id": 7,
            "kind": "inventory",
            "parent": 0,
            "pargs": [[1, 2]],
        }))
        .unwrap();
        assert_eq!(
            msg,
            ProtocolMessage::NewWidget {
                id: 7,
                kind: "inventory".to_string(),
                parent: ROOT_WIDGET,
                pargs: vec![json!([1, 2])],
                cargs: vec![],
            }
        );
    }

    #[test]
    fn protocol_message_converts_into_envelope() {
        let env: Envelope = ProtocolMessage::Destroy { id: 1 }.into();
        assert_eq!(env, Envelope::Protocol(ProtocolMessage::Destroy { id: 1 }));
    }
}
