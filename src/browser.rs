use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub(crate) const DEFAULT_COLS: u32 = 80;
pub(crate) const DEFAULT_ROWS: u32 = 24;

// Terminal dimensions reported by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub(crate) struct Geometry {
    pub(crate) cols: u32,
    pub(crate) rows: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

// Named events emitted to the browser as `{"event": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub(crate) enum BrowserEvent {
    Status(String),
    // Out-of-band text, such as the upstream login banner.
    Data(String),
    Ssherror(String),
    Reauth,
    ShutdownCountdownUpdate(u64),
}

// Messages delivered to a browser channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BrowserCommand {
    Output(Bytes),
    Event(BrowserEvent),
    Disconnect,
}

// Messages received from a browser channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BrowserMessage {
    Data(Bytes),
    Geometry(Geometry),
    Resize(Geometry),
    Disconnect(String),
    Error(String),
}

// Named events accepted from the browser as JSON text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
enum InboundEvent {
    Data(String),
    Geometry(Geometry),
    Resize(Geometry),
}

impl BrowserMessage {
    // Unknown or malformed events are ignored.
    pub(crate) fn from_text(text: &str) -> Option<Self> {
        match serde_json::from_str::<InboundEvent>(text).ok()? {
            InboundEvent::Data(data) => Some(BrowserMessage::Data(Bytes::from(data))),
            InboundEvent::Geometry(geometry) => Some(BrowserMessage::Geometry(geometry)),
            InboundEvent::Resize(geometry) => Some(BrowserMessage::Resize(geometry)),
        }
    }
}

// Cheaply-cloneable handle to a browser channel.
//
// Disconnecting happens at most once. Anything sent afterwards is dropped.
#[derive(Debug, Clone)]
pub(crate) struct BrowserHandle {
    tx: mpsc::UnboundedSender<BrowserCommand>,
    disconnected: Arc<AtomicBool>,
}

impl BrowserHandle {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<BrowserCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            BrowserHandle {
                tx,
                disconnected: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub(crate) fn emit(&self, event: BrowserEvent) {
        self.send(BrowserCommand::Event(event));
    }

    pub(crate) fn write(&self, data: Bytes) {
        self.send(BrowserCommand::Output(data));
    }

    // Returns whether this call was the one to disconnect the channel.
    pub(crate) fn disconnect(&self) -> bool {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(BrowserCommand::Disconnect);
        true
    }

    fn send(&self, command: BrowserCommand) {
        if !self.disconnected.load(Ordering::Acquire) {
            let _ = self.tx.send(command);
        }
    }
}

// Normalizes line endings to CRLF for the browser terminal.
pub(crate) fn to_crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

#[cfg(test)]
mod browser_handle_tests {
    use bytes::Bytes;

    use super::{BrowserCommand, BrowserEvent, BrowserHandle, BrowserMessage, Geometry, to_crlf};

    #[test]
    fn serializes_events_with_payloads() {
        let events = [
            BrowserEvent::Status("SSH CONNECTION ESTABLISHED".into()),
            BrowserEvent::Ssherror("SSH CONN ERROR: All configured authentication methods failed".into()),
            BrowserEvent::Reauth,
            BrowserEvent::ShutdownCountdownUpdate(3),
        ];
        let json: Vec<_> = events
            .iter()
            .map(|event| serde_json::to_value(event).unwrap())
            .collect();
        insta::assert_yaml_snapshot!(json, @r###"
        - event: status
          payload: SSH CONNECTION ESTABLISHED
        - event: ssherror
          payload: "SSH CONN ERROR: All configured authentication methods failed"
        - event: reauth
        - event: shutdownCountdownUpdate
          payload: 3
        "###);
    }

    #[test]
    fn disconnects_exactly_once() {
        let (handle, mut rx) = BrowserHandle::new();
        handle.write(Bytes::from_static(b"hello"));
        assert!(handle.disconnect());
        assert!(!handle.clone().disconnect());
        handle.emit(BrowserEvent::Status("ignored".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            BrowserCommand::Output(Bytes::from_static(b"hello"))
        );
        assert_eq!(rx.try_recv().unwrap(), BrowserCommand::Disconnect);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn parses_inbound_events() {
        assert_eq!(
            BrowserMessage::from_text(r#"{"event":"data","payload":"ls -la\r"}"#),
            Some(BrowserMessage::Data(Bytes::from_static(b"ls -la\r")))
        );
        assert_eq!(
            BrowserMessage::from_text(r#"{"event":"geometry","payload":{"cols":132,"rows":43}}"#),
            Some(BrowserMessage::Geometry(Geometry { cols: 132, rows: 43 }))
        );
        assert_eq!(
            BrowserMessage::from_text(r#"{"event":"resize","payload":{"cols":100,"rows":30}}"#),
            Some(BrowserMessage::Resize(Geometry { cols: 100, rows: 30 }))
        );
        assert_eq!(BrowserMessage::from_text(r#"{"event":"unknown"}"#), None);
        assert_eq!(BrowserMessage::from_text("not json"), None);
    }

    #[test]
    fn normalizes_banner_line_endings() {
        assert_eq!(to_crlf("Welcome\nto\r\nnode01\n"), "Welcome\r\nto\r\nnode01\r\n");
    }
}
