//! Message framing for the sensor board link.
//!
//! The board sends bare JSON objects with no length prefix and no delimiter,
//! so a successful parse of the whole accumulated buffer is the only framing
//! signal. Anything that does not parse is discarded in full: a message split
//! across two read ticks is lost. The reader loop drains the port with a short
//! settle delay, which keeps this rare on the half-duplex link.

use super::message::InboundMessage;

#[derive(Debug, Default)]
pub struct MessageFramer {
    buffer: Vec<u8>,
    last_decoded: Option<InboundMessage>,
    decoded: u64,
    discarded: u64,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and try to decode the accumulated buffer as one message.
    ///
    /// The buffer is cleared after every attempt, successful or not.
    pub fn feed(&mut self, bytes: &[u8]) -> Option<InboundMessage> {
        if bytes.is_empty() {
            return None;
        }
        self.buffer.extend_from_slice(bytes);
        let raw = std::mem::take(&mut self.buffer);

        match serde_json::from_slice::<InboundMessage>(&raw) {
            Ok(message) => {
                self.decoded += 1;
                self.last_decoded = Some(message.clone());
                Some(message)
            }
            Err(err) => {
                self.discarded += 1;
                log::info!(
                    "invalid message: [{}] ({err})",
                    String::from_utf8_lossy(&raw)
                );
                None
            }
        }
    }

    /// Bytes waiting for the next decode attempt. Always empty between calls.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn last_decoded(&self) -> Option<&InboundMessage> {
        self.last_decoded.as_ref()
    }

    pub fn decoded_count(&self) -> u64 {
        self.decoded
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feed_complete_message() {
        let mut framer = MessageFramer::new();
        let msg: InboundMessage =
            serde_json::from_value(json!({"status": 0, "data": [0, 5], "node": 1})).unwrap();

        let decoded = framer.feed(&msg.to_bytes()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(framer.last_decoded(), Some(&msg));
        assert!(framer.pending().is_empty());
        assert_eq!(framer.decoded_count(), 1);
    }

    #[test]
    fn test_split_message_is_dropped() {
        let mut framer = MessageFramer::new();
        let bytes = br#"{"status": 0, "data": [1, 2]}"#;
        let (head, tail) = bytes.split_at(10);

        assert!(framer.feed(head).is_none());
        assert!(framer.pending().is_empty());
        // The tail alone is not a message either; nothing carries over.
        assert!(framer.feed(tail).is_none());
        assert!(framer.pending().is_empty());
        assert_eq!(framer.discarded_count(), 2);
        assert!(framer.last_decoded().is_none());
    }

    #[test]
    fn test_non_object_and_garbage_rejected() {
        let mut framer = MessageFramer::new();
        let inputs: [&[u8]; 4] = [b"42", b"[1,2]", b"Bootloader is started", b"\xff\xfe{}"];
        for input in inputs {
            assert!(framer.feed(input).is_none());
            assert!(framer.pending().is_empty());
        }
        // A valid message right after garbage still decodes.
        assert!(framer.feed(br#"{"CPUID":"AB"}"#).is_some());
    }

    #[test]
    fn test_two_messages_in_one_read_are_dropped() {
        let mut framer = MessageFramer::new();
        assert!(framer.feed(br#"{"a":1}{"b":2}"#).is_none());
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_empty_feed_is_noop() {
        let mut framer = MessageFramer::new();
        assert!(framer.feed(&[]).is_none());
        assert_eq!(framer.discarded_count(), 0);
    }
}
