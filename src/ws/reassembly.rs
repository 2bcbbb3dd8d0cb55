use super::codec::Payload;
use super::message::WsMessage;

/// Accumulates fragments until a message is finished.
///
/// Text and binary fragments go to separate buffers, so a finished message of one kind never
/// flushes or contains data of the other.
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    bytes: Vec<u8>,
    text: String,
}

impl Reassembler {
    pub(crate) fn push(&mut self, payload: Payload, message_finished: bool) -> Option<WsMessage> {
        match payload {
            Payload::Bytes(data) => {
                if self.bytes.is_empty() {
                    self.bytes = data;
                } else {
                    self.bytes.extend_from_slice(&data);
                }
                message_finished.then(|| WsMessage::Bytes(std::mem::take(&mut self.bytes)))
            }
            Payload::Text(data) => {
                if self.text.is_empty() {
                    self.text = data;
                } else {
                    self.text.push_str(&data);
                }
                message_finished.then(|| WsMessage::Text(std::mem::take(&mut self.text)))
            }
        }
    }

    /// Drop partial messages, e.g. when the session they belong to is gone.
    pub(crate) fn reset(&mut self) {
        self.bytes.clear();
        self.text.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_passes_through() {
        let mut buffers = Reassembler::default();

        let message = buffers.push(Payload::Bytes(b"test".to_vec()), true);

        assert_eq!(message, Some(WsMessage::Bytes(b"test".to_vec())));
        assert!(buffers.is_empty());
    }

    #[test]
    fn fragments_are_concatenated_in_order() {
        let mut buffers = Reassembler::default();

        assert_eq!(buffers.push(Payload::Text("hel".to_owned()), false), None);
        assert_eq!(buffers.push(Payload::Text("lo ".to_owned()), false), None);
        let message = buffers.push(Payload::Text("world".to_owned()), true);

        assert_eq!(message, Some(WsMessage::Text("hello world".to_owned())));
        assert!(buffers.is_empty());
    }

    #[test]
    fn interleaved_kinds_do_not_mix() {
        let mut buffers = Reassembler::default();

        assert_eq!(buffers.push(Payload::Bytes(vec![1, 2]), false), None);
        assert_eq!(buffers.push(Payload::Text("a".to_owned()), false), None);
        assert_eq!(buffers.push(Payload::Bytes(vec![3]), false), None);

        let text = buffers.push(Payload::Text("b".to_owned()), true);
        assert_eq!(text, Some(WsMessage::Text("ab".to_owned())));

        let bytes = buffers.push(Payload::Bytes(vec![4]), true);
        assert_eq!(bytes, Some(WsMessage::Bytes(vec![1, 2, 3, 4])));
    }

    #[test]
    fn empty_final_fragment_yields_empty_message() {
        let mut buffers = Reassembler::default();

        let message = buffers.push(Payload::Bytes(Vec::new()), true);

        assert_eq!(message, Some(WsMessage::Bytes(Vec::new())));
    }

    #[test]
    fn reset_discards_partial_messages() {
        let mut buffers = Reassembler::default();
        buffers.push(Payload::Bytes(vec![9]), false);
        buffers.push(Payload::Text("partial".to_owned()), false);

        buffers.reset();

        assert!(buffers.is_empty());
        assert_eq!(
            buffers.push(Payload::Bytes(vec![1]), true),
            Some(WsMessage::Bytes(vec![1]))
        );
    }
}
