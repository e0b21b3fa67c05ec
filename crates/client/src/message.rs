//! Inbound messages and their metadata.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Multi-valued message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: BTreeMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every value of `name` with `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(name.into(), vec![value.into()]);
    }

    /// Adds `value` to the values of `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.entry(name.into()).or_default().push(value.into());
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.inner.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.inner.iter()
    }

    /// Approximate encoded size, used for buffer accounting.
    pub(crate) fn encoded_len(&self) -> usize {
        self.inner
            .iter()
            .map(|(k, vs)| vs.iter().map(|v| k.len() + v.len() + 4).sum::<usize>())
            .sum()
    }
}

/// Stream and consumer sequence numbers carried by a stream delivery.
///
/// The stream sequence is global to the stream. The consumer sequence restarts at 1
/// for every new server-side consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequencePair {
    pub stream: u64,
    pub consumer: u64,
}

impl SequencePair {
    pub fn new(stream: u64, consumer: u64) -> Self {
        SequencePair { stream, consumer }
    }
}

/// Stream metadata attached to messages delivered by a server-side consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMeta {
    /// A stored message with its sequence pair.
    Delivery(SequencePair),

    /// An idle heartbeat reporting the last pair the consumer sent.
    Heartbeat {
        last: SequencePair,
    },
}

/// A message received on a subscription.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply_to: Option<String>,
    pub headers: Option<Headers>,
    pub payload: Bytes,

    /// Id of the server-side interest the message was routed by.
    pub sid: u64,

    /// Present on messages sent by a stream consumer.
    pub stream: Option<StreamMeta>,
}

impl Message {
    /// A plain message without headers or stream metadata.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message {
            subject: subject.into(),
            reply_to: None,
            headers: None,
            payload: payload.into(),
            sid: 0,
            stream: None,
        }
    }

    /// The sequence pair of a stream delivery.
    pub fn sequence(&self) -> Option<SequencePair> {
        match self.stream {
            Some(StreamMeta::Delivery(pair)) => Some(pair),
            _ => None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.stream, Some(StreamMeta::Heartbeat { .. }))
    }

    /// Bytes counted against a subscription's pending byte limit.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_multi_value() {
        let mut headers = Headers::new();
        headers.append("X-Trace", "a");
        headers.append("X-Trace", "b");
        assert_eq!(headers.get("X-Trace"), Some("a"));
        assert_eq!(headers.get_all("X-Trace").len(), 2);

        headers.insert("X-Trace", "c");
        assert_eq!(headers.get_all("X-Trace"), ["c".to_string()]);
        assert!(headers.get_all("missing").is_empty());
    }

    #[test]
    fn test_message_sequence() {
        let mut msg = Message::new("a", "payload");
        assert_eq!(msg.size(), 7);
        assert!(msg.sequence().is_none());

        msg.stream = Some(StreamMeta::Delivery(SequencePair::new(10, 1)));
        assert_eq!(msg.sequence(), Some(SequencePair::new(10, 1)));

        msg.stream = Some(StreamMeta::Heartbeat {
            last: SequencePair::new(10, 1),
        });
        assert!(msg.is_heartbeat());
        assert!(msg.sequence().is_none());
    }
}
