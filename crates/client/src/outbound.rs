//! Outbound write path.
//!
//! While a session is live, frames are written straight to its `FrameWriter`.
//! While reconnecting they are buffered in memory up to `reconnect_buffer_size`
//! bytes, and flushed in order once the next session is up, right after the
//! subscription interest has been re-registered. After close every write fails.
//!
//! The state sits behind an async mutex held across the write, which keeps frames
//! from concurrent publishers in one total order and lets `resume` flush the
//! buffer before any new frame can slip ahead of it.

use std::collections::VecDeque;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    error::ClientError,
    transport::{Frame, FrameWriter},
};

enum State {
    Live(Box<dyn FrameWriter>),
    Buffering { frames: VecDeque<Frame>, bytes: usize },
    Closed,
}

impl State {
    fn buffering() -> Self {
        State::Buffering {
            frames: VecDeque::new(),
            bytes: 0,
        }
    }
}

/// What happened to a frame handed to `Outbound::send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Written,
    Buffered,
    /// The live writer failed. The frame was buffered and the session must be
    /// treated as lost.
    Broken,
}

pub(crate) struct Outbound {
    state: Mutex<State>,
    limit: usize,
}

impl Outbound {
    /// Starts out buffering, before the first session exists.
    pub(crate) fn new(limit: usize) -> Self {
        Outbound {
            state: Mutex::new(State::buffering()),
            limit,
        }
    }

    pub(crate) async fn send(&self, frame: Frame) -> Result<SendOutcome, ClientError> {
        let mut state = self.state.lock().await;
        match &mut *state {
            State::Closed => Err(ClientError::ConnectionClosed),
            State::Buffering { frames, bytes } => {
                let size = frame.size();
                if *bytes + size > self.limit {
                    return Err(ClientError::ReconnectBufferExceeded);
                }
                *bytes += size;
                frames.push_back(frame);
                Ok(SendOutcome::Buffered)
            }
            State::Live(writer) => match writer.write(frame.clone()).await {
                Ok(()) => Ok(SendOutcome::Written),
                Err(e) => {
                    warn!("Write failed, buffering until reconnected: {e}");
                    let mut broken = std::mem::replace(&mut *state, State::buffering());
                    if let State::Live(writer) = &mut broken {
                        writer.close().await;
                    }
                    if let State::Buffering { frames, bytes } = &mut *state {
                        *bytes += frame.size();
                        frames.push_back(frame);
                    }
                    Ok(SendOutcome::Broken)
                }
            },
        }
    }

    /// Switches to buffering and returns the previous writer, if any.
    pub(crate) async fn suspend(&self) -> Option<Box<dyn FrameWriter>> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Live(_) => match std::mem::replace(&mut *state, State::buffering()) {
                State::Live(writer) => Some(writer),
                _ => None,
            },
            _ => None,
        }
    }

    /// Installs a new writer after writing `preamble` and then every buffered frame.
    ///
    /// On failure the buffered frames that were not written stay buffered and the
    /// writer is returned to the caller inside the error path (closed).
    pub(crate) async fn resume(
        &self,
        mut writer: Box<dyn FrameWriter>,
        preamble: Vec<Frame>,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;

        let (frames, bytes) = match &mut *state {
            State::Closed => {
                writer.close().await;
                return Err(ClientError::ConnectionClosed);
            }
            State::Live(_) => {
                // Cannot happen: resume is only called by the reconnection engine.
                writer.close().await;
                return Err(ClientError::InvalidOperation(
                    "session already live".into(),
                ));
            }
            State::Buffering { frames, bytes } => (frames, bytes),
        };

        for frame in preamble {
            if let Err(e) = writer.write(frame).await {
                writer.close().await;
                return Err(e.into());
            }
        }

        let flushed = frames.len();
        while let Some(frame) = frames.front() {
            let size = frame.size();
            if let Err(e) = writer.write(frame.clone()).await {
                writer.close().await;
                return Err(e.into());
            }
            frames.pop_front();
            *bytes = bytes.saturating_sub(size);
        }

        if flushed > 0 {
            debug!("Flushed {flushed} buffered frames");
        }

        *state = State::Live(writer);
        Ok(())
    }

    /// Permanently closes the write path, dropping buffered frames.
    ///
    /// Returns the live writer so the caller can close the session.
    pub(crate) async fn close(&self) -> Option<Box<dyn FrameWriter>> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Closed) {
            State::Live(writer) => Some(writer),
            _ => None,
        }
    }

    /// Bytes currently buffered.
    pub(crate) async fn buffered(&self) -> usize {
        match &*self.state.lock().await {
            State::Buffering { bytes, .. } => *bytes,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::transport::TransportError;

    #[derive(Clone, Default)]
    struct RecordingWriter {
        written: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl FrameWriter for RecordingWriter {
        async fn write(&mut self, frame: Frame) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::ConnectionReset);
            }
            let label = match frame {
                Frame::Pub { subject, .. } => subject,
                Frame::Sub { sid, .. } => format!("sub-{sid}"),
                other => format!("{other:?}"),
            };
            self.written.lock().unwrap().push(label);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn publish(subject: &str) -> Frame {
        Frame::Pub {
            subject: subject.into(),
            reply_to: None,
            headers: None,
            payload: Bytes::from_static(b"0123456789"),
        }
    }

    #[tokio::test]
    async fn test_buffer_then_flush_in_order() {
        let outbound = Outbound::new(1024);
        assert_eq!(
            outbound.send(publish("a")).await.unwrap(),
            SendOutcome::Buffered
        );
        outbound.send(publish("b")).await.unwrap();

        let writer = RecordingWriter::default();
        let written = writer.written.clone();
        let preamble = vec![Frame::Sub {
            sid: 1,
            subject: "x".into(),
            queue_group: None,
            consumer: None,
        }];
        outbound.resume(Box::new(writer), preamble).await.unwrap();
        assert_eq!(outbound.buffered().await, 0);

        outbound.send(publish("c")).await.unwrap();
        assert_eq!(*written.lock().unwrap(), vec!["sub-1", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_buffer_limit() {
        let outbound = Outbound::new(60);
        outbound.send(publish("a")).await.unwrap();
        outbound.send(publish("b")).await.unwrap();
        let result = outbound.send(publish("c")).await;
        assert!(matches!(result, Err(ClientError::ReconnectBufferExceeded)));
    }

    #[tokio::test]
    async fn test_broken_writer_buffers_frame() {
        let outbound = Outbound::new(1024);
        outbound
            .resume(
                Box::new(RecordingWriter {
                    fail: true,
                    ..Default::default()
                }),
                vec![],
            )
            .await
            .unwrap();

        let outcome = outbound.send(publish("a")).await.unwrap();
        assert_eq!(outcome, SendOutcome::Broken);
        assert!(outbound.buffered().await > 0);
    }

    #[tokio::test]
    async fn test_closed_rejects_writes() {
        let outbound = Outbound::new(1024);
        assert!(outbound.close().await.is_none());
        let result = outbound.send(publish("a")).await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    }
}
