//! In-memory connection for exercising actors without sockets.

use futures::channel::mpsc;
use futures::{Sink, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{timeout, Duration};

use crate::actor::Frame;
use crate::protocol::Message;

pub type TestReader = mpsc::UnboundedReceiver<Result<Frame, io::Error>>;
pub type TestWriter = mpsc::UnboundedSender<Frame>;

/// The client's end of an in-memory connection.
pub struct TestConnection {
    inbound: mpsc::UnboundedSender<Result<Frame, io::Error>>,
    outbound: Option<mpsc::UnboundedReceiver<Frame>>,
}

impl TestConnection {
    /// Returns the client end plus the reader/writer halves for the actor.
    pub fn new() -> (Self, TestReader, TestWriter) {
        let (inbound, reader) = mpsc::unbounded();
        let (writer, outbound) = mpsc::unbounded();
        (
            Self {
                inbound,
                outbound: Some(outbound),
            },
            reader,
            writer,
        )
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.inbound.unbounded_send(Ok(Frame::Text(text.to_owned())));
    }

    pub fn push_error(&self, reason: &str) {
        let _ = self.inbound.unbounded_send(Err(io::Error::other(reason.to_owned())));
    }

    /// End the inbound stream, as if the peer went away.
    pub fn hang_up(self) {
        drop(self);
    }

    /// Stop accepting writes so the actor's next write fails.
    pub fn drop_outbound(&mut self) {
        self.outbound = None;
    }

    /// Next frame written by the actor, or `None` on timeout/close.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let outbound = self.outbound.as_mut()?;
        timeout(Duration::from_secs(1), outbound.next()).await.ok().flatten()
    }

    /// Next frame written by the actor, decoded as a status message.
    pub async fn next_message(&mut self) -> Option<Message> {
        match self.next_frame().await? {
            Frame::Text(text) => Message::decode(&text).ok(),
            _ => None,
        }
    }

    /// Collect every message written until the actor goes quiet.
    pub async fn drain_messages(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        let Some(outbound) = self.outbound.as_mut() else {
            return messages;
        };
        while let Ok(Some(frame)) = timeout(Duration::from_millis(100), outbound.next()).await {
            if let Frame::Text(text) = frame {
                if let Ok(msg) = Message::decode(&text) {
                    messages.push(msg);
                }
            }
        }
        messages
    }
}

/// A sink whose peer never reads: every write stays pending forever.
pub struct StalledWriter;

impl Sink<Frame> for StalledWriter {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<(), Self::Error> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }
}
