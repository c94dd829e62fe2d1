//! Bounded message channels used as actor mailboxes, and one-shot
//! reply slots resolving individual calls.

use futures::channel::mpsc;
use futures::sink::SinkExt;
use futures::stream::StreamExt;

use crate::diode::error::*;

/// The sending half of an actor mailbox.
pub struct MessageChannelTx<M> {
    inner: mpsc::Sender<M>,
}

/// The receiving half of an actor mailbox.
pub struct MessageChannelRx<M> {
    inner: mpsc::Receiver<M>,
}

/// Creates a new bounded mailbox pair.
pub fn new_message_channel<M>(bound: usize) -> (MessageChannelTx<M>, MessageChannelRx<M>) {
    let (tx, rx) = mpsc::channel(bound);
    (MessageChannelTx { inner: tx }, MessageChannelRx { inner: rx })
}

impl<M> Clone for MessageChannelTx<M> {
    fn clone(&self) -> Self {
        let inner = self.inner.clone();
        Self { inner }
    }
}

impl<M> MessageChannelTx<M> {
    /// Queues a message, waiting for mailbox capacity.
    pub async fn send(&mut self, message: M) -> Result<()> {
        self.inner
            .send(message)
            .await
            .simple(ErrorKind::ClientClosed)
    }

    /// Queues a message without waiting; fails with `BackpressureFull`
    /// when the mailbox is at capacity.
    pub fn try_send(&mut self, message: M) -> Result<()> {
        self.inner.try_send(message).map_err(|e| {
            if e.is_full() {
                Error::simple(ErrorKind::BackpressureFull)
            } else {
                Error::simple(ErrorKind::ClientClosed)
            }
        })
    }
}

impl<M> MessageChannelRx<M> {
    /// Pops the next message, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.inner.next().await
    }
}

/// The resolving side of a reply slot.
pub struct ReplyTx<T> {
    inner: oneshot::Sender<T>,
}

/// The awaiting side of a reply slot.
pub struct ReplyRx<T> {
    inner: oneshot::Receiver<T>,
}

/// Creates a new one-shot reply slot.
///
/// Dropping the `ReplyTx` closes the slot, which the awaiting side
/// observes as a cancellation.
pub fn new_reply_channel<T>() -> (ReplyTx<T>, ReplyRx<T>) {
    let (tx, rx) = oneshot::channel();
    (ReplyTx { inner: tx }, ReplyRx { inner: rx })
}

impl<T> ReplyTx<T> {
    /// Resolves the slot; a missing receiver means the caller is
    /// gone, which is not an error for the resolver.
    pub fn send(self, value: T) {
        let _ = self.inner.send(value);
    }
}

impl<T> ReplyRx<T> {
    /// Awaits the reply; a dropped resolver yields the given host's
    /// cancellation error.
    pub async fn recv(self, host: &str) -> Result<T> {
        self.inner
            .await
            .simple(ErrorKind::Cancelled(host.into()))
    }
}
