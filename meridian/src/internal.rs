//! # Summary
//!
//! This module abstracts over internal connections to other threads.
//!
//! Currently backed by `tokio::sync::mpsc` unbounded channels. Since the
//! channels are unbounded, the only way for a send to fail is if the
//! receiving end has been dropped, which should be impossible unless there's
//! some logic error in the implementation. This is why the `send` method on
//! `Tx` calls `expect` internally.

use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

/// Intra-machine receiving channel.
#[derive(Debug)]
pub struct Rx<T>(mpsc::UnboundedReceiver<T>);

/// Intra-machine transmission channel. All clones send to the same
/// receiving end.
#[derive(Debug)]
pub struct Tx<T>(mpsc::UnboundedSender<T>);

impl<T> Clone for Tx<T> {
    fn clone(&self) -> Self {
        Tx(self.0.clone())
    }
}

/// Create a new pair of linked receiving and transmitting channels.
pub fn new<T>() -> (Rx<T>, Tx<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Rx(rx), Tx(tx))
}

impl<T> Tx<T> {
    /// Force a message through the channel.
    /// Panics if the receiving end has been dropped.
    pub fn send(&self, message: T) {
        self.0.send(message).ok().expect("[INTERNAL ERROR]: receiver dropped");
    }

    /// Attempt to send a message through the channel.
    /// Does nothing if the receiving end has been dropped.
    pub fn try_send(&self, message: T) {
        self.0.send(message).ok();
    }
}

impl<T> Rx<T> {
    #[inline]
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.0.poll_recv(cx)
    }

    /// Receive outside of a poll loop. Used by edge tasks, never by
    /// component handlers.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }
}

impl<T> Stream for Rx<T> {
    type Item = T;

    #[inline]
    fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.0.poll_recv(cx)
    }
}
