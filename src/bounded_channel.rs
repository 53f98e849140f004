// SPDX-License-Identifier: Apache-2.0

//! Bounded handoff channels used between harvesters, the publisher pipeline
//! and the prospector. Every channel in the agent is bounded so a slow
//! consumer stalls its producers instead of growing memory.

use flume::{Receiver, Sender, TrySendError as FlumeTrySendError};
use std::fmt;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

/// Error from a non-blocking send. The rejected item is handed back so the
/// caller can retry or fall back to a blocking send.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(item) | TrySendError::Disconnected(item) => item,
        }
    }
}

impl<T> BoundedSender<T> {
    /// Waits for capacity, then sends.
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        self.tx
            .send_async(item)
            .await
            .map_err(|_| SendError::Disconnected)
    }

    /// Blocking send for code running on the blocking pool.
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        self.tx.send(item).map_err(|_| SendError::Disconnected)
    }

    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(item).map_err(|e| match e {
            FlumeTrySendError::Full(item) => TrySendError::Full(item),
            FlumeTrySendError::Disconnected(item) => TrySendError::Disconnected(item),
        })
    }

    pub fn is_disconnected(&self) -> bool {
        self.tx.is_disconnected()
    }

    /// Returns true when both ends refer to the same channel.
    pub fn same_channel(&self, other: &BoundedSender<T>) -> bool {
        self.tx.same_channel(&other.tx)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for BoundedSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedSender")
            .field("len", &self.tx.len())
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Returns `None` once every sender has been dropped and the channel is empty.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking receive. `None` when empty or disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);
    (BoundedSender { tx }, BoundedReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::{SendError, TrySendError, bounded};
    use tokio_test::{assert_ok, assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn basics() {
        let (tx, mut rx) = bounded(3);

        let mut send1 = spawn(async { tx.send(10).await });
        let mut recv1 = spawn(async { rx.next().await });

        assert_pending!(recv1.poll());
        assert_ok!(assert_ready!(send1.poll()));
        assert!(recv1.is_woken());
        assert_eq!(Some(10), assert_ready!(recv1.poll()));

        drop(send1);
        drop(recv1);

        let mut recv2 = spawn(async { rx.next().await });
        drop(tx);
        assert_eq!(None, assert_ready!(recv2.poll()));
    }

    #[tokio::test]
    async fn sender_blocks_on_full() {
        let (tx, mut rx) = bounded(1);

        let mut send1 = spawn(async { tx.send(1).await });
        assert_ok!(assert_ready!(send1.poll()));
        drop(send1);

        let mut send2 = spawn(async { tx.send(2).await });
        assert_pending!(send2.poll());

        let mut recv1 = spawn(async { rx.next().await });
        assert_eq!(Some(1), assert_ready!(recv1.poll()));
        drop(recv1);

        assert_ok!(assert_ready!(send2.poll()));
    }

    #[test]
    fn try_send_hands_back_item_when_full() {
        let (tx, rx) = bounded(1);

        assert!(tx.try_send("first").is_ok());
        assert_eq!(tx.try_send("second"), Err(TrySendError::Full("second")));
        assert_eq!(rx.try_recv(), Some("first"));
        assert!(tx.try_send("third").is_ok());

        drop(rx);
        let err = tx.try_send("fourth").unwrap_err();
        assert!(matches!(err, TrySendError::Disconnected(_)));
        assert_eq!(err.into_inner(), "fourth");
    }

    #[tokio::test]
    async fn sender_fails_on_rx_close() {
        let (tx, rx) = bounded(1);

        let mut send1 = spawn(async { tx.send(10).await });
        drop(rx);
        assert_eq!(Err(SendError::Disconnected), assert_ready!(send1.poll()));
        assert!(tx.is_disconnected());
    }
}
