//! Bridge between the producer and consumer servers
//!
//! Three bounded channels and a done signal. Tag events and status updates
//! are droppable: a slow consumer never back-pressures reader polling.
//! Write requests block, and each carries its own single-slot reply channel
//! so a response can never land on the wrong waiter.

use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::protocol::WriteRecord;
use crate::tag::{DeviceStatus, NfcData};

/// Buffer depth of the three data channels.
pub const CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("bridge is closed")]
    Closed,
}

/// Outcome of a write, delivered on the request's reply channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl WriteOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// A write crossing the bridge exactly once, consumer → producer.
#[derive(Debug)]
pub struct WriteRequestMessage {
    pub request_id: Option<String>,
    pub client_id: Uuid,
    pub records: Vec<WriteRecord>,
    pub reply: oneshot::Sender<WriteOutcome>,
}

pub struct Bridge {
    tag_tx: Mutex<Option<mpsc::Sender<NfcData>>>,
    status_tx: Mutex<Option<mpsc::Sender<DeviceStatus>>>,
    write_tx: Mutex<Option<mpsc::Sender<WriteRequestMessage>>>,
    tag_rx: Mutex<Option<mpsc::Receiver<NfcData>>>,
    status_rx: Mutex<Option<mpsc::Receiver<DeviceStatus>>>,
    write_rx: Mutex<Option<mpsc::Receiver<WriteRequestMessage>>>,
    done: watch::Sender<bool>,
}

impl Bridge {
    pub fn new() -> Self {
        let (tag_tx, tag_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (done, _) = watch::channel(false);
        Self {
            tag_tx: Mutex::new(Some(tag_tx)),
            status_tx: Mutex::new(Some(status_tx)),
            write_tx: Mutex::new(Some(write_tx)),
            tag_rx: Mutex::new(Some(tag_rx)),
            status_rx: Mutex::new(Some(status_rx)),
            write_rx: Mutex::new(Some(write_rx)),
            done,
        }
    }

    /// Watch that flips to `true` when the bridge closes.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.done.borrow()
    }

    /// Non-blocking send of a tag event. Returns `false` when the bridge is
    /// closed or the channel is full — tag events are droppable.
    pub fn send_tag_data(&self, data: NfcData) -> bool {
        let guard = self.tag_tx.lock().expect("bridge lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.try_send(data).is_ok(),
            None => false,
        }
    }

    /// Non-blocking send of a reader status delta. Same drop semantics as
    /// [`Bridge::send_tag_data`].
    pub fn send_device_status(&self, status: DeviceStatus) -> bool {
        let guard = self.status_tx.lock().expect("bridge lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.try_send(status).is_ok(),
            None => false,
        }
    }

    /// Queue a write request and wait for the producer's reply. Blocks until
    /// the reply arrives or the bridge closes.
    pub async fn send_write_request(
        &self,
        request_id: Option<String>,
        client_id: Uuid,
        records: Vec<WriteRecord>,
    ) -> Result<WriteOutcome, BridgeError> {
        let tx = {
            let guard = self.write_tx.lock().expect("bridge lock poisoned");
            guard.as_ref().cloned().ok_or(BridgeError::Closed)?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = WriteRequestMessage {
            request_id,
            client_id,
            records,
            reply: reply_tx,
        };

        let mut done = self.done.subscribe();
        tokio::select! {
            sent = tx.send(msg) => {
                if sent.is_err() {
                    return Err(BridgeError::Closed);
                }
            }
            _ = done.wait_for(|closed| *closed) => return Err(BridgeError::Closed),
        }

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| BridgeError::Closed),
            _ = done.wait_for(|closed| *closed) => Err(BridgeError::Closed),
        }
    }

    /// Hand out the consumer-side tag event receiver. Each receiver can be
    /// taken once per bridge.
    pub fn take_tag_rx(&self) -> Option<mpsc::Receiver<NfcData>> {
        self.tag_rx.lock().expect("bridge lock poisoned").take()
    }

    pub fn take_status_rx(&self) -> Option<mpsc::Receiver<DeviceStatus>> {
        self.status_rx.lock().expect("bridge lock poisoned").take()
    }

    pub fn take_write_rx(&self) -> Option<mpsc::Receiver<WriteRequestMessage>> {
        self.write_rx.lock().expect("bridge lock poisoned").take()
    }

    /// Close the done signal, then the three data channels. Idempotent;
    /// sends after close are dropped, receivers observe channel close.
    pub fn close(&self) {
        self.done.send_replace(true);
        self.tag_tx.lock().expect("bridge lock poisoned").take();
        self.status_tx.lock().expect("bridge lock poisoned").take();
        self.write_tx.lock().expect("bridge lock poisoned").take();
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{Card, Tag};

    fn sample_event() -> NfcData {
        let tag = Tag::injected("04:AB:CD:EF".into(), "NTAG215".into(), "ISO14443A".into());
        NfcData::card(Card::new(tag))
    }

    #[tokio::test]
    async fn tag_data_drops_when_full() {
        let bridge = Bridge::new();
        for _ in 0..CHANNEL_CAPACITY {
            assert!(bridge.send_tag_data(sample_event()));
        }
        assert!(!bridge.send_tag_data(sample_event()), "11th send must drop");

        let mut rx = bridge.take_tag_rx().unwrap();
        rx.recv().await.unwrap();
        assert!(bridge.send_tag_data(sample_event()), "capacity freed");
    }

    #[tokio::test]
    async fn sends_after_close_are_dropped() {
        let bridge = Bridge::new();
        let mut rx = bridge.take_tag_rx().unwrap();
        bridge.close();
        assert!(!bridge.send_tag_data(sample_event()));
        assert!(!bridge.send_device_status(DeviceStatus::connected("x")));
        assert!(rx.recv().await.is_none(), "receiver observes close");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let bridge = Bridge::new();
        bridge.close();
        bridge.close();
        assert!(bridge.is_closed());
    }

    #[tokio::test]
    async fn write_reply_reaches_the_right_waiter() {
        let bridge = std::sync::Arc::new(Bridge::new());
        let mut write_rx = bridge.take_write_rx().unwrap();

        tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                let outcome = match msg.request_id.as_deref() {
                    Some("a") => WriteOutcome::ok(),
                    _ => WriteOutcome::failed("nope"),
                };
                let _ = msg.reply.send(outcome);
            }
        });

        let a = bridge.send_write_request(Some("a".into()), Uuid::new_v4(), vec![]);
        let b = bridge.send_write_request(Some("b".into()), Uuid::new_v4(), vec![]);
        let (a, b) = tokio::join!(a, b);
        assert!(a.unwrap().success);
        assert!(!b.unwrap().success);
    }

    #[tokio::test]
    async fn write_request_unblocks_on_close() {
        let bridge = std::sync::Arc::new(Bridge::new());
        // Nobody drains the write queue; the request must still return once
        // the bridge closes.
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .send_write_request(None, Uuid::new_v4(), vec![])
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bridge.close();
        assert_eq!(waiter.await.unwrap(), Err(BridgeError::Closed));
    }

    #[tokio::test]
    async fn write_request_after_close_errors() {
        let bridge = Bridge::new();
        bridge.close();
        let res = bridge.send_write_request(None, Uuid::new_v4(), vec![]).await;
        assert_eq!(res, Err(BridgeError::Closed));
    }
}
