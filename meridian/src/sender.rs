//! # Summary
//!
//! This module implements the central hub for message delivery. A `Sender`
//! routes an envelope to a local component over its inproc channel when the
//! destination is this machine, and otherwise serializes it once and pushes
//! it on a lazily-established `(machine, port)` connection. Each remote
//! connection is owned by a single writer task; frames are FIFO per
//! connection and carry `[machine_id][channel][envelope]` with little-endian
//! headers.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use parking_lot::RwLock;
use std::collections::HashMap as Map;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use crate::config::Config;
use crate::internal;
use crate::message::{ApiResponse, Channel, Envelope, MachineId};

/// Byte length of the `[machine_id][channel]` frame header.
pub const FRAME_HEADER: usize = 8;

/// Thread-safe handle on this machine's delivery state. Cheap to clone;
/// every component and listener task holds one.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<Inner>,
}

struct Inner {
    id: MachineId,
    config: Arc<Config>,

    /// Inproc channel registry, fixed after machine startup.
    local: RwLock<Map<Channel, internal::Tx<Envelope>>>,

    /// Lazily-established remote push connections.
    remote: RwLock<Map<(MachineId, u16), internal::Tx<Bytes>>>,

    /// Reply channels of connected clients.
    clients: RwLock<Map<u64, internal::Tx<ApiResponse>>>,
}

impl Sender {
    pub fn new(id: MachineId, config: Arc<Config>) -> Self {
        Sender {
            inner: Arc::new(Inner {
                id,
                config,
                local: RwLock::new(Map::new()),
                remote: RwLock::new(Map::new()),
                clients: RwLock::new(Map::new()),
            }),
        }
    }

    pub fn id(&self) -> MachineId {
        self.inner.id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    /// Registers the receiving end of a local channel with this hub.
    pub fn register(&self, channel: Channel, tx: internal::Tx<Envelope>) {
        self.inner.local.write().insert(channel, tx);
    }

    /// Registers the provided client reply channel with this hub.
    pub fn connect_client(&self, id: u64, tx: internal::Tx<ApiResponse>) {
        self.inner.clients.write().insert(id, tx);
    }

    /// Disconnects the provided client from this hub.
    pub fn disconnect_client(&self, id: u64) {
        self.inner.clients.write().remove(&id);
    }

    /// Forwards a response to an external client.
    pub fn send_client(&self, id: u64, response: ApiResponse) {
        if let Some(tx) = self.inner.clients.read().get(&id) {
            tx.try_send(response);
        }
    }

    /// Delivers an envelope to a local channel.
    pub fn deliver(&self, channel: Channel, envelope: Envelope) {
        match self.inner.local.read().get(&channel) {
        | Some(tx) => tx.try_send(envelope),
        | None => warn!("no local receiver for channel {}", channel),
        }
    }

    /// Sends an envelope to one machine's channel, routing inproc when the
    /// destination is this machine.
    pub fn send(&self, envelope: Envelope, to: MachineId, channel: Channel) {
        if to == self.inner.id {
            self.deliver(channel, envelope);
        } else {
            let frame = self.frame(channel, &envelope);
            // Fire-and-forget: a dead connection drops silently.
            self.remote_tx(to, channel).try_send(frame);
        }
    }

    /// Sends an envelope to this machine's own channel.
    pub fn send_local(&self, envelope: Envelope, channel: Channel) {
        self.deliver(channel, envelope);
    }

    /// Fans an envelope out to a list of machines, serializing exactly once.
    /// A local copy is delivered inproc when this machine is a destination.
    pub fn send_many(&self, envelope: Envelope, to: &[MachineId], channel: Channel) {
        let mut send_local = false;
        let mut frame: Option<Bytes> = None;
        for dest in to {
            if *dest == self.inner.id {
                send_local = true;
                continue;
            }
            let frame = frame
                .get_or_insert_with(|| self.frame(channel, &envelope))
                .clone();
            self.remote_tx(*dest, channel).try_send(frame);
        }
        if send_local {
            self.deliver(channel, envelope);
        }
    }

    /// Parses a received frame and delivers its envelope. Malformed frames
    /// are dropped with a warning.
    pub fn dispatch_frame(&self, frame: &[u8]) {
        if frame.len() < FRAME_HEADER {
            warn!("dropping short frame of {} bytes", frame.len());
            return;
        }
        let channel = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        match bincode::deserialize::<Envelope>(&frame[FRAME_HEADER..]) {
        | Ok(envelope) => self.deliver(channel, envelope),
        | Err(error) => warn!("dropping undecodable envelope: {}", error),
        }
    }

    fn frame(&self, channel: Channel, envelope: &Envelope) -> Bytes {
        let body = bincode::serialize(envelope).expect("[INTERNAL ERROR]: unserializable envelope");
        let mut frame = BytesMut::with_capacity(FRAME_HEADER + body.len());
        frame.put_u32_le(self.inner.id.0);
        frame.put_u32_le(channel);
        frame.put_slice(&body);
        frame.freeze()
    }

    /// Returns the write handle for `(machine, port-of-channel)`, lazily
    /// spawning the owning connection task on first use.
    fn remote_tx(&self, to: MachineId, channel: Channel) -> internal::Tx<Bytes> {
        let port = self.inner.config.port(to, channel);
        if let Some(tx) = self.inner.remote.read().get(&(to, port)) {
            return tx.clone();
        }
        let mut remote = self.inner.remote.write();
        if let Some(tx) = remote.get(&(to, port)) {
            return tx.clone();
        }
        let (rx, tx) = internal::new();
        let address = format!("{}:{}", self.inner.config.address_of(to), port);
        tokio::spawn(connection(address, rx));
        remote.insert((to, port), tx.clone());
        tx
    }
}

/// Owns one outbound connection: connects (retrying while the peer is still
/// starting), then streams frames in FIFO order forever.
async fn connection(address: String, mut rx: internal::Rx<Bytes>) {
    let stream = loop {
        match tokio::net::TcpStream::connect(address.as_str()).await {
        | Ok(stream) => break stream,
        | Err(error) => {
            debug!("connect to {} failed ({}), retrying", address, error);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        }
    };
    stream.set_nodelay(true).ok();
    info!("connected to {}", address);
    let mut framed = FramedWrite::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = rx.recv().await {
        if let Err(error) = framed.send(frame).await {
            warn!("send to {} failed: {}", address, error);
            return;
        }
    }
}
