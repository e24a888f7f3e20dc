//! # Summary
//!
//! This module wires one machine of the grid: it creates the inproc channel
//! per component, binds the envelope listeners and the client port, builds
//! every component with its receiving end and a `Sender` handle, and spawns
//! each one on its own task. Components never see each other — only the
//! bus.

use std::sync::Arc;

use crate::config::{Config, ExecutionType, MetadataInitializerType};
use crate::execution::{Execution, KeyValueExecution, MovrExecution};
use crate::internal;
use crate::message::{self, ApiRequest, Envelope, MachineId, Request};
use crate::module::clock::{ClockSynchronizer, SkewTable};
use crate::module::{forwarder, orderer, scheduler, sequencer, server, worker};
use crate::paxos::Paxos;
use crate::sender::Sender;
use crate::socket;
use crate::storage::{MemStorage, MetadataInitializer, MovrInitializer, Storage};

/// A running machine's externally useful pieces. Tests preload fixtures
/// through `storage`; the binaries only hold onto it to keep the tasks
/// alive.
pub struct MachineHandle {
    pub id: MachineId,
    pub config: Arc<Config>,
    pub sender: Sender,
    pub storage: Arc<MemStorage>,
    pub skew: Arc<SkewTable>,
}

/// Bring up every component of machine `id` and return once all listeners
/// are bound. Startup failures (bad ports, double binds) terminate the
/// process.
pub async fn start(config: Arc<Config>, id: MachineId) -> MachineHandle {
    assert_eq!(config.protocol, "tcp", "[STARTUP ERROR]: unsupported protocol");
    let sender = Sender::new(id, config.clone());
    let storage = Arc::new(MemStorage::new());
    let skew = Arc::new(SkewTable::new());

    let (server_rx, server_tx) = internal::new();
    let (forwarder_rx, forwarder_tx) = internal::new();
    let (sequencer_rx, sequencer_tx) = internal::new();
    let (orderer_rx, orderer_tx) = internal::new();
    let (scheduler_rx, scheduler_tx) = internal::new();
    let (worker_rx, worker_tx) = internal::new();
    let (log_paxos_rx, log_paxos_tx) = internal::new();
    let (remaster_paxos_rx, remaster_paxos_tx) = internal::new();
    let (clock_rx, clock_tx) = internal::new();

    sender.register(message::SERVER, server_tx);
    sender.register(message::FORWARDER, forwarder_tx);
    sender.register(message::SEQUENCER, sequencer_tx);
    sender.register(message::MULTI_HOME_ORDERER, orderer_tx);
    sender.register(message::SCHEDULER, scheduler_tx);
    sender.register(message::WORKER, worker_tx);
    sender.register(message::SEQUENCER_PAXOS, log_paxos_tx);
    sender.register(message::REMASTER_PAXOS, remaster_paxos_tx);
    sender.register(message::CLOCK_SYNCHRONIZER, clock_tx);

    // Envelope listeners, one per distinct port of this machine.
    for port in config.listen_ports(id) {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .expect("[STARTUP ERROR]: failed to bind envelope port");
        let sender = sender.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                | Ok(accepted) => accepted,
                | Err(error) => {
                    warn!("accept failed on port {}: {}", port, error);
                    continue;
                }
                };
                stream.set_nodelay(true).ok();
                let sender = sender.clone();
                tokio::spawn(async move {
                    use futures::StreamExt;
                    let mut frames = tokio_util::codec::FramedRead::new(
                        stream,
                        tokio_util::codec::LengthDelimitedCodec::new(),
                    );
                    while let Some(Ok(frame)) = frames.next().await {
                        sender.dispatch_frame(&frame);
                    }
                });
            }
        });
    }

    // Client listener.
    let client_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.client_port_of(id)))
        .await
        .expect("[STARTUP ERROR]: failed to bind client port");
    {
        let sender = sender.clone();
        tokio::spawn(async move {
            let mut next_client = 1u64;
            loop {
                let (stream, _) = match client_listener.accept().await {
                | Ok(accepted) => accepted,
                | Err(error) => {
                    warn!("client accept failed: {}", error);
                    continue;
                }
                };
                let client = next_client;
                next_client += 1;
                tokio::spawn(connection(sender.clone(), stream, client));
            }
        });
    }

    let initializer: Option<Box<dyn MetadataInitializer>> = match config.metadata_initializer {
    | MetadataInitializerType::Simple => None,
    | MetadataInitializerType::Movr => {
        Some(Box::new(MovrInitializer::new(config.num_regions, config.num_partitions)))
    }
    };
    let execution: Box<dyn Execution> = match config.execution {
    | ExecutionType::KeyValue => Box::new(KeyValueExecution::new()),
    | ExecutionType::Movr => Box::new(MovrExecution::new()),
    };

    tokio::spawn(server::Server::new(server_rx, sender.clone()));
    tokio::spawn(forwarder::Forwarder::new(forwarder_rx, sender.clone(), initializer));
    tokio::spawn(sequencer::Sequencer::new(sequencer_rx, sender.clone(), skew.clone()));
    tokio::spawn(orderer::Orderer::new(orderer_rx, sender.clone()));
    tokio::spawn(scheduler::Scheduler::new(scheduler_rx, sender.clone()));
    tokio::spawn(worker::Worker::new(
        worker_rx,
        sender.clone(),
        storage.clone() as Arc<dyn Storage>,
        execution,
    ));
    tokio::spawn(Paxos::new(
        message::SEQUENCER_PAXOS,
        log_paxos_rx,
        sender.clone(),
        config.log_members(),
        vec![message::MULTI_HOME_ORDERER, message::SEQUENCER],
    ));
    tokio::spawn(Paxos::new(
        message::REMASTER_PAXOS,
        remaster_paxos_rx,
        sender.clone(),
        config.remaster_members(),
        vec![message::SCHEDULER],
    ));
    tokio::spawn(ClockSynchronizer::new(clock_rx, sender.clone(), skew.clone()));

    info!("machine {} up", id);
    MachineHandle { id, config, sender, storage, skew }
}

/// One client connection: requests become local envelopes for the server
/// module; its replies stream back over the registered channel.
async fn connection(sender: Sender, stream: tokio::net::TcpStream, client: u64) {
    let id = sender.id();
    let (mut rx, mut tx) = socket::split::<ApiRequest, message::ApiResponse>(stream);
    let (mut reply_rx, reply_tx) = internal::new();
    sender.connect_client(client, reply_tx);
    info!("client {} connected", client);

    loop {
        tokio::select! {
            request = rx.recv() => {
                let request = match request {
                | Some(request) => request,
                | None => break,
                };
                let wrapped = match request {
                | ApiRequest::Txn { txn } => Request::ClientTxn { client, txn },
                | ApiRequest::Stats { module, level } => Request::ClientStats { client, module, level },
                | ApiRequest::Metrics { prefix } => Request::ClientMetrics { client, prefix },
                };
                sender.send_local(Envelope::request(id, wrapped), message::SERVER);
            }
            reply = reply_rx.recv() => {
                let reply = match reply {
                | Some(reply) => reply,
                | None => break,
                };
                if tx.send(&reply).await.is_err() {
                    break;
                }
            }
        }
    }
    sender.disconnect_client(client);
    info!("client {} disconnected", client);
}
