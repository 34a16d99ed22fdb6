//! Dedicated broker worker
//!
//! The broker client is not safe to drive from several tasks at once, so each
//! connection owns one worker task that holds the transport and executes
//! commands strictly one at a time. Pipelines and lifecycle code only ever
//! send commands and await the reply slot.

use crate::transport::{
    BrokerError, BrokerTransport, ConnectionParams, InboundMessage, QueueOptions,
    TransportEvent, TransportFactory,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, BrokerError>>;

/// Work items executed on the broker worker
pub enum BrokerCommand {
    Open {
        params: ConnectionParams,
        events: mpsc::Sender<TransportEvent>,
        reply: Reply<()>,
    },
    /// Prefetch plus queue declarations, as one unit
    Prepare {
        prefetch: u16,
        queues: Vec<(String, QueueOptions)>,
        reply: Reply<()>,
    },
    Consume {
        queue: String,
        consumer_tag: String,
        deliveries: mpsc::Sender<InboundMessage>,
        reply: Reply<()>,
    },
    Ack {
        delivery_tag: u64,
        reply: Reply<()>,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
        reply: Reply<()>,
    },
    Publish {
        queue: String,
        payload: Vec<u8>,
        reply: Reply<()>,
    },
    QueueDepth {
        queue: String,
        reply: Reply<u32>,
    },
    Cancel {
        consumer_tag: String,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    Shutdown,
}

/// Handle to a connection's single broker worker task
pub struct BrokerWorker {
    name: String,
    commands: mpsc::Sender<BrokerCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerWorker {
    /// Start the worker task; transports are created from `factory` on every open
    pub fn spawn(name: impl Into<String>, factory: Arc<dyn TransportFactory>) -> Self {
        let name = name.into();
        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            run_worker(task_name, factory, receiver).await;
        });
        debug!(worker = %name, "Broker worker started");
        Self {
            name,
            commands,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> BrokerCommand,
    ) -> Result<T, BrokerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| BrokerError::WorkerUnavailable)?;
        response.await.map_err(|_| BrokerError::WorkerUnavailable)?
    }

    pub async fn open(
        &self,
        params: ConnectionParams,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), BrokerError> {
        self.request(|reply| BrokerCommand::Open {
            params,
            events,
            reply,
        })
        .await
    }

    pub async fn prepare(
        &self,
        prefetch: u16,
        queues: Vec<(String, QueueOptions)>,
    ) -> Result<(), BrokerError> {
        self.request(|reply| BrokerCommand::Prepare {
            prefetch,
            queues,
            reply,
        })
        .await
    }

    pub async fn consume(
        &self,
        queue: String,
        consumer_tag: String,
        deliveries: mpsc::Sender<InboundMessage>,
    ) -> Result<(), BrokerError> {
        self.request(|reply| BrokerCommand::Consume {
            queue,
            consumer_tag,
            deliveries,
            reply,
        })
        .await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.request(|reply| BrokerCommand::Ack {
            delivery_tag,
            reply,
        })
        .await
    }

    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.request(|reply| BrokerCommand::Nack {
            delivery_tag,
            requeue,
            reply,
        })
        .await
    }

    pub async fn publish(&self, queue: String, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.request(|reply| BrokerCommand::Publish {
            queue,
            payload,
            reply,
        })
        .await
    }

    pub async fn queue_depth(&self, queue: String) -> Result<u32, BrokerError> {
        self.request(|reply| BrokerCommand::QueueDepth { queue, reply })
            .await
    }

    pub async fn cancel(&self, consumer_tag: String) -> Result<(), BrokerError> {
        self.request(|reply| BrokerCommand::Cancel {
            consumer_tag,
            reply,
        })
        .await
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.request(|reply| BrokerCommand::Close { reply }).await
    }

    /// Stop the worker, waiting up to `grace` before aborting it
    pub async fn shutdown(&self, grace: Duration) {
        if self.commands.try_send(BrokerCommand::Shutdown).is_err() {
            debug!(worker = %self.name, "Worker queue full or closed; aborting after grace");
        }

        let handle = self.handle.lock().take();
        let Some(mut handle) = handle else {
            return;
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {
                debug!(worker = %self.name, "Broker worker stopped");
            }
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!(worker = %self.name, "Broker worker ended with error: {}", e);
            }
            Err(_) => {
                warn!(worker = %self.name, "Broker worker did not stop in time, aborting");
                handle.abort();
            }
            _ => {}
        }
    }
}

impl Drop for BrokerWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_worker(
    name: String,
    factory: Arc<dyn TransportFactory>,
    mut commands: mpsc::Receiver<BrokerCommand>,
) {
    let mut transport: Option<Box<dyn BrokerTransport>> = None;

    while let Some(command) = commands.recv().await {
        match command {
            BrokerCommand::Open {
                params,
                events,
                reply,
            } => {
                if let Some(mut previous) = transport.take() {
                    if let Err(e) = previous.close().await {
                        debug!(worker = %name, "Closing previous transport failed: {}", e);
                    }
                }
                let mut fresh = factory.create();
                let result = fresh.open(&params, events).await;
                if result.is_ok() {
                    info!(worker = %name, endpoint = %params.endpoint(), "Transport opened");
                    transport = Some(fresh);
                }
                let _ = reply.send(result);
            }
            BrokerCommand::Prepare {
                prefetch,
                queues,
                reply,
            } => {
                let result = match transport.as_mut() {
                    Some(t) => prepare(t.as_mut(), prefetch, &queues).await,
                    None => Err(not_open()),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::Consume {
                queue,
                consumer_tag,
                deliveries,
                reply,
            } => {
                let result = match transport.as_mut() {
                    Some(t) => t.consume(&queue, &consumer_tag, deliveries).await,
                    None => Err(not_open()),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::Ack {
                delivery_tag,
                reply,
            } => {
                let result = match transport.as_mut() {
                    Some(t) => t.ack(delivery_tag).await,
                    None => Err(not_open()),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::Nack {
                delivery_tag,
                requeue,
                reply,
            } => {
                let result = match transport.as_mut() {
                    Some(t) => t.nack(delivery_tag, requeue).await,
                    None => Err(not_open()),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::Publish {
                queue,
                payload,
                reply,
            } => {
                let result = match transport.as_mut() {
                    Some(t) => t.publish(&queue, &payload).await,
                    None => Err(not_open()),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::QueueDepth { queue, reply } => {
                let result = match transport.as_mut() {
                    Some(t) => t.declare_queue(&queue, QueueOptions::passive()).await,
                    None => Err(not_open()),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::Cancel {
                consumer_tag,
                reply,
            } => {
                let result = match transport.as_mut() {
                    Some(t) => t.cancel(&consumer_tag).await,
                    None => Err(not_open()),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::Close { reply } => {
                let result = match transport.take() {
                    Some(mut t) => t.close().await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::Shutdown => break,
        }
    }

    if let Some(mut t) = transport.take() {
        if let Err(e) = t.close().await {
            debug!(worker = %name, "Closing transport on shutdown failed: {}", e);
        }
    }
    debug!(worker = %name, "Broker worker exiting");
}

async fn prepare(
    transport: &mut dyn BrokerTransport,
    prefetch: u16,
    queues: &[(String, QueueOptions)],
) -> Result<(), BrokerError> {
    transport.set_prefetch(prefetch).await?;
    for (queue, options) in queues {
        let depth = transport.declare_queue(queue, *options).await?;
        debug!(queue = %queue, depth, "Queue declared");
    }
    Ok(())
}

fn not_open() -> BrokerError {
    BrokerError::Transport("no open transport".to_string())
}
