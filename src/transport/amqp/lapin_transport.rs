//! `BrokerTransport` backed by lapin
//!
//! lapin has no automatic recovery; connection errors and the end of a
//! consumer stream are reported as [`TransportEvent`]s and recovery is left
//! to `BrokerConnection`.

use super::connection::{BrokerError, ConnectionParams};
use crate::transport::{
    BrokerTransport, Envelope, InboundMessage, QueueOptions, ShutdownNotice, TransportEvent,
    TransportFactory,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::protocol::AMQPErrorKind;
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PERSISTENT_DELIVERY: u8 = 2;
const JSON_CONTENT_TYPE: &str = "application/json";

/// One lapin connection with a single confirm-mode channel
#[derive(Default)]
pub struct LapinTransport {
    connection: Option<Connection>,
    channel: Option<Channel>,
    events: Option<mpsc::Sender<TransportEvent>>,
    /// Consumer forwarding tasks keyed by consumer tag
    forwarders: Vec<(String, JoinHandle<()>)>,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self) -> Result<&Channel, BrokerError> {
        self.channel
            .as_ref()
            .ok_or_else(|| BrokerError::Transport("channel is not open".to_string()))
    }
}

#[async_trait]
impl BrokerTransport for LapinTransport {
    async fn open(
        &mut self,
        params: &ConnectionParams,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), BrokerError> {
        // lapin does not expose the TCP stream, so the tuning is only reported
        debug!(
            endpoint = %params.endpoint(),
            keep_alive = params.socket.keep_alive,
            no_delay = params.socket.no_delay,
            buffer_size = params.socket.buffer_size,
            "Opening AMQP connection"
        );
        let connection = Connection::connect(&params.to_amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(map_lapin_error)?;

        connection.on_error(shutdown_reporter(events.clone(), "connection"));

        let channel = connection
            .create_channel()
            .await
            .map_err(map_lapin_error)?;
        channel.on_error(shutdown_reporter(events.clone(), "channel"));
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_lapin_error)?;

        self.connection = Some(connection);
        self.channel = Some(channel);
        self.events = Some(events);
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), BrokerError> {
        self.channel()?
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn declare_queue(
        &mut self,
        name: &str,
        options: QueueOptions,
    ) -> Result<u32, BrokerError> {
        let declare = QueueDeclareOptions {
            passive: options.passive,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        let queue = self
            .channel()?
            .queue_declare(name, declare, FieldTable::default())
            .await
            .map_err(map_lapin_error)?;
        Ok(queue.message_count())
    }

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        deliveries: mpsc::Sender<InboundMessage>,
    ) -> Result<(), BrokerError> {
        let mut consumer = self
            .channel()?
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;

        let events = self
            .events
            .clone()
            .ok_or_else(|| BrokerError::Transport("transport is not open".to_string()))?;
        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| InboundMessage {
                    payload: delivery.data,
                    delivery_tag: delivery.delivery_tag,
                    envelope: Envelope {
                        exchange: delivery.exchange.as_str().to_string(),
                        routing_key: delivery.routing_key.as_str().to_string(),
                        redelivered: delivery.redelivered,
                        content_type: delivery
                            .properties
                            .content_type()
                            .as_ref()
                            .map(|ct| ct.as_str().to_string()),
                    },
                })
                .map_err(|e| e.to_string())
        });
        let forwarder = tokio::spawn(forward_deliveries(
            stream,
            consumer_tag.to_string(),
            deliveries,
            events,
        ));
        self.forwarders.push((consumer_tag.to_string(), forwarder));
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel()?
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY)
            .with_content_type(JSON_CONTENT_TYPE.into());

        let confirmation = self
            .channel()?
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(map_lapin_error)?
            .await
            .map_err(map_lapin_error)?;

        match confirmation {
            Confirmation::Nack(_) => Err(BrokerError::Transport(format!(
                "broker rejected publish to {queue}"
            ))),
            _ => Ok(()),
        }
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), BrokerError> {
        // A cancel we asked for must not come back as a broker-side cancellation
        self.forwarders.retain(|(tag, forwarder)| {
            if tag == consumer_tag {
                forwarder.abort();
                false
            } else {
                true
            }
        });
        self.channel()?
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        for (_, forwarder) in self.forwarders.drain(..) {
            forwarder.abort();
        }
        self.events = None;
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close(ShutdownNotice::NORMAL_CLOSURE, "OK").await {
                debug!("Channel close failed: {}", e);
            }
        }
        if let Some(connection) = self.connection.take() {
            connection
                .close(ShutdownNotice::NORMAL_CLOSURE, "OK")
                .await
                .map_err(map_lapin_error)?;
        }
        Ok(())
    }
}

/// Creates a fresh [`LapinTransport`] per connection attempt
#[derive(Debug, Default, Clone)]
pub struct LapinTransportFactory;

impl TransportFactory for LapinTransportFactory {
    fn create(&self) -> Box<dyn BrokerTransport> {
        Box::new(LapinTransport::new())
    }
}

/// Feed deliveries into the inbound pipeline until the consumer stream stops
///
/// A stream that ends or fails while the pipeline is still open means the
/// broker dropped the consumer (`basic.cancel`, queue deleted, channel
/// closed); that is reported as [`TransportEvent::ConsumerCancelled`].
async fn forward_deliveries<S>(
    mut stream: S,
    tag: String,
    deliveries: mpsc::Sender<InboundMessage>,
    events: mpsc::Sender<TransportEvent>,
) where
    S: Stream<Item = Result<InboundMessage, String>> + Unpin,
{
    while let Some(delivery) = stream.next().await {
        let message = match delivery {
            Ok(message) => message,
            Err(e) => {
                warn!(consumer_tag = %tag, "Consumer stream error: {}", e);
                break;
            }
        };
        // Blocks while the inbound pipeline is full; prefetch bounds what the broker sends
        if deliveries.send(message).await.is_err() {
            debug!(consumer_tag = %tag, "Inbound pipeline closed");
            return;
        }
    }

    warn!(consumer_tag = %tag, "Consumer stream ended, reporting cancellation");
    if events
        .send(TransportEvent::ConsumerCancelled(tag))
        .await
        .is_err()
    {
        debug!("Dropped consumer cancellation, listener gone");
    }
}

fn shutdown_reporter(
    events: mpsc::Sender<TransportEvent>,
    scope: &'static str,
) -> impl FnMut(lapin::Error) + Send + 'static {
    move |error| {
        let notice = shutdown_notice(&error);
        debug!(scope, reply_code = ?notice.reply_code, "Broker shutdown reported");
        if events.try_send(TransportEvent::Shutdown(notice)).is_err() {
            debug!(scope, "Dropped broker shutdown notice, listener gone");
        }
    }
}

fn shutdown_notice(error: &lapin::Error) -> ShutdownNotice {
    match error {
        lapin::Error::ProtocolError(amqp) => ShutdownNotice {
            reply_code: Some(amqp.get_id()),
            reply_text: amqp.get_message().as_str().to_string(),
            hard_error: matches!(amqp.kind(), AMQPErrorKind::Hard(_)),
            initiated_by_application: false,
        },
        other => ShutdownNotice {
            reply_code: None,
            reply_text: other.to_string(),
            hard_error: true,
            initiated_by_application: false,
        },
    }
}

/// Translate lapin failures into the broker error taxonomy
pub fn map_lapin_error(error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::IOError(io) => BrokerError::Transport(io.to_string()),
        lapin::Error::ProtocolError(amqp) if amqp.get_id() == 403 => {
            BrokerError::Authentication(amqp.get_message().as_str().to_string())
        }
        lapin::Error::ProtocolError(amqp) => BrokerError::Protocol {
            code: amqp.get_id(),
            message: amqp.get_message().as_str().to_string(),
        },
        other => BrokerError::Transport(other.to_string()),
    }
}
