use crate::config::MessageBrokerConfig;
use crate::error::{Error, Result};
use crate::gateway::Collection;
use crate::realtime::event::ChangeEvent;
use crate::realtime::feed::{ChangeCallback, ChangeFeed, SubscriptionId};
use async_trait::async_trait;
use deadpool_lapin::{Config, Manager, Pool};
use futures_util::stream::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ConnectionProperties, Consumer, ExchangeKind,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Subscription {
    consumer_task: JoinHandle<()>,
    channel: Channel,
}

/// Change feed backed by a RabbitMQ topic exchange. Row changes, whether
/// captured upstream or announced by a vigil instance, carry routing key
/// `<collection>.<kind>`.
pub struct AmqpChangeFeed {
    /// Connection pool
    pool: Pool,
    /// Configuration
    config: MessageBrokerConfig,
    /// Live subscriptions
    subscriptions: Arc<RwLock<HashMap<SubscriptionId, Subscription>>>,
    /// Channel used for publishing
    channel: Arc<Mutex<Option<Channel>>>,
}

impl AmqpChangeFeed {
    /// Connect and declare the exchanges
    pub async fn new(config: MessageBrokerConfig) -> anyhow::Result<Self> {
        let pool_config = Config {
            url: Some(config.uri.clone()),
            pool: Some(deadpool_lapin::PoolConfig {
                max_size: config.pool_size as usize,
                queue_mode: deadpool::managed::QueueMode::Fifo,
                timeouts: deadpool::managed::Timeouts {
                    wait: Some(Duration::from_millis(config.timeout_ms)),
                    create: Some(Duration::from_millis(config.timeout_ms)),
                    recycle: Some(Duration::from_millis(config.timeout_ms)),
                },
            }),
            connection_properties: ConnectionProperties::default(),
        };
        let pool = pool_config.create_pool(Some(deadpool_lapin::Runtime::Tokio1))?;

        let feed = Self {
            pool,
            config,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            channel: Arc::new(Mutex::new(None)),
        };

        feed.init().await?;

        Ok(feed)
    }

    async fn init(&self) -> Result<()> {
        let channel = self.create_channel().await?;

        for exchange in [&self.config.exchange, &self.config.dead_letter_exchange] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::Subscription(format!("Failed to declare exchange {}: {}", exchange, e)))?;
        }

        *self.channel.lock().await = Some(channel);

        info!("AMQP change feed initialized on exchange {}", self.config.exchange);

        Ok(())
    }

    /// Get a connection from the pool with retry
    async fn get_connection(&self) -> Result<deadpool::managed::Object<Manager>> {
        let mut attempts = 0;
        let max_attempts = self.config.retry_attempts.max(1);

        loop {
            attempts += 1;
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    if attempts >= max_attempts {
                        return Err(Error::Transport(format!(
                            "Failed to get RabbitMQ connection after {} attempts: {}",
                            attempts, err
                        )));
                    }

                    warn!(
                        "Failed to get RabbitMQ connection (attempt {}/{}): {}",
                        attempts, max_attempts, err
                    );

                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    async fn create_channel(&self) -> Result<Channel> {
        let conn = self.get_connection().await?;
        conn.create_channel()
            .await
            .map_err(|e| Error::Transport(format!("Failed to create RabbitMQ channel: {}", e)))
    }

    /// Get the publishing channel, reopening it if the connection dropped
    async fn get_channel(&self) -> Result<Channel> {
        let mut channel_guard = self.channel.lock().await;

        if let Some(channel) = &*channel_guard {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.create_channel().await?;
        *channel_guard = Some(channel.clone());

        Ok(channel)
    }

    /// Declare an exclusive queue bound to `pattern` on a dedicated channel
    async fn create_consumer_queue(&self, pattern: &str) -> Result<(Channel, Consumer)> {
        let channel = self.create_channel().await?;

        let queue_name = format!("vigil.{}.{}", pattern.replace(['.', '*'], "_"), Uuid::new_v4());

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            lapin::types::AMQPValue::LongString(self.config.dead_letter_exchange.clone().into()),
        );

        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| Error::Subscription(format!("Failed to declare queue: {}", e)))?;

        debug!("Created queue: {} for pattern: {}", queue_name, pattern);

        channel
            .queue_bind(
                &queue_name,
                &self.config.exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Subscription(format!("Failed to bind queue: {}", e)))?;

        let consumer = channel
            .basic_consume(
                &queue_name,
                &format!("consumer-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Subscription(format!("Failed to create consumer: {}", e)))?;

        Ok((channel, consumer))
    }
}

#[async_trait]
impl ChangeFeed for AmqpChangeFeed {
    async fn subscribe(&self, collection: Collection, callback: ChangeCallback) -> Result<SubscriptionId> {
        let pattern = ChangeEvent::collection_pattern(collection);
        let (channel, mut consumer) = self.create_consumer_queue(&pattern).await?;

        let subscription_id = SubscriptionId::generate();
        let task_id = subscription_id.clone();

        let consumer_task = tokio::spawn(async move {
            info!("Started consumer for pattern: {} (subscription: {})", pattern, task_id);

            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!("Error receiving change: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                match serde_json::from_slice::<ChangeEvent>(&delivery.data) {
                    Ok(event) => {
                        debug!("Received change: {} ({})", event.routing_key(), event.id);
                        if let Err(e) = callback(event) {
                            error!("Error processing change event: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to parse change event: {}", e),
                }

                // Acknowledge regardless so a bad message never blocks the queue
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!("Failed to acknowledge message: {}", e);
                }
            }

            info!("Consumer stopped for pattern: {} (subscription: {})", pattern, task_id);
        });

        self.subscriptions.write().await.insert(
            subscription_id.clone(),
            Subscription {
                consumer_task,
                channel,
            },
        );

        Ok(subscription_id)
    }

    async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<()> {
        let subscription = self
            .subscriptions
            .write()
            .await
            .remove(subscription_id)
            .ok_or_else(|| Error::NotFound(format!("Subscription not found: {}", subscription_id)))?;

        subscription.consumer_task.abort();
        if let Err(e) = subscription.channel.close(200, "unsubscribed").await {
            warn!("Failed to close channel for {}: {}", subscription_id, e);
        }

        info!("Unsubscribed: {}", subscription_id);
        Ok(())
    }

    async fn announce(&self, event: ChangeEvent) -> Result<()> {
        let message = serde_json::to_vec(&event)?;
        let channel = self.get_channel().await?;
        let routing_key = event.routing_key();

        channel
            .basic_publish(
                &self.config.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &message,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| Error::Transport(format!("Failed to publish change: {}", e)))?;

        debug!("Published change: {} with routing key: {}", event.id, routing_key);

        Ok(())
    }
}

/// Create the AMQP change feed
pub async fn create_change_feed(config: MessageBrokerConfig) -> anyhow::Result<Arc<AmqpChangeFeed>> {
    let feed = AmqpChangeFeed::new(config).await?;

    Ok(Arc::new(feed))
}
