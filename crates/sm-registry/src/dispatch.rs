//! Outbound dispatch loop.
//!
//! One cooperative task pumps the durable queue toward connected agents:
//! every tick it dequeues pending outbound messages per connected host (in
//! priority order), writes them to the sessions, and records sent/failed.
//! Periodically it also sweeps unacknowledged sent messages back to
//! pending and expires stale rows.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use sm_common::events::{EventBus, QueueActivityEvent};
use sm_queue::{QueueDirection, QueueOps};

use crate::protocol::Envelope;
use crate::state::ConnectionManager;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub tick: Duration,
    /// Messages dequeued per host per tick
    pub batch_size: usize,
    /// Ticks between unacknowledged/expiry sweeps
    pub retry_every_ticks: u32,
    /// Seconds a sent message may await acknowledgment
    pub ack_timeout_secs: i64,
    /// Pending messages older than this are expired
    pub queue_max_age_hours: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            batch_size: 10,
            retry_every_ticks: 240,
            ack_timeout_secs: 300,
            queue_max_age_hours: 24,
        }
    }
}

pub struct Dispatcher {
    queue: QueueOps,
    connections: Arc<ConnectionManager>,
    events: Arc<EventBus>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        queue: QueueOps,
        connections: Arc<ConnectionManager>,
        events: Arc<EventBus>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            connections,
            events,
            config,
        }
    }

    /// Run forever. Intended to be spawned under the supervisor.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut tick: u64 = 0;
        loop {
            tokio::time::sleep(self.config.tick).await;
            tick += 1;

            self.pump_once().await;

            if tick % self.config.retry_every_ticks as u64 == 0 {
                match self.queue.retry_unacknowledged(self.config.ack_timeout_secs) {
                    Ok(0) => {}
                    Ok(n) => debug!(count = n, "Requeued unacknowledged messages"),
                    Err(e) => warn!("Unacknowledged sweep failed: {e}"),
                }
                match self.queue.expire_old_messages(self.config.queue_max_age_hours) {
                    Ok(0) => {}
                    Ok(n) => debug!(count = n, "Expired stale messages"),
                    Err(e) => warn!("Expiry sweep failed: {e}"),
                }
            }
        }
    }

    /// One dispatch pass over every connected host plus broadcast rows.
    /// Per host, messages go out in dequeue order (priority, then FIFO);
    /// acknowledgments are matched later by message id, never by position.
    pub async fn pump_once(&self) {
        for host_id in self.connections.connected_host_ids().await {
            let messages = match self.queue.dequeue_messages_for_host(
                &host_id,
                QueueDirection::Outbound,
                self.config.batch_size,
                true,
            ) {
                Ok(m) => m,
                Err(e) => {
                    warn!(host_id, "Dequeue failed: {e}");
                    continue;
                }
            };

            for message in messages {
                let envelope = Envelope::from_queue_message(&message);
                let delivered = self.connections.send_to_host(&host_id, envelope).await;

                let outcome = if delivered {
                    match self.queue.mark_sent(&message.message_id) {
                        Ok(_) => "sent",
                        Err(e) => {
                            warn!(message_id = message.message_id, "mark_sent failed: {e}");
                            continue;
                        }
                    }
                } else {
                    if let Err(e) =
                        self.queue
                            .mark_failed(&message.message_id, Some("send failed"), true)
                    {
                        warn!(message_id = message.message_id, "mark_failed failed: {e}");
                    }
                    "failed"
                };

                let _ = self.events.queue_activity.send(QueueActivityEvent {
                    host_id: Some(host_id.clone()),
                    message_id: message.message_id.clone(),
                    message_type: message.message_type.clone(),
                    outcome: outcome.to_string(),
                });
            }
        }

        self.pump_broadcasts().await;
    }

    /// Broadcast rows go to every connected session; the row completes
    /// after the fan-out attempt (single-server delivery policy).
    async fn pump_broadcasts(&self) {
        let broadcasts = match self
            .queue
            .dequeue_broadcast_messages(QueueDirection::Outbound, self.config.batch_size)
        {
            Ok(m) => m,
            Err(e) => {
                warn!("Broadcast dequeue failed: {e}");
                return;
            }
        };

        for message in broadcasts {
            let envelope = Envelope::from_queue_message(&message);
            let delivered = self.connections.broadcast(&envelope).await;
            debug!(
                message_id = message.message_id,
                delivered, "Broadcast dispatched"
            );
            if let Err(e) = self.queue.mark_completed(&message.message_id) {
                warn!(message_id = message.message_id, "mark_completed failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sm_common::EventBus;
    use sm_queue::{create_command_message, EnqueueRequest, Priority};
    use sm_store::{hosts, Store};

    async fn setup() -> (Store, QueueOps, Arc<ConnectionManager>, Dispatcher, String) {
        let store = Store::open_memory().unwrap();
        let events = Arc::new(EventBus::new());
        let host_id = {
            let conn = store.lock();
            hosts::create(&conn, "dispatch.example.com", None, None, None)
                .unwrap()
                .id
        };
        let queue = QueueOps::new(store.clone());
        let connections = Arc::new(ConnectionManager::new(store.clone(), events.clone()));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            connections.clone(),
            events,
            DispatchConfig::default(),
        );
        (store, queue, connections, dispatcher, host_id)
    }

    #[tokio::test]
    async fn test_enqueue_send_ack_cycle() {
        let (_store, queue, connections, dispatcher, host_id) = setup().await;

        let (agent_id, mut rx) = connections.open_session(false).await;
        connections
            .register_agent(&agent_id, "dispatch.example.com", None, None, None)
            .await;
        connections.bind_host(&agent_id, &host_id).await;

        let message_id = queue
            .enqueue_message(&EnqueueRequest::command(
                &host_id,
                create_command_message("update_hardware", json!({})),
            ))
            .unwrap();

        dispatcher.pump_once().await;

        // The agent received the envelope carrying the queue message id.
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.message_type, "command");
        assert_eq!(envelope.message_id, message_id);
        assert_eq!(envelope.data["command_type"], "update_hardware");

        let row = queue.get_message(&message_id).unwrap().unwrap();
        assert_eq!(row.status, "sent");
        assert!(row.started_at.is_some());

        // Agent acknowledges; row completes, no retries recorded.
        assert!(queue.mark_acknowledged(&message_id).unwrap());
        let row = queue.get_message(&message_id).unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.retry_count, 0);
        assert!(row.started_at.unwrap() <= row.completed_at.unwrap());
    }

    #[tokio::test]
    async fn test_send_failure_schedules_retry() {
        let (_store, queue, connections, dispatcher, host_id) = setup().await;

        // Bind the host to a session whose receiver is dropped: sends fail.
        let (agent_id, rx) = connections.open_session(false).await;
        connections.bind_host(&agent_id, &host_id).await;
        drop(rx);

        let message_id = queue
            .enqueue_message(&EnqueueRequest::command(
                &host_id,
                create_command_message("update_hardware", json!({})),
            ))
            .unwrap();

        dispatcher.pump_once().await;

        let row = queue.get_message(&message_id).unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.error_message.as_deref(), Some("send failed"));
        // Backoff pushed it into the future, so an immediate pump skips it.
        dispatcher.pump_once().await;
        let row = queue.get_message(&message_id).unwrap().unwrap();
        assert_eq!(row.retry_count, 1);
    }

    #[tokio::test]
    async fn test_priority_order_on_the_wire() {
        let (_store, queue, connections, dispatcher, host_id) = setup().await;

        let (agent_id, mut rx) = connections.open_session(false).await;
        connections.bind_host(&agent_id, &host_id).await;

        let low = queue
            .enqueue_message(
                &EnqueueRequest::command(&host_id, json!({"n": 1})).with_priority(Priority::Low),
            )
            .unwrap();
        let urgent = queue
            .enqueue_message(
                &EnqueueRequest::command(&host_id, json!({"n": 2}))
                    .with_priority(Priority::Urgent),
            )
            .unwrap();

        dispatcher.pump_once().await;

        assert_eq!(rx.recv().await.unwrap().message_id, urgent);
        assert_eq!(rx.recv().await.unwrap().message_id, low);
    }

    #[tokio::test]
    async fn test_disconnected_host_not_dispatched() {
        let (_store, queue, _connections, dispatcher, host_id) = setup().await;

        let message_id = queue
            .enqueue_message(&EnqueueRequest::command(&host_id, json!({})))
            .unwrap();

        dispatcher.pump_once().await;

        // No session bound: the row stays pending untouched.
        let row = queue.get_message(&message_id).unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.retry_count, 0);
    }

    #[tokio::test]
    async fn test_broadcast_completes_after_fanout() {
        let (_store, queue, connections, dispatcher, _host_id) = setup().await;

        let (_a1, mut rx1) = connections.open_session(false).await;
        let (_a2, mut rx2) = connections.open_session(false).await;

        let req = EnqueueRequest::new(
            "broadcast",
            json!({"notice": "maintenance"}),
            QueueDirection::Outbound,
        );
        let message_id = queue.enqueue_message(&req).unwrap();

        dispatcher.pump_once().await;

        assert_eq!(rx1.recv().await.unwrap().message_id, message_id);
        assert_eq!(rx2.recv().await.unwrap().message_id, message_id);
        let row = queue.get_message(&message_id).unwrap().unwrap();
        assert_eq!(row.status, "completed");
    }
}
