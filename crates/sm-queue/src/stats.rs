//! Queue statistics and monitoring. Stats never raise: on any database
//! error the caller gets zeroed counts or an empty list.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::error;

use sm_store::{QueueMessage, Store};

use crate::enums::QueueDirection;
use crate::operations::{row_to_message, QUEUE_COLUMNS};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatsSnapshot {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub sent: i64,
    pub completed: i64,
    pub failed: i64,
    pub expired: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

/// Counts by status, optionally filtered by host and direction.
pub fn get_queue_stats(
    store: &Store,
    host_id: Option<&str>,
    direction: Option<QueueDirection>,
) -> QueueStatsSnapshot {
    match try_get_queue_stats(store, host_id, direction) {
        Ok(stats) => stats,
        Err(e) => {
            error!("Failed to get queue stats: {e}");
            QueueStatsSnapshot {
                host_id: host_id.map(str::to_string),
                direction: direction.map(|d| d.as_str().to_string()),
                ..Default::default()
            }
        }
    }
}

fn try_get_queue_stats(
    store: &Store,
    host_id: Option<&str>,
    direction: Option<QueueDirection>,
) -> Result<QueueStatsSnapshot, rusqlite::Error> {
    let conn = store.lock();

    let mut sql = String::from("SELECT status, COUNT(*) FROM message_queue WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    if let Some(host_id) = host_id {
        sql.push_str(" AND host_id = ?");
        params_vec.push(Box::new(host_id.to_string()));
    }
    if let Some(direction) = direction {
        sql.push_str(" AND direction = ?");
        params_vec.push(Box::new(direction.as_str().to_string()));
    }
    sql.push_str(" GROUP BY status");

    let mut stats = QueueStatsSnapshot {
        host_id: host_id.map(str::to_string),
        direction: direction.map(|d| d.as_str().to_string()),
        ..Default::default()
    };

    let mut stmt = conn.prepare(&sql)?;
    let refs: Vec<&dyn rusqlite::types::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(refs.as_slice(), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        stats.total += count;
        match status.as_str() {
            "pending" => stats.pending = count,
            "in_progress" => stats.in_progress = count,
            "sent" => stats.sent = count,
            "completed" => stats.completed = count,
            "failed" => stats.failed = count,
            "expired" => stats.expired = count,
            _ => {}
        }
    }
    Ok(stats)
}

/// Failed and expired messages for the management UI, newest first.
pub fn get_failed_messages(store: &Store, limit: usize) -> Vec<QueueMessage> {
    let result: Result<Vec<QueueMessage>, rusqlite::Error> = (|| {
        let conn = store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM message_queue
             WHERE status IN ('failed', 'expired')
             ORDER BY created_at DESC LIMIT ?1",
        ))?;
        let messages = stmt
            .query_map(params![limit as i64], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    })();

    match result {
        Ok(messages) => messages,
        Err(e) => {
            error!("Failed to get failed messages: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::{EnqueueRequest, QueueOps};
    use serde_json::json;
    use sm_store::hosts;

    #[test]
    fn test_stats_counts() {
        let store = Store::open_memory().unwrap();
        let host_id = {
            let conn = store.lock();
            hosts::create(&conn, "stats.example.com", None, None, None)
                .unwrap()
                .id
        };
        let ops = QueueOps::new(store.clone());

        let a = ops
            .enqueue_message(&EnqueueRequest::command(&host_id, json!({})))
            .unwrap();
        let b = ops
            .enqueue_message(&EnqueueRequest::command(&host_id, json!({})))
            .unwrap();
        ops.mark_sent(&a).unwrap();
        ops.mark_acknowledged(&a).unwrap();
        ops.mark_failed(&b, Some("boom"), false).unwrap();

        let stats = get_queue_stats(&store, Some(&host_id), Some(QueueDirection::Outbound));
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);

        let other = get_queue_stats(&store, Some("other-host"), None);
        assert_eq!(other.total, 0);
    }

    #[test]
    fn test_failed_listing_newest_first() {
        let store = Store::open_memory().unwrap();
        let host_id = {
            let conn = store.lock();
            hosts::create(&conn, "failed.example.com", None, None, None)
                .unwrap()
                .id
        };
        let ops = QueueOps::new(store.clone());

        let first = ops
            .enqueue_message(&EnqueueRequest::command(&host_id, json!({"n": 1})))
            .unwrap();
        let second = ops
            .enqueue_message(&EnqueueRequest::command(&host_id, json!({"n": 2})))
            .unwrap();
        ops.mark_failed(&first, Some("x"), false).unwrap();
        ops.mark_failed(&second, Some("y"), false).unwrap();

        let failed = get_failed_messages(&store, 10);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].message_id, second);
        assert_eq!(failed[1].message_id, first);
    }
}
