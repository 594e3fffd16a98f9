//! Durable [`StageQueue`] on the shared SQLite database.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{DeadLetter, Delivery, QueueError, Receipt, StageMessage, StageQueue};
use crate::db::{format_timestamp, Database, DatabaseError};
use crate::pipeline::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// How long a received message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    /// Receives without an ack before a message is dead-lettered.
    pub max_receives: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_receives: 5,
        }
    }
}

pub struct SqliteQueue {
    db: Database,
    settings: QueueSettings,
}

struct QueuedRow {
    id: i64,
    body: String,
    receive_count: u32,
    last_error: Option<String>,
}

impl QueuedRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            body: row.get("body")?,
            receive_count: row.get("receive_count")?,
            last_error: row.get("last_error")?,
        })
    }
}

struct DeadLetterRow {
    id: i64,
    body: String,
    attempt_count: u32,
    receive_count: u32,
    error_detail: Option<String>,
    dead_lettered_at: String,
    redriven_at: Option<String>,
}

impl DeadLetterRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            body: row.get("body")?,
            attempt_count: row.get("attempt_count")?,
            receive_count: row.get("receive_count")?,
            error_detail: row.get("error_detail")?,
            dead_lettered_at: row.get("dead_lettered_at")?,
            redriven_at: row.get("redriven_at")?,
        })
    }

    fn decode(self) -> Option<DeadLetter> {
        match serde_json::from_str::<StageMessage>(&self.body) {
            Ok(message) => Some(DeadLetter {
                id: self.id,
                message,
                attempt_count: self.attempt_count,
                receive_count: self.receive_count,
                error_detail: self.error_detail,
                dead_lettered_at: self.dead_lettered_at,
                redriven_at: self.redriven_at,
            }),
            Err(e) => {
                log::warn!("Skipping undecodable dead letter {}: {}", self.id, e);
                None
            }
        }
    }
}

fn timestamp_after(delay: Duration) -> String {
    let now = Utc::now();
    let at = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now);
    format_timestamp(at)
}

impl SqliteQueue {
    pub fn new(db: Database, settings: QueueSettings) -> Self {
        Self { db, settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }
}

impl StageQueue for SqliteQueue {
    fn enqueue(&self, message: &StageMessage, delay: Duration) -> Result<(), QueueError> {
        let body = serde_json::to_string(message)?;
        let now = format_timestamp(Utc::now());
        let visible_at = timestamp_after(delay);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queue_messages (stage, document_id, generation_id, body,
                 receive_count, visible_at, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                params![
                    message.stage.as_str(),
                    message.document_id,
                    message.generation_id,
                    body,
                    visible_at,
                    now
                ],
            )?;
            Ok(())
        })?;
        log::debug!(
            "Enqueued {} for {}/{} (attempt {})",
            message.stage,
            message.document_id,
            message.generation_id,
            message.attempt
        );
        Ok(())
    }

    fn dequeue(&self, stage: Stage) -> Result<Option<Delivery>, QueueError> {
        let now = format_timestamp(Utc::now());
        let hidden_until = timestamp_after(self.settings.visibility_timeout);
        let max_receives = self.settings.max_receives;

        let delivery = self.db.with_tx(|tx| loop {
            let next = tx
                .query_row(
                    "SELECT id, body, receive_count, last_error FROM queue_messages
                     WHERE stage = ?1 AND visible_at <= ?2
                     ORDER BY visible_at ASC, id ASC LIMIT 1",
                    params![stage.as_str(), now],
                    QueuedRow::from_row,
                )
                .optional()?;
            let row = match next {
                Some(row) => row,
                None => return Ok(None),
            };

            let message = match serde_json::from_str::<StageMessage>(&row.body) {
                Ok(message) if row.receive_count < max_receives => message,
                decoded => {
                    let (attempt, reason) = match decoded {
                        Ok(m) => (m.attempt, row.last_error.clone()),
                        Err(e) => (0, Some(format!("undecodable message body: {}", e))),
                    };
                    tx.execute(
                        "INSERT INTO dead_letters (stage, document_id, generation_id, body,
                         attempt_count, receive_count, error_detail, dead_lettered_at)
                         SELECT stage, document_id, generation_id, body, ?2, receive_count, ?3, ?4
                         FROM queue_messages WHERE id = ?1",
                        params![row.id, attempt, reason, now],
                    )?;
                    tx.execute("DELETE FROM queue_messages WHERE id = ?1", params![row.id])?;
                    log::warn!(
                        "Dead-lettered {} message {} after {} receives",
                        stage,
                        row.id,
                        row.receive_count
                    );
                    continue;
                }
            };

            let receive_count = row.receive_count + 1;
            tx.execute(
                "UPDATE queue_messages SET receive_count = ?2, visible_at = ?3 WHERE id = ?1",
                params![row.id, receive_count, hidden_until],
            )?;
            return Ok(Some(Delivery {
                message,
                receipt: Receipt {
                    id: row.id,
                    receive_count,
                },
            }));
        })?;
        Ok(delivery)
    }

    fn ack(&self, receipt: Receipt) -> Result<(), QueueError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM queue_messages WHERE id = ?1 AND receive_count = ?2",
                params![receipt.id, receipt.receive_count],
            )?;
            if deleted == 0 {
                log::debug!("Ack for message {} ignored: receipt is stale", receipt.id);
            }
            Ok(())
        })?;
        Ok(())
    }

    fn nack(&self, receipt: Receipt, delay: Duration, error: &str) -> Result<(), QueueError> {
        let visible_at = timestamp_after(delay);
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_messages SET visible_at = ?3, last_error = ?4
                 WHERE id = ?1 AND receive_count = ?2",
                params![receipt.id, receipt.receive_count, visible_at, error],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn requeue(
        &self,
        receipt: Receipt,
        next: &StageMessage,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        let body = serde_json::to_string(next)?;
        let visible_at = timestamp_after(delay);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE queue_messages SET body = ?3, receive_count = 0, visible_at = ?4,
                 last_error = ?5 WHERE id = ?1 AND receive_count = ?2",
                params![receipt.id, receipt.receive_count, body, visible_at, error],
            )?;
            if changed == 0 {
                return Err(DatabaseError::Conflict(format!(
                    "message {} was redelivered before it could be requeued",
                    receipt.id
                )));
            }
            Ok(())
        })?;
        Ok(())
    }

    fn depth(&self, stage: Stage) -> Result<u64, QueueError> {
        Ok(self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE stage = ?1",
                params![stage.as_str()],
                |r| r.get(0),
            )?)
        })?)
    }

    fn dead_letters(&self, stage: Option<Stage>) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM dead_letters WHERE (?1 IS NULL OR stage = ?1)
                 ORDER BY dead_lettered_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![stage.map(|s| s.as_str())], DeadLetterRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows.into_iter().filter_map(DeadLetterRow::decode).collect())
    }

    fn dead_letter(&self, id: i64) -> Result<Option<DeadLetter>, QueueError> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM dead_letters WHERE id = ?1",
                    params![id],
                    DeadLetterRow::from_row,
                )
                .optional()?)
        })?;
        Ok(row.and_then(DeadLetterRow::decode))
    }

    fn redrive_count(&self, message: &StageMessage) -> Result<u32, QueueError> {
        Ok(self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM dead_letters
                 WHERE document_id = ?1 AND generation_id = ?2 AND stage = ?3
                   AND redriven_at IS NOT NULL",
                params![message.document_id, message.generation_id, message.stage.as_str()],
                |r| r.get(0),
            )?)
        })?)
    }

    fn redrive(&self, id: i64) -> Result<StageMessage, QueueError> {
        let letter = self.dead_letter(id)?.ok_or(QueueError::DeadLetterNotFound(id))?;
        if letter.redriven_at.is_some() {
            return Err(DatabaseError::Conflict(format!("dead letter {} was already redriven", id)).into());
        }
        let body = serde_json::to_string(&letter.message)?;
        let now = format_timestamp(Utc::now());
        self.db.with_tx(|tx| {
            let stamped = tx.execute(
                "UPDATE dead_letters SET redriven_at = ?2 WHERE id = ?1 AND redriven_at IS NULL",
                params![id, now],
            )?;
            if stamped == 0 {
                return Err(DatabaseError::Conflict(format!(
                    "dead letter {} was already redriven",
                    id
                )));
            }
            tx.execute(
                "INSERT INTO queue_messages (stage, document_id, generation_id, body,
                 receive_count, visible_at, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                params![
                    letter.message.stage.as_str(),
                    letter.message.document_id,
                    letter.message.generation_id,
                    body,
                    now
                ],
            )?;
            Ok(())
        })?;
        Ok(letter.message)
    }

    fn discard(&self, id: i64) -> Result<(), QueueError> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM dead_letters WHERE id = ?1", params![id])?)
        })?;
        if deleted == 0 {
            return Err(QueueError::DeadLetterNotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_receives: u32, visibility: Duration) -> SqliteQueue {
        SqliteQueue::new(
            Database::open_in_memory().unwrap(),
            QueueSettings {
                visibility_timeout: visibility,
                max_receives,
            },
        )
    }

    fn message(stage: Stage) -> StageMessage {
        StageMessage::first("doc-1", "g1", stage, "uploads/doc-1.pdf")
    }

    #[test]
    fn test_fifo_per_stage() {
        let q = queue(5, Duration::from_secs(60));
        let mut first = message(Stage::Planning);
        first.document_id = "doc-a".to_string();
        let mut second = message(Stage::Planning);
        second.document_id = "doc-b".to_string();
        q.enqueue(&first, Duration::ZERO).unwrap();
        q.enqueue(&second, Duration::ZERO).unwrap();
        q.enqueue(&message(Stage::Reporting), Duration::ZERO).unwrap();

        let got = q.dequeue(Stage::Planning).unwrap().unwrap();
        assert_eq!(got.message.document_id, "doc-a");
        assert_eq!(got.receipt.receive_count, 1);
        let got = q.dequeue(Stage::Planning).unwrap().unwrap();
        assert_eq!(got.message.document_id, "doc-b");
        assert!(q.dequeue(Stage::Planning).unwrap().is_none());
        assert_eq!(q.depth(Stage::Planning).unwrap(), 2);
    }

    #[test]
    fn test_ack_removes_message() {
        let q = queue(5, Duration::from_millis(10));
        q.enqueue(&message(Stage::Extraction), Duration::ZERO).unwrap();
        let d = q.dequeue(Stage::Extraction).unwrap().unwrap();
        q.ack(d.receipt).unwrap();
        assert_eq!(q.depth(Stage::Extraction).unwrap(), 0);
    }

    #[test]
    fn test_delayed_message_is_hidden() {
        let q = queue(5, Duration::from_secs(60));
        q.enqueue(&message(Stage::Extraction), Duration::from_secs(60)).unwrap();
        assert!(q.dequeue(Stage::Extraction).unwrap().is_none());
        assert_eq!(q.depth(Stage::Extraction).unwrap(), 1);
    }

    #[test]
    fn test_unacked_message_is_redelivered_then_dead_lettered() {
        let q = queue(2, Duration::from_millis(5));
        q.enqueue(&message(Stage::Categorization), Duration::ZERO).unwrap();

        let first = q.dequeue(Stage::Categorization).unwrap().unwrap();
        q.nack(first.receipt, Duration::ZERO, "store busy").unwrap();
        let second = q.dequeue(Stage::Categorization).unwrap().unwrap();
        assert_eq!(second.receipt.receive_count, 2);

        std::thread::sleep(Duration::from_millis(20));
        assert!(q.dequeue(Stage::Categorization).unwrap().is_none());
        assert_eq!(q.depth(Stage::Categorization).unwrap(), 0);

        let letters = q.dead_letters(Some(Stage::Categorization)).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].receive_count, 2);
        assert_eq!(letters[0].attempt_count, 1);
        assert_eq!(letters[0].error_detail.as_deref(), Some("store busy"));
        assert!(q.dead_letters(Some(Stage::Planning)).unwrap().is_empty());
    }

    #[test]
    fn test_stale_receipt_cannot_ack() {
        let q = queue(5, Duration::from_millis(5));
        q.enqueue(&message(Stage::Extraction), Duration::ZERO).unwrap();
        let stale = q.dequeue(Stage::Extraction).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let fresh = q.dequeue(Stage::Extraction).unwrap().unwrap();

        q.ack(stale.receipt).unwrap();
        assert_eq!(q.depth(Stage::Extraction).unwrap(), 1);
        q.ack(fresh.receipt).unwrap();
        assert_eq!(q.depth(Stage::Extraction).unwrap(), 0);
    }

    #[test]
    fn test_requeue_bumps_attempt_and_resets_receives() {
        let q = queue(5, Duration::from_secs(60));
        q.enqueue(&message(Stage::Planning), Duration::ZERO).unwrap();
        let d = q.dequeue(Stage::Planning).unwrap().unwrap();
        q.requeue(d.receipt, &d.message.retry(), Duration::ZERO, "throttled").unwrap();

        let again = q.dequeue(Stage::Planning).unwrap().unwrap();
        assert_eq!(again.message.attempt, 2);
        assert_eq!(again.receipt.receive_count, 1);
        assert!(q.requeue(d.receipt, &d.message, Duration::ZERO, "late").is_err());
    }

    #[test]
    fn test_redrive_and_discard() {
        let q = queue(1, Duration::from_millis(5));
        q.enqueue(&message(Stage::Reporting), Duration::ZERO).unwrap();
        q.dequeue(Stage::Reporting).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(q.dequeue(Stage::Reporting).unwrap().is_none());

        let letter = q.dead_letters(None).unwrap().remove(0);
        assert_eq!(q.redrive_count(&letter.message).unwrap(), 0);
        let redriven = q.redrive(letter.id).unwrap();
        assert_eq!(redriven, letter.message);
        assert_eq!(q.redrive_count(&letter.message).unwrap(), 1);
        assert!(q.redrive(letter.id).is_err());
        assert!(q.dequeue(Stage::Reporting).unwrap().is_some());

        q.discard(letter.id).unwrap();
        assert!(matches!(q.discard(letter.id), Err(QueueError::DeadLetterNotFound(_))));
    }
}
