//! SQLite-backed message broker.
//!
//! Messages are leased by [`TaskQueue::claim`] and removed by
//! [`TaskQueue::complete`] or [`TaskQueue::fail`]. A lease that is not
//! settled within the visibility timeout is handed out again, so every task
//! runs at least once. Settling a message, enqueuing its follow-ups and
//! updating chord state happen in one transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::schema::QUEUE_SCHEMA_SQL;
use crate::signature::{Envelope, JoinSlot, Link, Signature, TaskCall};
use closet_core::{now_millis, Error, QueueSettings, Result};

/// A leased message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub call: TaskCall,
    pub input: Option<Value>,
    pub link: Link,
    /// Failed runs before this one.
    pub attempts: u32,
}

/// What a handler produced.
#[derive(Debug, Clone)]
pub enum TaskOutput {
    /// Result passed to the next step or chord slot.
    Value(Value),
    /// Run this signature in place of the task; it inherits the task's link.
    Replace(Signature),
}

/// Result of settling a failed delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Redelivery scheduled after the delay.
    Retrying { attempt: u32, delay: Duration },
    /// Retries exhausted or the error is not retryable.
    Failed,
}

/// Durable task queue.
pub struct TaskQueue {
    conn: Mutex<Connection>,
    settings: QueueSettings,
    db_path: PathBuf,
}

impl TaskQueue {
    /// Open or create the queue at `db_dir/queue.db`.
    pub fn open(db_dir: impl AsRef<Path>, settings: QueueSettings) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("queue.db");

        let conn = Connection::open(&db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err)?;
        conn.execute_batch(QUEUE_SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;

        info!("TaskQueue initialized: path={}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            settings,
            db_path,
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Submit a signature. `errback` runs once if any part of it fails for good.
    pub fn submit(&self, signature: &Signature, errback: Option<TaskCall>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let link = Link {
            errback,
            ..Default::default()
        };
        self.schedule(&tx, signature, None, link)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Submit a signature unless one was already submitted under `key`.
    /// Returns whether it was scheduled.
    pub fn submit_once(
        &self,
        key: &str,
        signature: &Signature,
        errback: Option<TaskCall>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO task_submissions (key, created_at) VALUES (?1, ?2)",
                params![key, now_millis()],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            debug!("Submission {} already exists", key);
            return Ok(false);
        }
        let link = Link {
            errback,
            ..Default::default()
        };
        self.schedule(&tx, signature, None, link)?;
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    /// Lease the next ready message, if any.
    ///
    /// Reclaiming an expired lease counts as a failed attempt: the worker
    /// holding it crashed or hung. Once that exhausts the retry budget the
    /// message is dropped and its error link runs instead.
    pub fn claim(&self) -> Result<Option<Delivery>> {
        let now = now_millis();
        let lease_expired_before = now - (self.settings.visibility_timeout_secs as i64) * 1000;
        let max_retries = self.settings.retry.max_retries;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let claimed = loop {
            let row: Option<(String, String, u32, Option<i64>)> = tx
                .query_row(
                    "SELECT id, payload_json, attempts, claimed_at FROM task_messages \
                     WHERE available_at <= ?1 AND (claimed_at IS NULL OR claimed_at <= ?2) \
                     ORDER BY available_at, created_at, rowid LIMIT 1",
                    params![now, lease_expired_before],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(db_err)?;
            let Some((id, payload, mut attempts, claimed_at)) = row else {
                break None;
            };
            let envelope: Envelope = serde_json::from_str(&payload)?;

            if claimed_at.is_some() {
                attempts += 1;
                if attempts > max_retries {
                    warn!(
                        "Message {} ({}) lost its lease {} times, giving up",
                        id, envelope.call.name, attempts
                    );
                    tx.execute("DELETE FROM task_messages WHERE id = ?1", params![id])
                        .map_err(db_err)?;
                    let message = format!(
                        "Task {} did not finish after {} attempts",
                        envelope.call.name, attempts
                    );
                    self.give_up(&tx, &envelope.link, &message)?;
                    continue;
                }
                warn!("Redelivering message {} after expired lease (attempt {})", id, attempts + 1);
            }

            tx.execute(
                "UPDATE task_messages SET claimed_at = ?1, attempts = ?2 WHERE id = ?3",
                params![now, attempts, id],
            )
            .map_err(db_err)?;
            break Some((id, envelope, attempts));
        };
        tx.commit().map_err(db_err)?;

        let Some((id, envelope, attempts)) = claimed else {
            return Ok(None);
        };
        let id = Uuid::parse_str(&id).map_err(|e| Error::Database(e.to_string()))?;
        Ok(Some(Delivery {
            id,
            call: envelope.call,
            input: envelope.input,
            link: envelope.link,
            attempts,
        }))
    }

    /// Acknowledge a successful run and enqueue whatever follows it.
    ///
    /// Returns `false` if the message was already settled by another
    /// delivery, in which case nothing is enqueued.
    pub fn complete(&self, delivery: &Delivery, output: TaskOutput) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        if !delete_message(&tx, delivery.id)? {
            debug!("Message {} already settled", delivery.id);
            return Ok(false);
        }
        match output {
            TaskOutput::Value(value) => self.resolve(&tx, delivery.link.clone(), value)?,
            TaskOutput::Replace(signature) => {
                self.schedule(&tx, &signature, None, delivery.link.clone())?
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    /// Settle a failed run: schedule a retry or give up and run the errback.
    pub fn fail(&self, delivery: &Delivery, error: &Error) -> Result<FailureOutcome> {
        let retry = &self.settings.retry;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        if error.is_retryable() && delivery.attempts < retry.max_retries {
            let delay = retry.delay_for(delivery.attempts);
            let changed = tx
                .execute(
                    "UPDATE task_messages SET attempts = attempts + 1, available_at = ?1, \
                     claimed_at = NULL, last_error = ?2 WHERE id = ?3",
                    params![
                        now_millis() + delay.as_millis() as i64,
                        error.to_string(),
                        delivery.id.to_string()
                    ],
                )
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            if changed == 0 {
                debug!("Message {} already settled", delivery.id);
                return Ok(FailureOutcome::Failed);
            }
            return Ok(FailureOutcome::Retrying {
                attempt: delivery.attempts + 1,
                delay,
            });
        }

        if delete_message(&tx, delivery.id)? {
            self.give_up(&tx, &delivery.link, &error.to_string())?;
        }
        tx.commit().map_err(db_err)?;
        Ok(FailureOutcome::Failed)
    }

    /// Route a permanent failure: a chord member fails its chord, anything
    /// else runs its own error link.
    fn give_up(&self, conn: &Connection, link: &Link, message: &str) -> Result<()> {
        match link.join {
            Some(join) => self.fail_chord(conn, join.chord_id, message),
            None => match &link.errback {
                Some(errback) => enqueue_errback(conn, errback, message),
                None => Ok(()),
            },
        }
    }

    /// Fail every pending chord whose deadline has passed and run its errback.
    pub fn sweep_expired_chords(&self) -> Result<usize> {
        let now = now_millis();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let expired: Vec<String> = {
            let mut stmt = tx
                .prepare_cached(
                    "SELECT id FROM task_chords WHERE state = 'pending' AND deadline <= ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![now], |row| row.get(0))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };
        for id in &expired {
            let chord_id = Uuid::parse_str(id).map_err(|e| Error::Database(e.to_string()))?;
            let (filled, size) = chord_progress(&tx, chord_id)?;
            warn!("Chord {} timed out with {} of {} results", chord_id, filled, size);
            self.fail_chord(
                &tx,
                chord_id,
                &format!(
                    "Timed out waiting for parallel tasks ({} of {} finished)",
                    filled, size
                ),
            )?;
        }
        tx.commit().map_err(db_err)?;
        Ok(expired.len())
    }

    /// Messages not yet settled, leased or not.
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM task_messages", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }

    /// Time until the earliest unleased message becomes ready.
    pub fn next_ready_in(&self) -> Result<Option<Duration>> {
        let conn = self.conn.lock();
        let next: Option<i64> = conn
            .query_row(
                "SELECT MIN(available_at) FROM task_messages WHERE claimed_at IS NULL",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(next.map(|at| Duration::from_millis((at - now_millis()).max(0) as u64)))
    }

    // ---------------------------------------------------------------
    // Graph expansion (always inside the caller's transaction)
    // ---------------------------------------------------------------

    fn schedule(
        &self,
        conn: &Connection,
        signature: &Signature,
        input: Option<Value>,
        link: Link,
    ) -> Result<()> {
        match signature {
            Signature::Task(call) => {
                let envelope = Envelope {
                    call: call.clone(),
                    input,
                    link,
                };
                insert_message(conn, &envelope)
            }
            Signature::Chain(steps) => match steps.split_first() {
                None => self.resolve(conn, link, input.unwrap_or(Value::Null)),
                Some((first, rest)) => {
                    let mut next = rest.to_vec();
                    next.extend(link.next);
                    let inner = Link {
                        next,
                        join: link.join,
                        errback: link.errback,
                    };
                    self.schedule(conn, first, input, inner)
                }
            },
            Signature::Chord { header, body } => {
                if header.is_empty() {
                    return self.schedule(conn, body, Some(Value::Array(Vec::new())), link);
                }
                let chord_id = Uuid::new_v4();
                let now = now_millis();
                conn.execute(
                    "INSERT INTO task_chords (id, size, body_json, link_json, state, deadline, created_at) \
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
                    params![
                        chord_id.to_string(),
                        header.len() as i64,
                        serde_json::to_string(body.as_ref())?,
                        serde_json::to_string(&link)?,
                        now + (self.settings.chord_timeout_secs as i64) * 1000,
                        now
                    ],
                )
                .map_err(db_err)?;
                debug!("Chord {} created with {} members", chord_id, header.len());
                for (index, member) in header.iter().enumerate() {
                    let member_link = Link {
                        next: Vec::new(),
                        join: Some(JoinSlot { chord_id, index }),
                        errback: link.errback.clone(),
                    };
                    self.schedule(conn, member, input.clone(), member_link)?;
                }
                Ok(())
            }
        }
    }

    /// Deliver a finished value along a link.
    fn resolve(&self, conn: &Connection, link: Link, value: Value) -> Result<()> {
        if let Some((first, rest)) = link.next.split_first() {
            let inner = Link {
                next: rest.to_vec(),
                join: link.join,
                errback: link.errback.clone(),
            };
            return self.schedule(conn, first, Some(value), inner);
        }
        match link.join {
            Some(join) => self.fill_slot(conn, join, value),
            None => Ok(()),
        }
    }

    fn fill_slot(&self, conn: &Connection, join: JoinSlot, value: Value) -> Result<()> {
        let chord: Option<(String, i64, String, String)> = conn
            .query_row(
                "SELECT state, size, body_json, link_json FROM task_chords WHERE id = ?1",
                params![join.chord_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(db_err)?;
        let Some((state, size, body_json, link_json)) = chord else {
            warn!("Result for unknown chord {}", join.chord_id);
            return Ok(());
        };
        if state != "pending" {
            debug!("Chord {} is {}, dropping result {}", join.chord_id, state, join.index);
            return Ok(());
        }

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO task_chord_slots (chord_id, slot_index, result_json) \
                 VALUES (?1, ?2, ?3)",
                params![
                    join.chord_id.to_string(),
                    join.index as i64,
                    serde_json::to_string(&value)?
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            debug!("Chord {} slot {} already filled", join.chord_id, join.index);
            return Ok(());
        }

        let (filled, _) = chord_progress(conn, join.chord_id)?;
        if filled < size as usize {
            return Ok(());
        }

        let fired = conn
            .execute(
                "UPDATE task_chords SET state = 'fired' WHERE id = ?1 AND state = 'pending'",
                params![join.chord_id.to_string()],
            )
            .map_err(db_err)?;
        if fired == 0 {
            return Ok(());
        }

        let results: Vec<Value> = {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT result_json FROM task_chord_slots WHERE chord_id = ?1 ORDER BY slot_index",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![join.chord_id.to_string()], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            let raw = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?;
            raw.iter()
                .map(|r| serde_json::from_str(r))
                .collect::<std::result::Result<Vec<Value>, _>>()?
        };
        let body: Signature = serde_json::from_str(&body_json)?;
        let link: Link = serde_json::from_str(&link_json)?;
        debug!("Chord {} complete, firing body", join.chord_id);
        self.schedule(conn, &body, Some(Value::Array(results)), link)
    }

    /// Mark a chord failed; the first transition runs its errback.
    fn fail_chord(&self, conn: &Connection, chord_id: Uuid, message: &str) -> Result<()> {
        let changed = conn
            .execute(
                "UPDATE task_chords SET state = 'failed' WHERE id = ?1 AND state = 'pending'",
                params![chord_id.to_string()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            debug!("Chord {} already settled, not running errback again", chord_id);
            return Ok(());
        }
        let link_json: String = conn
            .query_row(
                "SELECT link_json FROM task_chords WHERE id = ?1",
                params![chord_id.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let link: Link = serde_json::from_str(&link_json)?;
        if let Some(errback) = &link.errback {
            enqueue_errback(conn, errback, message)?;
        }
        Ok(())
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::from(e)
}

fn insert_message(conn: &Connection, envelope: &Envelope) -> Result<()> {
    let now = now_millis();
    conn.execute(
        "INSERT INTO task_messages (id, name, payload_json, attempts, available_at, created_at) \
         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        params![
            Uuid::new_v4().to_string(),
            envelope.call.name,
            serde_json::to_string(envelope)?,
            now
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn enqueue_errback(conn: &Connection, errback: &TaskCall, message: &str) -> Result<()> {
    info!("Enqueuing error link {}: {}", errback.name, message);
    insert_message(
        conn,
        &Envelope {
            call: errback.clone(),
            input: Some(Value::String(message.to_string())),
            link: Link::default(),
        },
    )
}

fn delete_message(conn: &Connection, id: Uuid) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM task_messages WHERE id = ?1", params![id.to_string()])
        .map_err(db_err)?;
    Ok(n > 0)
}

fn chord_progress(conn: &Connection, chord_id: Uuid) -> Result<(usize, usize)> {
    conn.query_row(
        "SELECT (SELECT COUNT(*) FROM task_chord_slots WHERE chord_id = ?1), size \
         FROM task_chords WHERE id = ?1",
        params![chord_id.to_string()],
        |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize)),
    )
    .map_err(db_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use closet_core::RetrySettings;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_queue(settings: QueueSettings) -> (TaskQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::open(dir.path(), settings).unwrap();
        (queue, dir)
    }

    fn fast_settings() -> QueueSettings {
        QueueSettings {
            retry: RetrySettings {
                max_retries: 2,
                base_delay_ms: 0,
                max_delay_ms: 0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_submit_once_per_key() {
        let (queue, _dir) = test_queue(fast_settings());
        let sig = Signature::task("a", json!({}));
        assert!(queue.submit_once("job-1", &sig, None).unwrap());
        assert!(!queue.submit_once("job-1", &sig, None).unwrap());
        assert!(queue.submit_once("job-2", &sig, None).unwrap());
        assert_eq!(queue.pending_count().unwrap(), 2);

        // Still refused once the first submission has run
        let delivery = queue.claim().unwrap().unwrap();
        queue.complete(&delivery, TaskOutput::Value(json!(null))).unwrap();
        assert!(!queue.submit_once("job-1", &sig, None).unwrap());
    }

    #[test]
    fn test_claim_leases_message() {
        let (queue, _dir) = test_queue(fast_settings());
        queue.submit(&Signature::task("a", json!({"x": 1})), None).unwrap();

        let delivery = queue.claim().unwrap().unwrap();
        assert_eq!(delivery.call.name, "a");
        assert_eq!(delivery.call.args["x"], 1);
        assert!(queue.claim().unwrap().is_none());
        assert_eq!(queue.pending_count().unwrap(), 1);

        assert!(queue.complete(&delivery, TaskOutput::Value(json!(null))).unwrap());
        assert_eq!(queue.pending_count().unwrap(), 0);
        // Second settle of the same delivery is a no-op
        assert!(!queue.complete(&delivery, TaskOutput::Value(json!(null))).unwrap());
    }

    #[test]
    fn test_expired_lease_is_redelivered() {
        let (queue, _dir) = test_queue(QueueSettings {
            visibility_timeout_secs: 0,
            ..fast_settings()
        });
        queue.submit(&Signature::task("a", json!({})), None).unwrap();
        let first = queue.claim().unwrap().unwrap();
        let second = queue.claim().unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.attempts, 0);
        assert_eq!(second.attempts, 1);
    }

    #[test]
    fn test_lost_leases_exhaust_retries() {
        let (queue, _dir) = test_queue(QueueSettings {
            visibility_timeout_secs: 0,
            ..fast_settings()
        });
        queue
            .submit(
                &Signature::task("crashes", json!({})),
                Some(TaskCall::new("on_error", json!({"job": 7}))),
            )
            .unwrap();

        // Claimed and never settled, as if the worker died each time
        for expected in 0..=2 {
            let d = queue.claim().unwrap().unwrap();
            assert_eq!(d.call.name, "crashes");
            assert_eq!(d.attempts, expected);
        }

        let mut errback = None;
        for _ in 0..10 {
            if let Some(d) = queue.claim().unwrap() {
                errback = Some(d);
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        let errback = errback.unwrap();
        assert_eq!(errback.call.name, "on_error");
        assert_eq!(errback.call.args["job"], 7);
        assert!(errback
            .input
            .as_ref()
            .unwrap()
            .as_str()
            .unwrap()
            .contains("did not finish after 3 attempts"));
        queue.complete(&errback, TaskOutput::Value(json!(null))).unwrap();
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_busy_database_is_retried() {
        let (queue, _dir) = test_queue(fast_settings());
        queue
            .submit(&Signature::task("t", json!({})), Some(TaskCall::new("on_error", json!({}))))
            .unwrap();
        let d = queue.claim().unwrap().unwrap();
        let outcome = queue
            .fail(&d, &Error::DatabaseBusy("database is locked".into()))
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Retrying { attempt: 1, .. }));
        assert_eq!(queue.claim().unwrap().unwrap().call.name, "t");
    }

    #[test]
    fn test_chain_passes_result_forward() {
        let (queue, _dir) = test_queue(fast_settings());
        let sig = Signature::task("a", json!({})).then(Signature::task("b", json!({})));
        queue.submit(&sig, None).unwrap();

        let a = queue.claim().unwrap().unwrap();
        assert_eq!(a.call.name, "a");
        assert!(a.input.is_none());
        queue.complete(&a, TaskOutput::Value(json!(42))).unwrap();

        let b = queue.claim().unwrap().unwrap();
        assert_eq!(b.call.name, "b");
        assert_eq!(b.input, Some(json!(42)));
    }

    #[test]
    fn test_chord_body_gets_ordered_results_once() {
        let (queue, _dir) = test_queue(fast_settings());
        let sig = Signature::chord(
            vec![
                Signature::task("m", json!({"i": 0})),
                Signature::task("m", json!({"i": 1})),
            ],
            Signature::task("body", json!({})),
        );
        queue.submit(&sig, None).unwrap();

        let m0 = queue.claim().unwrap().unwrap();
        let m1 = queue.claim().unwrap().unwrap();
        // Finish out of order
        queue.complete(&m1, TaskOutput::Value(json!("one"))).unwrap();
        assert!(queue.claim().unwrap().is_none());
        queue.complete(&m0, TaskOutput::Value(json!("zero"))).unwrap();

        let body = queue.claim().unwrap().unwrap();
        assert_eq!(body.call.name, "body");
        assert_eq!(body.input, Some(json!(["zero", "one"])));
        queue.complete(&body, TaskOutput::Value(json!(null))).unwrap();
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_empty_chord_runs_body() {
        let (queue, _dir) = test_queue(fast_settings());
        queue
            .submit(&Signature::chord(vec![], Signature::task("body", json!({}))), None)
            .unwrap();
        let body = queue.claim().unwrap().unwrap();
        assert_eq!(body.input, Some(json!([])));
    }

    #[test]
    fn test_replace_inherits_link() {
        let (queue, _dir) = test_queue(fast_settings());
        let sig = Signature::task("outer", json!({})).then(Signature::task("after", json!({})));
        queue.submit(&sig, Some(TaskCall::new("on_error", json!({})))).unwrap();

        let outer = queue.claim().unwrap().unwrap();
        queue
            .complete(&outer, TaskOutput::Replace(Signature::task("inner", json!({}))))
            .unwrap();
        let inner = queue.claim().unwrap().unwrap();
        assert_eq!(inner.call.name, "inner");
        assert_eq!(inner.link.next.len(), 1);
        assert_eq!(inner.link.errback.as_ref().unwrap().name, "on_error");
    }

    #[test]
    fn test_retry_then_errback() {
        let (queue, _dir) = test_queue(fast_settings());
        queue
            .submit(
                &Signature::task("flaky", json!({})),
                Some(TaskCall::new("on_error", json!({"job": 1}))),
            )
            .unwrap();

        let err = Error::Service("connection refused".into());
        for attempt in 1..=2 {
            let d = queue.claim().unwrap().unwrap();
            assert_eq!(d.call.name, "flaky");
            let outcome = queue.fail(&d, &err).unwrap();
            assert!(matches!(outcome, FailureOutcome::Retrying { attempt: a, .. } if a == attempt));
        }
        let d = queue.claim().unwrap().unwrap();
        assert_eq!(d.attempts, 2);
        assert_eq!(queue.fail(&d, &err).unwrap(), FailureOutcome::Failed);

        let errback = queue.claim().unwrap().unwrap();
        assert_eq!(errback.call.name, "on_error");
        assert_eq!(errback.call.args["job"], 1);
        let message = errback.input.clone().unwrap();
        assert!(message.as_str().unwrap().contains("connection refused"));
    }

    #[test]
    fn test_business_error_is_not_retried() {
        let (queue, _dir) = test_queue(fast_settings());
        queue
            .submit(&Signature::task("t", json!({})), Some(TaskCall::new("on_error", json!({}))))
            .unwrap();
        let d = queue.claim().unwrap().unwrap();
        let outcome = queue
            .fail(&d, &Error::NoItemsDetected("img".into()))
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Failed);
        assert_eq!(queue.claim().unwrap().unwrap().call.name, "on_error");
    }

    #[test]
    fn test_chord_member_failure_runs_errback_once() {
        let (queue, _dir) = test_queue(fast_settings());
        let sig = Signature::chord(
            vec![Signature::task("m", json!({})), Signature::task("m", json!({}))],
            Signature::task("body", json!({})),
        );
        queue.submit(&sig, Some(TaskCall::new("on_error", json!({})))).unwrap();

        let m0 = queue.claim().unwrap().unwrap();
        let m1 = queue.claim().unwrap().unwrap();
        let err = Error::Validation("bad".into());
        queue.fail(&m0, &err).unwrap();
        queue.fail(&m1, &err).unwrap();

        let errback = queue.claim().unwrap().unwrap();
        assert_eq!(errback.call.name, "on_error");
        queue.complete(&errback, TaskOutput::Value(json!(null))).unwrap();
        assert!(queue.claim().unwrap().is_none());
    }

    #[test]
    fn test_chord_timeout_fires_errback() {
        let (queue, _dir) = test_queue(QueueSettings {
            chord_timeout_secs: 0,
            ..fast_settings()
        });
        let sig = Signature::chord(
            vec![Signature::task("m", json!({}))],
            Signature::task("body", json!({})),
        );
        queue.submit(&sig, Some(TaskCall::new("on_error", json!({})))).unwrap();
        assert_eq!(queue.sweep_expired_chords().unwrap(), 1);
        assert_eq!(queue.sweep_expired_chords().unwrap(), 0);

        // The late member result is dropped; only the errback remains
        let member = queue.claim().unwrap().unwrap();
        assert_eq!(member.call.name, "m");
        queue.complete(&member, TaskOutput::Value(json!(1))).unwrap();
        let errback = queue.claim().unwrap().unwrap();
        assert_eq!(errback.call.name, "on_error");
        assert!(errback.input.as_ref().unwrap().as_str().unwrap().contains("Timed out"));
        queue.complete(&errback, TaskOutput::Value(json!(null))).unwrap();
        assert!(queue.claim().unwrap().is_none());
    }
}
