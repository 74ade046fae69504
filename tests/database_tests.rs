use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vmexec::database::{
    SqliteBroker, audit_terminations, init_db, recent_terminations, record_termination,
};
use vmexec::queue::Broker;
use vmexec::vm::{TerminationReason, VmId, VmRole, VmTerminationEvent};

const QUEUE: &str = "code_execution_requests";

async fn open(dir: &TempDir) -> SqliteBroker {
    let pool = init_db(dir.path().join("test.sqlite3")).await.unwrap();
    SqliteBroker::new(pool, Some(Duration::from_millis(20)))
}

fn termination(reason: TerminationReason) -> VmTerminationEvent {
    VmTerminationEvent {
        vm_id: VmId::new(),
        role: VmRole::Executor,
        reason,
        terminated_at: Utc::now(),
        affected_jobs: vec![Uuid::new_v4()],
        lifetime_ms: 1500,
    }
}

#[tokio::test]
async fn test_publish_consume_ack() {
    let dir = TempDir::new().unwrap();
    let broker = open(&dir).await;
    broker.declare_queue(QUEUE).await.unwrap();
    broker.declare_queue(QUEUE).await.unwrap();

    broker.publish(QUEUE, b"first").await.unwrap();
    broker.publish(QUEUE, b"second").await.unwrap();

    let first = broker.consume(QUEUE).await.unwrap();
    assert_eq!(first.body, b"first");
    assert!(!first.redelivered);
    assert_eq!(broker.count(QUEUE, "unacked").await.unwrap(), 1);

    broker.ack(QUEUE, first.tag).await.unwrap();
    assert!(broker.ack(QUEUE, first.tag).await.is_err());

    let second = broker.consume(QUEUE).await.unwrap();
    assert_eq!(second.body, b"second");
    broker.ack(QUEUE, second.tag).await.unwrap();
    assert_eq!(broker.count(QUEUE, "ready").await.unwrap(), 0);
}

#[tokio::test]
async fn test_consume_waits_for_publish() {
    let dir = TempDir::new().unwrap();
    let broker = std::sync::Arc::new(open(&dir).await);

    let consumer = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.consume(QUEUE).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!consumer.is_finished());

    broker.publish(QUEUE, b"late").await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.body, b"late");
}

#[tokio::test]
async fn test_nack_requeues_or_dead_letters() {
    let dir = TempDir::new().unwrap();
    let broker = open(&dir).await;
    broker.publish(QUEUE, b"retry me").await.unwrap();

    let delivery = broker.consume(QUEUE).await.unwrap();
    broker.nack(QUEUE, delivery.tag, true).await.unwrap();

    let again = broker.consume(QUEUE).await.unwrap();
    assert_eq!(again.tag, delivery.tag);
    assert!(again.redelivered);

    broker.nack(QUEUE, again.tag, false).await.unwrap();
    assert_eq!(broker.count(QUEUE, "dead").await.unwrap(), 1);
    assert_eq!(broker.count(QUEUE, "ready").await.unwrap(), 0);
    assert!(broker.nack(QUEUE, again.tag, true).await.is_err());
}

#[tokio::test]
async fn test_reopen_returns_unacked_messages() {
    let dir = TempDir::new().unwrap();
    {
        let broker = open(&dir).await;
        broker.publish(QUEUE, b"in flight").await.unwrap();
        broker.consume(QUEUE).await.unwrap();
        broker.pool().close().await;
    }

    let broker = open(&dir).await;
    assert_eq!(broker.count(QUEUE, "unacked").await.unwrap(), 0);
    let delivery = broker.consume(QUEUE).await.unwrap();
    assert_eq!(delivery.body, b"in flight");
    assert!(delivery.redelivered);
}

#[tokio::test]
async fn test_termination_audit_log() {
    let dir = TempDir::new().unwrap();
    let broker = open(&dir).await;
    let pool = broker.pool().clone();

    let event = termination(TerminationReason::Error);
    record_termination(&event, &pool).await.unwrap();

    let (tx, rx) = broadcast::channel(8);
    let token = CancellationToken::new();
    let audit = tokio::spawn(audit_terminations(pool.clone(), rx, token.clone()));
    tx.send(termination(TerminationReason::IdleTimeout)).unwrap();
    tx.send(termination(TerminationReason::Orphaned)).unwrap();
    token.cancel();
    audit.await.unwrap();

    let records = recent_terminations(10, &pool).await.unwrap();
    assert_eq!(records.len(), 3);

    let recorded = records
        .iter()
        .find(|r| r.vm_id == event.vm_id.to_string())
        .unwrap();
    assert_eq!(recorded.role, "executor");
    assert_eq!(recorded.reason, "Error");
    assert_eq!(recorded.lifetime_ms, 1500);
    let jobs: Vec<Uuid> = serde_json::from_str(&recorded.affected_jobs).unwrap();
    assert_eq!(jobs, event.affected_jobs);

    assert_eq!(recent_terminations(1, &pool).await.unwrap().len(), 1);
}
