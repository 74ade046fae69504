mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{Harness, JAVAC, java_sources, next_event, test_config};
use vmexec::compile::source_hash;
use vmexec::error::Reason;
use vmexec::protocol::SourceFiles;
use vmexec::vm::{TerminationReason, VmRole, VmState};

#[tokio::test]
async fn test_identical_sources_compile_once() {
    let h = Harness::new(test_config());
    let ct = CancellationToken::new();
    let files = java_sources("public static void main(String[] a) {}");

    let first = h.compiler.compile(Uuid::new_v4(), &files, &ct).await.unwrap();
    let second = h.compiler.compile(Uuid::new_v4(), &files, &ct).await.unwrap();

    assert!(first.vm_id.is_some());
    assert_eq!(second.vm_id, None);
    assert!(Arc::ptr_eq(&first.artifact, &second.artifact));
    assert_eq!(first.artifact.source_hash, source_hash(&files));
    assert!(first.artifact.files.contains_key("Main.class"));

    let stats = h.compiler.stats();
    assert_eq!(stats.compiler_acquisitions, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(h.backend.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_compile_error_keeps_vm_healthy() {
    let h = Harness::new(test_config());
    let mut events = h.manager.subscribe();
    let ct = CancellationToken::new();

    let err = h
        .compiler
        .compile(Uuid::new_v4(), &java_sources("int x = 1 syntax error"), &ct)
        .await
        .unwrap_err();
    assert_eq!(err.reason, Reason::Compilation);
    assert_eq!(err.status_code(), 400);
    assert!(err.message.contains("';' expected"));
    assert!(!err.is_fault());

    // the compiler VM went back to the pool
    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.vms.len(), 1);
    assert_eq!(snapshot.vms[0].role, VmRole::Compiler);
    assert_eq!(snapshot.vms[0].state, VmState::Idle);
    assert!(events.try_recv().is_err());

    // failures are not cached
    let again = h
        .compiler
        .compile(Uuid::new_v4(), &java_sources("int x = 1 syntax error"), &ct)
        .await;
    assert!(again.is_err());
    assert_eq!(h.compiler.stats().cache_hits, 0);
    assert_eq!(h.backend.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_bundles_rejected_without_vm() {
    let h = Harness::new(test_config());
    let ct = CancellationToken::new();

    let err = h
        .compiler
        .compile(Uuid::new_v4(), &SourceFiles::new(), &ct)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_ARGUMENT");

    let too_many: SourceFiles = (0..=h.config.limits.max_file_count)
        .map(|i| (format!("F{i}.java"), String::new()))
        .collect();
    let err = h
        .compiler
        .compile(Uuid::new_v4(), &too_many, &ct)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_ARGUMENT");

    let escaping = SourceFiles::from([("../Main.java".to_string(), String::new())]);
    assert!(h.compiler.validate(&escaping).is_err());

    assert_eq!(h.backend.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_health_check_reports_hashes() {
    let mut config = test_config();
    config.health_check.files_to_check = vec![JAVAC.to_string()];
    let h = Harness::new(config);
    let ct = CancellationToken::new();

    let (report, vm_id) = h
        .compiler
        .health_check(Uuid::new_v4(), Vec::new(), &ct)
        .await
        .unwrap();
    assert_eq!(report.file_hashes.get(JAVAC).map(String::as_str), Some("aaaa"));
    assert_eq!(h.manager.vm_state(vm_id), Some(VmState::Idle));
}

#[tokio::test]
async fn test_health_check_mismatch_retires_compiler() {
    let mut config = test_config();
    config.health_check.files_to_check = vec![JAVAC.to_string()];
    let h = Harness::new(config);
    let mut events = h.manager.subscribe();
    let ct = CancellationToken::new();

    assert_eq!(h.compiler.warm_up().await, 0);
    assert_eq!(h.manager.warm_up(VmRole::Compiler, 1).await, 1);
    h.backend.set_toolchain_hash(JAVAC, "tampered");

    let (report, vm_id) = h
        .compiler
        .health_check(Uuid::new_v4(), vec![JAVAC.to_string()], &ct)
        .await
        .unwrap();
    assert_eq!(report.file_hashes.get(JAVAC).map(String::as_str), Some("tampered"));

    let event = next_event(&mut events).await;
    assert_eq!(event.vm_id, vm_id);
    assert_eq!(event.reason, TerminationReason::HealthCheckFailed);
}
