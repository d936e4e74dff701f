mod common;

use std::sync::Arc;

use common::{
    FlakyHistory, RecordingTelemetry, Script, harness, harness_with_storage,
    harness_with_telemetry, kinds, no_metadata,
};
use futures::StreamExt;
use serde_json::json;
use session_relay_core::{Agent, Event, ModelRef, NewSession, StorageProvider};
use session_relay_server::{QueryResult, ServerConfig, SessionError, TelemetrySink};
use session_relay_storage::{MemoryStorage, StorageConfig};
use session_relay_transport::ServerMessage;
use tokio_test::assert_ok;

fn exclusive() -> ServerConfig {
    ServerConfig {
        exclusive: true,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn test_run_persists_final_events_in_order() {
    let h = harness(ServerConfig::default()).await;
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();

    let result = h.registry.run_query(session.id(), "hi").await.unwrap();
    match &result {
        QueryResult::Success { response } => assert_eq!(response.content(), Some("hello")),
        QueryResult::Failure { error } => panic!("unexpected failure: {error:?}"),
    }

    // Streaming deltas stay out of the durable log.
    let events = h.registry.session_events(session.id()).await.unwrap();
    assert_eq!(kinds(&events), ["user_message", "assistant_message", "final_answer"]);
    assert_eq!(events[0].content(), Some("hi"));

    let info = h.registry.session_info(session.id()).await.unwrap();
    assert!(info.updated_at > info.created_at);
    assert_eq!(info.version(), Some(1));
}

#[tokio::test]
async fn test_failed_run_becomes_value() {
    let h = harness(ServerConfig::default()).await;
    *h.agents.script.lock().unwrap() = Some(Script::Fail);
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();

    let result = h.registry.run_query(session.id(), "hi").await.unwrap();
    assert!(!result.is_success());
    let error = result.error().unwrap();
    assert_eq!(error.code, "AGENT_EXECUTION_ERROR");
    assert!(!error.message.contains("sk-secret"));

    // The record is released even though the run failed.
    assert_eq!(h.registry.guard().running_session(), None);
    let events = h.registry.session_events(session.id()).await.unwrap();
    assert_eq!(kinds(&events), ["user_message", "system"]);
    assert_eq!(events[1].str_field("code"), Some("AGENT_EXECUTION_ERROR"));
    assert!(!events[1].str_field("message").unwrap().contains("sk-secret"));
}

#[tokio::test]
async fn test_streaming_yields_all_events_and_persists_finals() {
    let h = harness(ServerConfig::default()).await;
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();

    let events: Vec<_> = h
        .registry
        .run_query_streaming(session.id(), "hi")
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(
        kinds(&events),
        [
            "user_message",
            "assistant_streaming_message",
            "assistant_streaming_message",
            "assistant_message",
            "final_answer",
        ]
    );

    let stored = h.registry.session_events(session.id()).await.unwrap();
    assert_eq!(kinds(&stored), ["user_message", "assistant_message", "final_answer"]);
}

#[tokio::test]
async fn test_streaming_failure_ends_with_one_error_event() {
    let h = harness(ServerConfig::default()).await;
    *h.agents.script.lock().unwrap() = Some(Script::Fail);
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();

    let events: Vec<_> = h
        .registry
        .run_query_streaming(session.id(), "hi")
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events.len(), 3);
    let last = events.last().unwrap();
    assert!(last.is_error());
    assert_eq!(last.str_field("code"), Some("AGENT_EXECUTION_ERROR"));
    assert_eq!(events.iter().filter(|e| e.is_error()).count(), 1);
    assert_eq!(h.registry.guard().running_session(), None);

    let stored = h.registry.session_events(session.id()).await.unwrap();
    assert_eq!(kinds(&stored), ["user_message", "system"]);
}

#[tokio::test]
async fn test_dropping_stream_midway_releases_exclusive_record() {
    let h = harness(exclusive()).await;
    let a = h.registry.create_session("/work/a", no_metadata()).await.unwrap();
    let b = h.registry.create_session("/work/b", no_metadata()).await.unwrap();

    let mut stream = h.registry.run_query_streaming(a.id(), "hi").await.unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.kind.as_str(), "user_message");
    assert_eq!(h.registry.guard().running_session().as_deref(), Some(a.id()));

    drop(stream);
    assert!(h.registry.guard().can_accept_new_request());
    assert!(h.registry.run_query(b.id(), "next").await.unwrap().is_success());
    // The abandoned session accepts a new run too.
    assert!(h.registry.run_query(a.id(), "again").await.unwrap().is_success());
}

#[tokio::test]
async fn test_exclusive_mode_refuses_second_session_until_abort() {
    let h = harness(exclusive()).await;
    *h.agents.script.lock().unwrap() = Some(Script::Hang);
    let a = h.registry.create_session("/work/a", no_metadata()).await.unwrap();
    let b = h.registry.create_session("/work/b", no_metadata()).await.unwrap();

    let registry = Arc::clone(&h.registry);
    let a_id = a.id().to_owned();
    let run = tokio::spawn(async move { registry.run_query(&a_id, "long").await });
    h.agents.for_session(a.id()).wait_started().await;

    assert!(!h.registry.guard().can_accept_new_request());
    let refused = h.registry.run_query(b.id(), "hi").await;
    match refused {
        Err(SessionError::Busy(running)) => assert_eq!(running, a.id()),
        other => panic!("expected Busy, got {other:?}"),
    }
    // A stale clear for another session leaves the record alone.
    assert!(!h.registry.guard().clear_running_session(b.id()));
    assert_eq!(h.registry.guard().running_session().as_deref(), Some(a.id()));

    assert!(h.registry.abort_query(a.id()).await);
    assert!(h.registry.guard().can_accept_new_request());

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.error().unwrap().code, "ABORTED");

    h.agents.for_session(b.id()).set_script(Script::Answer);
    let result = h.registry.run_query(b.id(), "hi").await.unwrap();
    assert!(result.is_success());
}

#[tokio::test]
async fn test_abort_without_run_reports_false() {
    let h = harness(ServerConfig::default()).await;
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();
    assert!(!h.registry.abort_query(session.id()).await);
    assert!(!h.registry.abort_query("never-existed").await);
}

#[tokio::test]
async fn test_restore_converges_on_one_session() {
    let h = harness(ServerConfig::default()).await;
    h.registry
        .storage()
        .create_session(NewSession::with_id("stored", "/work/s"))
        .await
        .unwrap();
    assert!(!h.registry.active_ids().contains(&"stored".to_owned()));

    let (first, second) = tokio::join!(
        h.registry.get_or_restore("stored"),
        h.registry.get_or_restore("stored")
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.agents.count(), 1);
    assert_eq!(h.registry.active_ids(), vec!["stored".to_owned()]);
}

#[tokio::test]
async fn test_restore_unknown_session_is_not_found() {
    let h = harness(ServerConfig::default()).await;
    let Err(err) = h.registry.get_or_restore("ghost").await else {
        panic!("restored a session that was never stored");
    };
    assert!(matches!(err, SessionError::NotFound(ref id) if id == "ghost"));
    assert_eq!(err.code(), "SESSION_NOT_FOUND");
    assert!(h.registry.active_ids().is_empty());
}

#[tokio::test]
async fn test_stale_model_choice_falls_back_to_default() {
    let config = ServerConfig {
        available_models: vec![
            ModelRef::new("openai", "gpt-4o"),
            ModelRef::new("anthropic", "sonnet"),
        ],
        ..ServerConfig::default()
    };
    let h = harness(config).await;

    let mut stale = NewSession::with_id("old", "/work/o");
    stale
        .metadata
        .insert("modelConfig".into(), json!({ "provider": "retired", "modelId": "m-1", "configuredAt": 1 }));
    h.registry.storage().create_session(stale).await.unwrap();

    let session = assert_ok!(h.registry.get_or_restore("old").await);
    assert_eq!(session.model(), ModelRef::new("openai", "gpt-4o"));
    assert_eq!(h.agents.for_session("old").model.model_id, "gpt-4o");
}

#[tokio::test]
async fn test_update_model_config_applies_to_future_runs() {
    let config = ServerConfig {
        available_models: vec![
            ModelRef::new("openai", "gpt-4o"),
            ModelRef::new("anthropic", "sonnet"),
        ],
        ..ServerConfig::default()
    };
    let h = harness(config).await;
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();
    h.registry.run_query(session.id(), "first").await.unwrap();
    let before = h.registry.session_events(session.id()).await.unwrap();

    let info = h
        .registry
        .update_model_config(session.id(), ModelRef::new("anthropic", "sonnet"))
        .await
        .unwrap();
    let stored = info.model_config().unwrap();
    assert_eq!(ModelRef::from(&stored), ModelRef::new("anthropic", "sonnet"));
    assert_eq!(session.model().provider, "anthropic");

    // History is untouched.
    assert_eq!(h.registry.session_events(session.id()).await.unwrap(), before);

    let err = h
        .registry
        .update_model_config(session.id(), ModelRef::new("nobody", "nothing"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNKNOWN_MODEL");
}

#[tokio::test]
async fn test_update_model_config_on_inactive_session() {
    let h = harness(ServerConfig::default()).await;
    h.registry
        .storage()
        .create_session(NewSession::with_id("idle", "/work/i"))
        .await
        .unwrap();

    let info = h
        .registry
        .update_model_config("idle", ModelRef::new("anthropic", "sonnet"))
        .await
        .unwrap();
    assert_eq!(info.model_config().unwrap().provider, "anthropic");
    assert!(h.registry.active_ids().is_empty());

    let err = h
        .registry
        .update_model_config("ghost", ModelRef::new("anthropic", "sonnet"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_cascades_and_deactivates() {
    let h = harness(ServerConfig::default()).await;
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();
    let id = session.id().to_owned();
    h.registry.run_query(&id, "one").await.unwrap();
    h.registry.run_query(&id, "two").await.unwrap();

    assert!(h.registry.delete_session(&id).await.unwrap());
    assert!(h.agents.for_session(&id).is_disposed());
    assert!(!h.registry.active_ids().contains(&id));
    assert!(h.registry.session_events(&id).await.unwrap().is_empty());
    assert!(h.registry.list_sessions().await.unwrap().iter().all(|s| s.id != id));

    assert!(!h.registry.delete_session(&id).await.unwrap());
}

#[tokio::test]
async fn test_cleanup_notifies_viewers_and_keeps_data() {
    let h = harness(ServerConfig::default()).await;
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();
    let id = session.id().to_owned();
    h.registry.run_query(&id, "hi").await.unwrap();

    let (_, mut viewer) = session.bridge().channel();
    assert!(h.registry.cleanup_session(&id).await);
    assert!(!h.registry.cleanup_session(&id).await);

    let mut closed = false;
    while let Ok(message) = viewer.try_recv() {
        if let ServerMessage::Closed { session_id } = message {
            assert_eq!(session_id, id);
            closed = true;
        }
    }
    assert!(closed);
    assert!(h.agents.for_session(&id).is_disposed());

    // Restoring after cleanup builds a fresh agent over the same history.
    let restored = h.registry.get_or_restore(&id).await.unwrap();
    assert!(!Arc::ptr_eq(&restored, &session));
    assert_eq!(h.registry.session_events(&id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_history_degrades_on_transient_failure() -> anyhow::Result<()> {
    let storage: Arc<dyn StorageProvider> = Arc::new(FlakyHistory::new());
    let h = harness_with_storage(storage, &ServerConfig::default()).await;
    let session = h.registry.create_session("/work/a", no_metadata()).await?;
    h.registry.run_query(session.id(), "hi").await?;

    // Writes still land; only the history read is failing.
    assert!(h.registry.session_info(session.id()).await?.updated_at > 0);
    assert!(h.registry.session_events(session.id()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_list_sessions_most_recent_first() {
    let storage = Arc::new(MemoryStorage::new());
    for (id, at) in [("first", 1_000), ("second", 2_000)] {
        let mut new = NewSession::with_id(id, "/work").metadata("name", json!(id));
        new.created_at = Some(at);
        new.updated_at = Some(at);
        storage.create_session(new).await.unwrap();
    }
    let h = harness_with_storage(storage, &ServerConfig::default()).await;

    let listed = h.registry.list_sessions().await.unwrap();
    assert_eq!(listed[0].id, "second");

    h.registry.run_query("first", "bump").await.unwrap();
    let listed = h.registry.list_sessions().await.unwrap();
    assert_eq!(listed[0].id, "first");
    assert_eq!(listed[1].id, "second");
    assert_eq!(listed[0].name(), Some("first"));
}

#[tokio::test]
async fn test_shutdown_disposes_everything() {
    let h = harness_with_storage(
        Arc::new(MemoryStorage::new()),
        &ServerConfig {
            storage: StorageConfig::Memory,
            ..ServerConfig::default()
        },
    )
    .await;
    let a = h.registry.create_session("/work/a", no_metadata()).await.unwrap();
    let b = h.registry.create_session("/work/b", no_metadata()).await.unwrap();

    assert_ok!(h.registry.shutdown().await);
    assert!(h.agents.for_session(a.id()).is_disposed());
    assert!(h.agents.for_session(b.id()).is_disposed());
    assert!(h.registry.active_ids().is_empty());
}

#[tokio::test]
async fn test_cleanup_persists_events_already_emitted() {
    let h = harness(ServerConfig::default()).await;
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();
    let id = session.id().to_owned();

    let agent = h.agents.for_session(&id);
    for n in 0..5 {
        agent
            .event_stream()
            .push(Event::assistant_message(format!("late {n}")));
    }
    assert!(h.registry.cleanup_session(&id).await);

    let stored = h.registry.session_events(&id).await.unwrap();
    let contents: Vec<_> = stored.iter().filter_map(Event::content).collect();
    assert_eq!(contents, ["late 0", "late 1", "late 2", "late 3", "late 4"]);
}

#[tokio::test]
async fn test_telemetry_sees_every_event_and_is_flushed_on_cleanup() {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let sink: Arc<dyn TelemetrySink> = Arc::<RecordingTelemetry>::clone(&telemetry);
    let h = harness_with_telemetry(ServerConfig::default(), Some(sink)).await;
    let session = h.registry.create_session("/work/a", no_metadata()).await.unwrap();
    let id = session.id().to_owned();

    h.registry.run_query(&id, "hi").await.unwrap();

    // Streaming deltas reach telemetry even though storage skips them.
    assert_eq!(
        telemetry.kinds_for(&id),
        [
            "user_message",
            "assistant_streaming_message",
            "assistant_streaming_message",
            "assistant_message",
            "final_answer",
        ]
    );
    assert_eq!(h.registry.session_events(&id).await.unwrap().len(), 3);

    assert_eq!(telemetry.flush_count(), 0);
    h.registry.cleanup_session(&id).await;
    assert_eq!(telemetry.flush_count(), 1);
}
