mod common;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

use common::{Behavior, ScriptedAgent};
use dagweave::schema::{DataSchema, FieldType};
use dagweave::storage::{PersistencePort, SqliteStore};
use dagweave::types::{NodeStatus, TransformMethod};
use dagweave::{Chain, DagOrchestrator, ExecuteOptions, Node, RunStatus};

fn chain() -> Chain {
    Chain::new("persisted")
        .node(Node::agent("Summarizer", "agents/summarizer"))
        .node(
            Node::agent("Sentiment", "agents/sentiment")
                .with_input_schema(DataSchema::new().require("text", FieldType::String)),
        )
        .edge("Summarizer", "Sentiment")
}

fn agent() -> Arc<ScriptedAgent> {
    Arc::new(
        ScriptedAgent::new()
            .on("agents/summarizer", Behavior::Respond(json!({"summary": "ok"})))
            .on("agents/sentiment", Behavior::Respond(json!({"label": "positive"}))),
    )
}

#[tokio::test]
async fn test_replay_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs").join("dagweave.db");
    let options = || ExecuteOptions::new().with_run_id("durable-run");

    // 1. First process: run the chain and learn the summary -> text recipe
    let first_agent = agent();
    let first = {
        let store: Arc<dyn PersistencePort> = Arc::new(SqliteStore::open(&path).unwrap());
        DagOrchestrator::new(store, first_agent.clone())
            .execute(&chain(), json!({"text": "long"}), options())
            .await
            .unwrap()
    };
    assert_eq!(first.status(), RunStatus::Succeeded);
    assert_eq!(first_agent.call_count(), 2);

    // 2. Second process on the same file: nothing is called again
    let second_agent = agent();
    let store: Arc<dyn PersistencePort> = Arc::new(SqliteStore::open(&path).unwrap());
    let second = DagOrchestrator::new(store.clone(), second_agent.clone())
        .execute(&chain(), json!({"text": "long"}), options())
        .await
        .unwrap();

    assert_eq!(second_agent.call_count(), 0);
    assert_eq!(first.output(), second.output());
    let sentiment = second.run.telemetry_for("Sentiment").unwrap();
    assert_eq!(sentiment.status, NodeStatus::Replayed);
    assert!(matches!(
        sentiment.method,
        Some(TransformMethod::CachedRecipe { .. })
    ));

    // 3. The stored run is the latest one, with real timestamps
    let stored = store.load_run("durable-run").await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Succeeded);
    assert!(stored.finished_at.unwrap() > stored.started_at.unwrap());
    let value = serde_json::to_value(&stored).unwrap();
    assert!(!value.to_string().contains("\"None\""));
}

#[tokio::test]
async fn test_failed_calls_are_logged_but_not_replayed() {
    let store: Arc<dyn PersistencePort> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let failing = Arc::new(ScriptedAgent::new().on("agents/summarizer", Behavior::Fail("503".into())));
    let result = DagOrchestrator::new(store.clone(), failing.clone())
        .execute(&chain(), json!({"text": "long"}), ExecuteOptions::new().with_run_id("retry-run"))
        .await
        .unwrap();
    assert_eq!(result.status(), RunStatus::Failed);

    let key = result
        .run
        .telemetry_for("Summarizer")
        .unwrap()
        .idempotency_key
        .clone()
        .unwrap();
    assert!(store.find_execution(&key).await.unwrap().is_none());

    // A retry of the same run calls the agent again and succeeds
    let healthy = agent();
    let retry = DagOrchestrator::new(store, healthy.clone())
        .execute(&chain(), json!({"text": "long"}), ExecuteOptions::new().with_run_id("retry-run"))
        .await
        .unwrap();
    assert_eq!(retry.status(), RunStatus::Succeeded);
    assert_eq!(healthy.call_count(), 2);
}
