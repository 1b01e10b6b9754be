//! Integration test: serve a stub backend on a free port and drive the engine over real HTTP
//! with a file store in a temp directory. The server task is left running when the test ends.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use willow::backend::{Backend, HttpBackend};
use willow::engine::{ConversationEngine, EngineError, EngineSettings, RestoreOutcome, SendOutcome};
use willow::leads::LeadBook;
use willow::store::{FileStore, Store, SESSION_KEY};

#[derive(Clone, Default)]
struct Stub {
    fail_talk: Arc<AtomicBool>,
    talk_messages: Arc<Mutex<Vec<String>>>,
    lead_calls: Arc<AtomicUsize>,
    reset_calls: Arc<AtomicUsize>,
}

async fn talk(
    State(stub): State<Stub>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let message = body
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    stub.talk_messages.lock().unwrap().push(message.clone());
    if stub.fail_talk.load(Ordering::SeqCst) {
        return Err((StatusCode::BAD_GATEWAY, "upstream down".to_string()));
    }
    Ok(Json(json!({
        "reply": format!("You said: {}", message),
        "lead": {"company": "Acme"},
        "end": message.contains("bye"),
        "showImage": false,
        "audio_url": "/audio/reply.wav",
    })))
}

async fn lead(State(stub): State<Stub>, Json(_body): Json<Value>) -> Json<Value> {
    stub.lead_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({"lead": {"company": "Acme", "summary": "Acme needs a CRM rollout"}}))
}

async fn reset(State(stub): State<Stub>) -> Json<Value> {
    stub.reset_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({"ok": true}))
}

async fn start_stub() -> (String, Stub) {
    let stub = Stub::default();
    let app = Router::new()
        .route("/talk", post(talk))
        .route("/lead", post(lead))
        .route("/reset", post(reset))
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let port = listener.local_addr().expect("local_addr").port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://127.0.0.1:{}", port), stub)
}

fn temp_store_dir() -> PathBuf {
    std::env::temp_dir().join(format!("willow-http-test-{}", uuid::Uuid::new_v4()))
}

#[tokio::test]
async fn exchange_over_http_persists_and_resumes() {
    let (base_url, stub) = start_stub().await;
    let dir = temp_store_dir();

    let mut engine = ConversationEngine::new(
        HttpBackend::new(base_url.clone()),
        FileStore::new(&dir),
        EngineSettings::default(),
    );
    assert_eq!(engine.restore().await, RestoreOutcome::Empty);
    let out = engine.send_user_message("hi").await.unwrap();
    assert_eq!(out, SendOutcome::Delivered { reply: "You said: hi".into() });
    assert_eq!(engine.lead().and_then(|l| l.company.as_deref()), Some("Acme"));
    assert!(engine.notice().is_none());

    let saved = engine.snapshot();
    let mut resumed = ConversationEngine::new(
        HttpBackend::new(base_url),
        FileStore::new(&dir),
        EngineSettings::default(),
    );
    assert_eq!(resumed.restore().await, RestoreOutcome::Resumed);
    assert_eq!(resumed.snapshot(), saved);
    assert_eq!(stub.talk_messages.lock().unwrap().clone(), vec!["hi"]);
}

#[tokio::test]
async fn non_success_status_becomes_retryable_notice() {
    let (base_url, stub) = start_stub().await;
    let mut engine = ConversationEngine::new(
        HttpBackend::new(base_url),
        FileStore::new(temp_store_dir()),
        EngineSettings::default(),
    );

    stub.fail_talk.store(true, Ordering::SeqCst);
    let err = engine.send_user_message("pricing?").await.unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)));
    assert!(err.to_string().contains("502"));
    assert!(engine.notice().is_some_and(|n| n.retryable));
    assert_eq!(engine.conversation().len(), 1);

    stub.fail_talk.store(false, Ordering::SeqCst);
    engine.retry().await.unwrap();
    assert_eq!(engine.conversation().len(), 2);
    assert_eq!(
        stub.talk_messages.lock().unwrap().clone(),
        vec!["pricing?", "pricing?"]
    );
}

#[tokio::test]
async fn closing_then_end_chat_stores_one_lead_and_resets_backend() {
    let (base_url, stub) = start_stub().await;
    let dir = temp_store_dir();
    let mut engine = ConversationEngine::new(
        HttpBackend::new(base_url),
        FileStore::new(&dir),
        EngineSettings::default(),
    );

    engine.send_user_message("thanks, bye").await.unwrap();
    assert!(engine.ended());
    engine.end_chat().await;

    assert_eq!(stub.lead_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stub.reset_calls.load(Ordering::SeqCst), 1);
    assert!(engine.conversation().is_empty());

    let store = FileStore::new(&dir);
    assert!(store.load(SESSION_KEY).await.unwrap().is_none());
    let leads = LeadBook::new(&store).list().await.unwrap();
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].summary, "Acme needs a CRM rollout");
}

#[tokio::test]
async fn relative_audio_url_is_resolved_against_base() {
    let (base_url, _stub) = start_stub().await;
    let backend = HttpBackend::new(base_url.clone());
    let r = backend.talk("hello").await.unwrap();
    assert_eq!(r.audio_url, Some(format!("{}/audio/reply.wav", base_url)));
}
