//! HTTP surface tests. Drive the router in-process and check the JSON
//! shapes of the chat, health, status and document interfaces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use futures::future::BoxFuture;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tower::ServiceExt;

use campuskb_chat::{ExtractiveGenerator, LLMConfig};
use campuskb_core::AppConfig;
use campuskb_infer::HashingEmbedder;
use campuskb_runtime::{HealthProbe, SystemClock, DEGRADED_MESSAGE};
use campuskb_server::{build_router, AppState, Backends};

struct SwitchProbe(AtomicBool);

impl HealthProbe for SwitchProbe {
    fn probe(&self) -> BoxFuture<'_, Result<(), String>> {
        let healthy = self.0.load(Ordering::SeqCst);
        Box::pin(async move {
            if healthy {
                Ok(())
            } else {
                Err("backend down".into())
            }
        })
    }
}

struct TestApp {
    router: Router,
    _dir: tempfile::TempDir,
}

fn app(healthy: bool) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::with_defaults(dir.path()).unwrap();
    let llm_config = Arc::new(RwLock::new(LLMConfig::read(
        &config.data_paths.llm_config_file,
    )));
    let backends = Backends {
        embedder: Arc::new(HashingEmbedder::new(config.index.embedding_dim)),
        probe: Arc::new(SwitchProbe(AtomicBool::new(healthy))),
        clock: Arc::new(SystemClock),
        generator: Arc::new(ExtractiveGenerator::new()),
    };
    let state = AppState::with_backends(config, llm_config, backends).unwrap();
    TestApp {
        router: build_router(Arc::new(state)),
        _dir: dir,
    }
}

async fn call(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

const BOUNDARY: &str = "campuskb-test-boundary";

/// One-page PDF with a single line of Courier text.
fn pdf_with_text(text: &str) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![72.into(), 700.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

/// multipart/form-data body: `(name, file name, bytes)` parts.
fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, file_name, bytes) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    name, file_name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
            ),
        }
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn upload(app: &TestApp, body: Vec<u8>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/documents/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn seed(app: &TestApp) -> Value {
    let (status, summary) = call(
        app,
        Method::POST,
        "/api/documents",
        Some(json!({
            "documents": [
                {"title": "Calendar", "content": "Classes start Monday. Labs start Tuesday."},
                {"title": "Library", "content": "The library is open 24/7.", "source": "library.example.edu"},
                {"title": "Broken", "source_type": "structured_page", "content": "{not json"}
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    summary
}

#[tokio::test]
async fn test_liveness() {
    let app = app(true);
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_ingest_summary_shape() {
    let app = app(true);
    let summary = seed(&app).await;
    assert_eq!(summary["ingested"], 2);
    assert_eq!(summary["replaced"], 0);
    assert_eq!(summary["skipped"], 0);
    assert_eq!(summary["failed"][0]["document"], "Broken");
    assert!(summary["failed"][0]["reason"].is_string());

    let again = seed(&app).await;
    assert_eq!(again["skipped"], 2);
}

#[tokio::test]
async fn test_chat_response_shape() {
    let app = app(true);
    seed(&app).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/chat",
        Some(json!({
            "message": "when do labs start",
            "options": {"conversationId": "c1", "persona": "student"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["response"].as_str().unwrap().contains("Labs start Tuesday"));
    assert_eq!(body["grounded"], true);
    assert_eq!(body["degraded"], false);
    assert_eq!(body["conversation_id"], "c1");
    assert_eq!(body["sources"][0]["title"], "Calendar");
    assert!(body["sources"].as_array().unwrap().len() <= 3);

    let (status, conversation) = call(&app, Method::GET, "/api/conversations/c1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conversation["messages"].as_array().unwrap().len(), 2);
    assert_eq!(conversation["messages"][0]["role"], "user");

    let (status, _) = call(&app, Method::GET, "/api/conversations/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chat_errors_are_typed() {
    let app = app(true);

    let (status, body) = call(&app, Method::POST, "/api/chat", Some(json!({"message": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_request");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/chat",
        Some(json!({
            "message": "hello",
            "options": {"traits": {"creativity": 250}}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn test_degraded_when_backend_down() {
    let app = app(false);
    seed(&app).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/chat",
        Some(json!({"message": "when do labs start"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["degraded"], true);
    assert_eq!(body["response"], DEGRADED_MESSAGE);
    assert!(body["conversation_id"].is_string());

    let (_, health) = call(&app, Method::GET, "/api/health", None).await;
    assert_eq!(health["available"], false);
    assert_eq!(health["state"], "unavailable");
}

#[tokio::test]
async fn test_health_and_status_shapes() {
    let app = app(true);
    let (_, status) = call(&app, Method::GET, "/api/status", None).await;
    assert_eq!(status["gate"]["state"], "unknown");
    assert_eq!(status["gate"]["probes"], 0);

    let (code, health) = call(&app, Method::GET, "/api/health", None).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(health["available"], true);
    assert!(health["checked_at_age_secs"].is_number());

    seed(&app).await;
    call(&app, Method::POST, "/api/chat", Some(json!({"message": "when do labs start"}))).await;

    let (_, status) = call(&app, Method::GET, "/api/status", None).await;
    assert_eq!(status["gate"]["state"], "available");
    assert_eq!(status["pipeline"]["queries_served"], 1);
    assert_eq!(status["pipeline"]["grounded_answers"], 1);
    assert!(status["pipeline"]["avg_retrieval_ms"].is_number());
    assert_eq!(status["index"]["chunks"], 2);
    assert_eq!(status["index"]["metric"], "cosine");
    assert_eq!(status["corpus"]["total_documents"], 2);
}

#[tokio::test]
async fn test_document_management() {
    let app = app(true);
    seed(&app).await;

    let (status, list) = call(&app, Method::GET, "/api/documents", None).await;
    assert_eq!(status, StatusCode::OK);
    let docs = list.as_array().unwrap();
    assert_eq!(docs.len(), 2);
    let id = docs
        .iter()
        .find(|d| d["title"] == "Library")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, detail) = call(&app, Method::GET, &format!("/api/documents/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["document"]["logical_key"], "library");
    assert_eq!(detail["chunks"][0]["text"], "The library is open 24/7.");

    let (status, _) = call(&app, Method::DELETE, &format!("/api/documents/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = call(&app, Method::DELETE, &format!("/api/documents/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");

    let (status, rebuilt) = call(&app, Method::POST, "/api/index/rebuild", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rebuilt["documents"], 1);
}

#[tokio::test]
async fn test_pdf_upload_is_searchable() {
    let app = app(true);
    let pdf = pdf_with_text("Labs start Tuesday in the science block.");
    let body = multipart_body(&[
        ("file", Some("calendar.pdf"), pdf.as_slice()),
        ("title", None, b"Academic Calendar".as_slice()),
        ("category", None, b"academics".as_slice()),
    ]);
    let (status, summary) = upload(&app, body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["ingested"], 1);
    assert_eq!(summary["documents"][0]["title"], "Academic Calendar");

    let (_, list) = call(&app, Method::GET, "/api/documents", None).await;
    assert_eq!(list[0]["source_type"], "pdf");
    assert_eq!(list[0]["category"], "academics");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/chat",
        Some(json!({"message": "when do labs start"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["grounded"], true);
    assert!(body["response"].as_str().unwrap().contains("Labs start Tuesday"));
    assert_eq!(body["sources"][0]["title"], "Academic Calendar");
}

#[tokio::test]
async fn test_upload_rejects_bad_files() {
    let app = app(true);

    let no_file = multipart_body(&[("title", None, b"Nothing".as_slice())]);
    let (status, body) = upload(&app, no_file).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_request");

    // A broken file fails on its own; the batch still reports.
    let body = multipart_body(&[
        ("file", Some("broken.pdf"), b"%PDF-1.4 truncated".as_slice()),
        ("file", Some("hours.txt"), b"The gym opens at 6am.".as_slice()),
    ]);
    let (status, summary) = upload(&app, body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["ingested"], 1);
    assert_eq!(summary["failed"][0]["document"], "broken");
    assert_eq!(summary["documents"][0]["title"], "hours");
}

#[tokio::test]
async fn test_conversation_read_checks_owner() {
    let app = app(true);
    seed(&app).await;
    let (status, _) = call(
        &app,
        Method::POST,
        "/api/chat",
        Some(json!({
            "message": "when do labs start",
            "options": {"conversationId": "c5", "userId": "alice"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Method::GET, "/api/conversations/c5?user_id=bob", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_request");

    let (status, body) = call(&app, Method::GET, "/api/conversations/c5", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_request");

    let (status, conversation) =
        call(&app, Method::GET, "/api/conversations/c5?userId=alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conversation["messages"].as_array().unwrap().len(), 2);

    // Same rejection as posting to someone else's conversation.
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/chat",
        Some(json!({
            "message": "hello",
            "options": {"conversationId": "c5", "userId": "bob"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_request");
}

#[tokio::test]
async fn test_llm_config_masks_keys() {
    let app = app(true);
    let (status, config) = call(&app, Method::GET, "/api/chat/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["openai_configured"], false);
    assert!(config["available_models"].is_array());

    let (status, updated) = call(
        &app,
        Method::PUT,
        "/api/chat/config",
        Some(json!({"groqApiKey": "gsk-test", "preferredProvider": "groq"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["groq_configured"], true);
    assert_eq!(updated["active_provider"], "groq");
    assert!(!updated.to_string().contains("gsk-test"));

    let (status, body) = call(
        &app,
        Method::PUT,
        "/api/chat/config",
        Some(json!({"preferredProvider": "mystery"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_config");
}
