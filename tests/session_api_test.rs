use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chatbattery::adapters::llm::{LlmSettings, OpenAiCompatibleClient};
use chatbattery::adapters::materials_project::MaterialsProjectClient;
use chatbattery::app::{build_router, AppState};
use chatbattery::core::search::RetrievalDb;
use chatbattery::core::session::{SessionServices, SessionSettings};
use httpmock::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn chat_reply(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

fn router_for(llm_server: &MockServer, mp_server: Option<&MockServer>) -> Router {
    let llm = OpenAiCompatibleClient::new(LlmSettings {
        api_base: llm_server.url("/v1"),
        api_key: Some("sk-test".to_string()),
        ..LlmSettings::default()
    })
    .unwrap();

    let materials = mp_server.map(|server| {
        let client = MaterialsProjectClient::new(
            &server.base_url(),
            Some("mp-key".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        Arc::new(client) as Arc<dyn chatbattery::domain::ports::MaterialsDatabase>
    });

    let icsd = RetrievalDb::from_reader("formula,capacity\nLiFePO4,169.9\nLiMnPO4,170.9\n".as_bytes())
        .unwrap();

    let services = SessionServices {
        llm: Arc::new(llm),
        materials,
        lithium_db: Arc::new(icsd),
        sodium_db: Arc::new(RetrievalDb::default()),
    };
    build_router(AppState::new(
        Arc::new(services),
        SessionSettings {
            retry_delay: Duration::ZERO,
            max_attempts: 3,
            ..SessionSettings::default()
        },
    ))
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let response: Response = router
        .clone()
        .oneshot(request(method, uri, body))
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn start_session(router: &Router, formula: &str) -> String {
    let (status, body) = call(
        router,
        "POST",
        "/api/sessions",
        Some(json!({"task": "Li-ion", "formula": formula})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!((body["input_capacity"].as_f64().unwrap() - 169.9).abs() < 0.5);
    body["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_propose_and_evaluate_against_remote_services() {
    let llm_server = MockServer::start();
    let chat_mock = llm_server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-test")
            .body_contains("\"model\":\"gpt-4o-mini\"")
            .body_contains("LiFePO4");
        then.status(200).json_body(chat_reply(
            "Here are some candidates:\n* LiMnPO4\n* Li2FePO4\n* **Li2CoPO4**\n",
        ));
    });

    let mp_server = MockServer::start();
    let known_mock = mp_server.mock(|when, then| {
        when.method(GET)
            .path("/materials/summary/")
            .query_param("formula", "Li2CoPO4");
        then.status(200)
            .json_body(json!({"data": [{"material_id": "mp-999"}]}));
    });
    mp_server.mock(|when, then| {
        when.method(GET)
            .path("/materials/summary/")
            .query_param("formula", "Li2FePO4");
        then.status(200).json_body(json!({"data": []}));
    });
    mp_server.mock(|when, then| {
        when.method(GET)
            .path("/materials/summary/")
            .query_param("formula", "LiMnPO4");
        then.status(500);
    });

    let router = router_for(&llm_server, Some(&mp_server));
    let id = start_session(&router, "LiFePO4").await;

    let (status, body) = call(&router, "POST", &format!("/api/sessions/{}/propose", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["proposals"], json!(["LiMnPO4", "Li2FePO4", "Li2CoPO4"]));
    chat_mock.assert();

    let (status, body) = call(&router, "POST", &format!("/api/sessions/{}/evaluate", id), None).await;
    assert_eq!(status, StatusCode::OK);
    known_mock.assert();

    let assessments = body["assessments"].as_array().unwrap();
    assert_eq!(assessments.len(), 3);
    // LiMnPO4：已在 ICSD，MP 查詢失敗
    assert_eq!(assessments[0]["icsd"]["status"], "known");
    assert_eq!(assessments[0]["materials_project"]["status"], "unavailable");
    // Li2FePO4：兩邊都查無
    assert_eq!(assessments[1]["icsd"]["status"], "novel");
    assert_eq!(assessments[1]["materials_project"]["status"], "novel");
    // Li2CoPO4：MP 已收錄
    assert_eq!(assessments[2]["materials_project"]["matched"], "mp-999");
    assert_eq!(body["accepted"], json!(["Li2FePO4"]));

    let (status, snapshot) = call(&router, "GET", &format!("/api/sessions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["round"], 1);
    assert_eq!(snapshot["history"], json!(["LiMnPO4", "Li2FePO4", "Li2CoPO4"]));
}

#[tokio::test]
async fn test_rank_orders_by_model_reply() {
    let llm_server = MockServer::start();
    let rank_mock = llm_server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_contains("Rank the following");
        then.status(200)
            .json_body(chat_reply("* Li2MnPO4\n* Li2FePO4\n* LiZnPO4\n"));
    });

    let router = router_for(&llm_server, None);
    let id = start_session(&router, "LiFePO4").await;

    let (status, body) = call(
        &router,
        "POST",
        &format!("/api/sessions/{}/rank", id),
        Some(json!({"candidates": ["Li2FePO4", "Li2NiPO4", "Li2MnPO4"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    rank_mock.assert();
    assert_eq!(body["ordered"], json!(["Li2MnPO4", "Li2FePO4", "Li2NiPO4"]));
}

#[tokio::test]
async fn test_llm_authentication_failure_is_not_retried() {
    let llm_server = MockServer::start();
    let chat_mock = llm_server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(401)
            .json_body(json!({"error": {"message": "Incorrect API key provided"}}));
    });

    let router = router_for(&llm_server, None);
    let id = start_session(&router, "LiFePO4").await;

    let (status, body) = call(&router, "POST", &format!("/api/sessions/{}/propose", id), None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("authentication failed"));
    chat_mock.assert_hits(1);
}
