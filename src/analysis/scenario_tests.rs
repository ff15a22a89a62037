//! End-to-end analysis scenarios: case state in, typed result or
//! classified error out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use serde_json::json;

use super::*;
use crate::case::{keys, CaseFields, CaseState};
use crate::config::{AnalysisConfig, ProviderKind, RetryPolicy};

const ANXIETY_NARRATIVE: &str = "She describes a constant anxiety about her health that \
    began after her father died suddenly last winter. She checks her pulse many times a day, \
    cannot stay alone in the house at night, and wakes between midnight and two o'clock with \
    fear of death and restlessness. She is extremely tidy, arranges things compulsively when \
    worried, feels chilly all the time, wants small sips of warm water, and is better from \
    company and reassurance. Stomach burns after eating.";

const REPERTORIZATION_REPLY: &str = "Here is the analysis.\n\n```json\n{\n  \
    \"case_summary\": \"Anxious, fastidious, chilly patient with health fears and midnight aggravation\",\n  \
    \"symptom_hierarchy\": {\n    \"mental\": [\"Fear of death when alone\", \"Anxiety about health\"],\n    \
    \"generals\": [\"Chilly\", \"Worse after midnight\"],\n    \
    \"peculiar\": [\"Burning pains better from warmth\"],\n    \"local\": [\"Epigastric burning after eating\"]\n  },\n  \
    \"remedies\": [\n    {\"name\": \"Arsenicum album\", \"confidence\": \"high\", \
    \"rationale\": \"Anxiety, fastidiousness, chilliness, midnight aggravation\", \
    \"matching_symptoms\": [\"Fear of death when alone\", \"Chilly\"]},\n    \
    {\"name\": \"Phosphorus\", \"confidence\": \"low\", \"rationale\": \"Fear when alone, but thirst for cold drinks is absent\"}\n  ],\n  \
    \"disclaimer\": \"This is decision support for a qualified practitioner, not medical advice.\"\n}\n```";

fn anxiety_case() -> CaseFields {
    CaseFields::new()
        .with(keys::NARRATIVE, json!(ANXIETY_NARRATIVE))
        .with(
            keys::CHIEF_COMPLAINTS,
            json!([{
                "title": "Stomach pain",
                "location": "Epigastrium",
                "sensation": "Burning",
                "modalities": "Worse after midnight, better from warm drinks",
                "concomitants": "Restlessness and anxiety"
            }]),
        )
        .with(keys::PHYSICAL_GENERALS, json!({"thermal": "chilly"}))
        .with(keys::MENTAL_EMOTIONAL, json!({"fears": "Death, being alone"}))
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn http_config(provider: ProviderKind, base_url: &str) -> AnalysisConfig {
    AnalysisConfig {
        base_url: base_url.to_string(),
        min_request_interval: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        ..AnalysisConfig::for_provider(provider)
    }
}

#[test]
fn narrative_is_about_eighty_words() {
    let words = ANXIETY_NARRATIVE.split_whitespace().count();
    assert!((70..=90).contains(&words), "narrative has {words} words");
}

#[tokio::test(start_paused = true)]
async fn anxiety_case_yields_repertorization_and_saves_remedies() {
    let transport = Arc::new(ScriptedTransport::always(REPERTORIZATION_REPLY));
    let store = Arc::new(MemoryStore::new());
    let analyzer = CaseAnalyzer::new(
        transport.clone(),
        Arc::new(JsonDecoder),
        store.clone(),
        RetryPolicy::default(),
    );

    let result = analyzer.analyze_case(&anxiety_case()).await.unwrap();

    assert!(!result.remedies.is_empty());
    assert_eq!(result.remedies[0].name, "Arsenicum album");
    assert!(!result.disclaimer.trim().is_empty());
    assert_eq!(result.symptom_hierarchy.generals[0], "Chilly");

    let saved = store.remedy_suggestions();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].remedies, result.remedies);

    let prompt = &transport.sent_envelopes()[0];
    assert_eq!(prompt.task, AnalysisTaskKind::CaseRepertorization);
    assert!(prompt.user.contains("- Location: Epigastrium"));
    assert!(prompt.user.contains("- Sensation: Burning"));
    assert!(prompt.user.contains("- Thermal state: chilly"));
    assert!(prompt.user.contains("- Appetite: not recorded"));
    assert!(prompt.user.contains("fear of death"));
}

#[tokio::test]
async fn quota_exhaustion_fails_after_one_attempt() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/models/:model",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    axum::Json(json!({"error": {
                        "code": 429,
                        "message": "Resource has been exhausted (e.g. check quota).",
                        "status": "RESOURCE_EXHAUSTED"
                    }})),
                )
            }
        }),
    );
    let base = serve(router).await;
    let config = http_config(ProviderKind::Gemini, &base);
    let store = Arc::new(MemoryStore::new());
    let analyzer = CaseAnalyzer::from_config(&config, "test-key", store.clone()).unwrap();

    let started = tokio::time::Instant::now();
    let err = analyzer.analyze_case(&anxiety_case()).await.unwrap_err();

    assert!(err.is_quota_exhausted());
    assert!(err.allows_manual_continuation());
    assert!(err.remediation().is_some());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(store.remedy_suggestions().is_empty());
    assert_eq!(analyzer.usage().await.total_requests, 1);
}

#[tokio::test]
async fn generic_rate_limits_over_http_back_off_increasingly() {
    let arrivals = Arc::new(Mutex::new(Vec::<std::time::Instant>::new()));
    let seen = arrivals.clone();
    let router = Router::new().route(
        "/chat/completions",
        post(move || {
            let seen = seen.clone();
            async move {
                let count = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(std::time::Instant::now());
                    seen.len()
                };
                if count <= 2 {
                    return (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response();
                }
                axum::Json(json!({
                    "choices": [{"message": {"content": REPERTORIZATION_REPLY}}]
                }))
                .into_response()
            }
        }),
    );
    let base = serve(router).await;
    let mut config = http_config(ProviderKind::OpenAiCompatible, &base);
    config.retry.rate_limit_unit = Duration::from_millis(150);
    let analyzer =
        CaseAnalyzer::from_config(&config, "test-key", Arc::new(MemoryStore::new())).unwrap();

    let result = analyzer.analyze_case(&anxiety_case()).await.unwrap();
    assert!(!result.remedies.is_empty());

    let arrivals = arrivals.lock().unwrap().clone();
    assert_eq!(arrivals.len(), 3);
    let first_gap = arrivals[1] - arrivals[0];
    let second_gap = arrivals[2] - arrivals[1];
    assert!(first_gap >= Duration::from_millis(150), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(300), "second gap {second_gap:?}");
    assert!(second_gap > first_gap);
}

#[tokio::test]
async fn rate_limit_over_http_honors_retry_after_then_succeeds() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/chat/completions",
        post(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    let mut response = (
                        StatusCode::TOO_MANY_REQUESTS,
                        "Rate limit reached for requests per minute",
                    )
                        .into_response();
                    response
                        .headers_mut()
                        .insert("retry-after", HeaderValue::from_static("1"));
                    return response;
                }
                axum::Json(json!({
                    "choices": [{"message": {"content": REPERTORIZATION_REPLY}}],
                    "usage": {"prompt_tokens": 900, "completion_tokens": 250}
                }))
                .into_response()
            }
        }),
    );
    let base = serve(router).await;
    let config = http_config(ProviderKind::OpenAiCompatible, &base);
    let analyzer =
        CaseAnalyzer::from_config(&config, "test-key", Arc::new(MemoryStore::new())).unwrap();

    let started = tokio::time::Instant::now();
    let result = analyzer.analyze_case(&anxiety_case()).await.unwrap();

    assert_eq!(result.remedies[0].confidence, Confidence::High);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_secs(1));

    let usage = analyzer.usage().await;
    assert_eq!(usage.total_requests, 2);
    assert_eq!(usage.prompt_tokens, 900);
    assert_eq!(usage.completion_tokens, 250);
}

#[tokio::test(start_paused = true)]
async fn persistent_rate_limit_is_reported_after_max_attempts() {
    let transport = Arc::new(ScriptedTransport::new(vec![TransportOutcome::RetryableFailure {
        reason: RetryReason::RateLimited {
            message: "Too many requests".into(),
        },
        suggested_delay: Some(Duration::from_secs(5)),
    }]));
    let analyzer = CaseAnalyzer::new(
        transport.clone(),
        Arc::new(JsonDecoder),
        Arc::new(MemoryStore::new()),
        RetryPolicy::default(),
    );

    let err = analyzer.analyze_case(&anxiety_case()).await.unwrap_err();
    assert!(matches!(err, AnalysisError::RateLimited { attempts: 3, .. }));
    assert!(!err.is_quota_exhausted());
    assert_eq!(transport.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn prose_reply_surfaces_as_decode_error() {
    let transport = Arc::new(ScriptedTransport::always(
        "I cannot provide a remedy recommendation for this case.",
    ));
    let store = Arc::new(MemoryStore::new());
    let analyzer = CaseAnalyzer::new(
        transport.clone(),
        Arc::new(JsonDecoder),
        store.clone(),
        RetryPolicy::default(),
    );

    let err = analyzer.analyze_case(&anxiety_case()).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Decode(DecodeError::NoJsonObject)));
    assert_eq!(err.kind(), AnalysisErrorKind::Decode);
    // Decode failures are not retried.
    assert_eq!(transport.attempts(), 1);
    assert!(store.remedy_suggestions().is_empty());
}

/// Case state owned by a form that keeps changing between analyses.
struct LiveCase {
    fields: Mutex<CaseFields>,
}

impl CaseState for LiveCase {
    fn current_fields(&self) -> CaseFields {
        self.fields.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[tokio::test(start_paused = true)]
async fn each_call_reads_the_latest_case_state() {
    let transport = Arc::new(ScriptedTransport::always(REPERTORIZATION_REPLY));
    let analyzer = CaseAnalyzer::new(
        transport.clone(),
        Arc::new(JsonDecoder),
        Arc::new(MemoryStore::new()),
        RetryPolicy::default(),
    );
    let case = LiveCase {
        fields: Mutex::new(anxiety_case()),
    };

    analyzer.analyze_case(&case).await.unwrap();
    case.fields
        .lock()
        .unwrap()
        .set(keys::PHYSICAL_GENERALS, json!({"thermal": "hot"}));
    analyzer.analyze_case(&case).await.unwrap();

    let sent = transport.sent_envelopes();
    assert!(sent[0].user.contains("- Thermal state: chilly"));
    assert!(sent[1].user.contains("- Thermal state: hot"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_analyses_share_one_throttle() {
    let transport = Arc::new(ScriptedTransport::with_interval(
        vec![TransportOutcome::Success {
            text: REPERTORIZATION_REPLY.into(),
            usage: None,
        }],
        Duration::from_millis(500),
    ));
    let analyzer = Arc::new(CaseAnalyzer::new(
        transport.clone(),
        Arc::new(JsonDecoder),
        Arc::new(MemoryStore::new()),
        RetryPolicy::default(),
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let analyzer = analyzer.clone();
        handles.push(tokio::spawn(async move {
            analyzer.analyze_case(&anxiety_case()).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let mut sends = transport.send_instants();
    sends.sort();
    for pair in sends.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(500));
    }
}
