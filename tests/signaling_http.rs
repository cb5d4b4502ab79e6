//! HTTP signaling against a mocked backend.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mockcall::signaling::{HttpSignaling, SessionToken, Signaling};
use mockcall::{CallConfig, CallError, CallTarget, CallTargetId, SignalingStep};

const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\n";
const ANSWER: &str = "v=0\r\no=- 9 9 IN IP4 203.0.113.9\r\ns=-\r\n";

fn config(server: &MockServer, access_token: Option<&str>) -> CallConfig {
    CallConfig {
        api_base_url: format!("{}/api", server.uri()),
        realtime_url: format!("{}/v1/realtime", server.uri()),
        realtime_model: "test-model".into(),
        access_token: access_token.map(str::to_string),
        request_timeout_secs: 2,
        ..CallConfig::default()
    }
}

fn target() -> CallTarget {
    CallTarget::new(CallTargetId::new("market-sizing").unwrap()).with_question(Some(3))
}

#[tokio::test]
async fn turn_credentials_are_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/turn-credentials"))
        .and(header("authorization", "Bearer user-jwt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "iceServers": [
                {"urls": "stun:stun.example.org:3478"},
                {"urls": ["turn:turn.example.org:3478"], "username": "u", "credential": "p"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let signaling = HttpSignaling::new(&config(&server, Some("user-jwt"))).unwrap();
    let servers = signaling.turn_credentials().await.unwrap();
    assert_eq!(servers.len(), 2);
    assert!(!servers[0].has_credentials());
    assert!(servers[1].has_credentials());
}

#[tokio::test]
async fn turn_server_error_keeps_status_and_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/turn-credentials"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"detail": "TURN provider down"})))
        .mount(&server)
        .await;

    let signaling = HttpSignaling::new(&config(&server, None)).unwrap();
    match signaling.turn_credentials().await {
        Err(CallError::Http {
            step,
            status,
            message,
        }) => {
            assert_eq!(step, SignalingStep::TurnCredentials);
            assert_eq!(status, 500);
            assert_eq!(message, "TURN provider down");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn token_request_carries_target_and_ttl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/direct-token/market-sizing/3"))
        .and(query_param("ttl", "300"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "ek_123"})))
        .expect(1)
        .mount(&server)
        .await;

    let signaling = HttpSignaling::new(&config(&server, None)).unwrap();
    let token = signaling
        .session_token(&target(), Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(token.expose(), "ek_123");
    assert_eq!(format!("{token:?}"), "SessionToken(***)");
}

#[tokio::test]
async fn empty_token_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/direct-token/market-sizing/3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "  "})))
        .mount(&server)
        .await;

    let signaling = HttpSignaling::new(&config(&server, None)).unwrap();
    let err = signaling
        .session_token(&target(), Duration::from_secs(300))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::InvalidResponse {
            step: SignalingStep::SessionToken,
            ..
        }
    ));
}

#[tokio::test]
async fn sdp_offer_is_posted_raw() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/realtime"))
        .and(query_param("model", "test-model"))
        .and(header("authorization", "Bearer ek_123"))
        .and(header("content-type", "application/sdp"))
        .and(body_string(OFFER))
        .respond_with(ResponseTemplate::new(201).set_body_string(ANSWER))
        .expect(1)
        .mount(&server)
        .await;

    let signaling = HttpSignaling::new(&config(&server, Some("user-jwt"))).unwrap();
    let answer = signaling
        .exchange_sdp(&SessionToken::new("ek_123"), OFFER)
        .await
        .unwrap();
    assert_eq!(answer, ANSWER);
}

#[tokio::test]
async fn sdp_rejection_surfaces_provider_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/realtime"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Invalid ephemeral key", "type": "invalid_request_error"}
        })))
        .mount(&server)
        .await;

    let signaling = HttpSignaling::new(&config(&server, None)).unwrap();
    let err = signaling
        .exchange_sdp(&SessionToken::new("stale"), OFFER)
        .await
        .unwrap_err();
    assert!(err.user_message().contains("HTTP 401: Invalid ephemeral key"));
}

#[tokio::test]
async fn non_sdp_answer_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/realtime"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let signaling = HttpSignaling::new(&config(&server, None)).unwrap();
    let err = signaling
        .exchange_sdp(&SessionToken::new("ek_123"), OFFER)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::InvalidResponse {
            step: SignalingStep::SdpExchange,
            ..
        }
    ));
}

#[tokio::test]
async fn slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/turn-credentials"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"iceServers": []}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let mut cfg = config(&server, None);
    cfg.request_timeout_secs = 1;
    let signaling = HttpSignaling::new(&cfg).unwrap();
    let err = signaling.turn_credentials().await.unwrap_err();
    match err {
        CallError::Transport { step, ref source } => {
            assert_eq!(step, SignalingStep::TurnCredentials);
            assert!(source.is_timeout());
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn complete_question_posts_case_and_number() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/interviews/complete-question"))
        .and(header("authorization", "Bearer user-jwt"))
        .and(body_json(json!({"case_type": "market-sizing", "question_number": 3})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let signaling = HttpSignaling::new(&config(&server, Some("user-jwt"))).unwrap();
    signaling.complete_question(&target()).await.unwrap();
}
