//! End-to-end tests of the verification gate against a stub collaborator.

mod common;

use axum::extract::Form;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use common::*;
use duet::protocol::{ClientMessage, ErrorReason, ServerMessage};
use duet::verify::Verifier;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Deserialize)]
struct SiteverifyForm {
    #[allow(dead_code)]
    secret: String,
    response: String,
}

/// Stub siteverify endpoint: accepts "good", errors on "flaky", rejects
/// everything else.
async fn siteverify(Form(form): Form<SiteverifyForm>) -> (StatusCode, Json<Value>) {
    match form.response.as_str() {
        "good" => (StatusCode::OK, Json(json!({"success": true}))),
        "flaky" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "backend exploded"})),
        ),
        _ => (
            StatusCode::OK,
            Json(json!({"success": false, "error-codes": ["invalid-input-response"]})),
        ),
    }
}

async fn start_stub_collaborator() -> SocketAddr {
    let app = Router::new().route("/siteverify", post(siteverify));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_gated_server() -> SocketAddr {
    let stub = start_stub_collaborator().await;
    let verifier = Verifier::new(
        &format!("http://{stub}/siteverify"),
        Some("test-secret".to_string()),
    )
    .unwrap();
    let (addr, _state) = start_server_with_verifier(verifier).await;
    addr
}

#[tokio::test]
async fn accepted_token_opens_the_session() {
    let addr = start_gated_server().await;

    let mut client = TestClient::connect_with_token(&addr, "good").await;
    client.send(&ClientMessage::FindPartner).await;
    assert_eq!(client.recv().await, ServerMessage::Queued);
}

#[tokio::test]
async fn rejected_token_closes_the_connection() {
    let addr = start_gated_server().await;

    let mut client = TestClient::connect_unverified(&addr).await;
    client
        .send(&ClientMessage::VerifyCaptcha {
            token: "forged".to_string(),
        })
        .await;

    assert_eq!(
        client.recv().await,
        ServerMessage::Error {
            reason: ErrorReason::VerificationFailed
        }
    );
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn collaborator_error_is_retryable() {
    let addr = start_gated_server().await;

    let mut client = TestClient::connect_unverified(&addr).await;
    client
        .send(&ClientMessage::VerifyCaptcha {
            token: "flaky".to_string(),
        })
        .await;
    assert_eq!(
        client.recv().await,
        ServerMessage::Error {
            reason: ErrorReason::ServerError
        }
    );

    // The connection stayed open; a fresh token goes through
    client
        .send(&ClientMessage::VerifyCaptcha {
            token: "good".to_string(),
        })
        .await;
    assert_eq!(client.recv().await, ServerMessage::CaptchaSuccess);
}

#[tokio::test]
async fn gate_drops_non_verify_traffic_before_verification() {
    let addr = start_gated_server().await;

    let mut client = TestClient::connect_unverified(&addr).await;
    client.send(&ClientMessage::FindPartner).await;
    client
        .send(&ClientMessage::Chat {
            text: "premature".to_string(),
        })
        .await;
    assert_eq!(client.recv_timeout(Duration::from_millis(300)).await, None);

    client
        .send(&ClientMessage::VerifyCaptcha {
            token: "good".to_string(),
        })
        .await;
    assert_eq!(client.recv().await, ServerMessage::CaptchaSuccess);
}
