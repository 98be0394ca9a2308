//! Axum server setup and configuration

use crate::api::routes;
use crate::api::ws::ws_handler;
use crate::services::{
    MarketDrafter, MemoryStore, PendingLink, SocialReader, SystemClock, TrackingRegistrar,
    XClient, XMonitor,
};
use crate::types::MarketEvent;
use crate::wallet::CredentialVault;
use crate::{Config, Database};
use anyhow::Result;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<Config>,
    pub vault: CredentialVault,
    pub x_client: XClient,
    pub registrar: TrackingRegistrar,
    pub drafter: MarketDrafter,
    pub monitor: Arc<XMonitor>,
    /// OAuth `state` -> pending link
    pub oauth_states: MemoryStore<PendingLink>,
    /// Wallet -> sign-in message awaiting a signature
    pub sign_in_nonces: MemoryStore<String>,
    /// Broadcast channel for market events
    pub event_tx: broadcast::Sender<MarketEvent>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let db = Database::new(&config.database_path).await?;
        let x_client = XClient::new();
        let drafter = MarketDrafter::from_config(&config.ai);
        Ok(Self::with_services(
            Arc::new(db),
            config,
            x_client.clone(),
            Arc::new(x_client),
            drafter,
        ))
    }

    /// Assemble state around an existing database and adapters
    pub fn with_services(
        db: Arc<Database>,
        config: Config,
        x_client: XClient,
        reader: Arc<dyn SocialReader>,
        drafter: MarketDrafter,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let vault = CredentialVault::new(config.credential_secret.clone());
        let registrar = TrackingRegistrar::new(db.clone(), vault.clone(), reader.clone());
        let monitor = XMonitor::new(
            db.clone(),
            reader,
            vault.clone(),
            Arc::new(SystemClock),
            &config.monitor,
        )
        .with_events(event_tx.clone());

        Self {
            db,
            config: Arc::new(config),
            vault,
            x_client,
            registrar,
            drafter,
            monitor: Arc::new(monitor),
            oauth_states: MemoryStore::new("oauth-states"),
            sign_in_nonces: MemoryStore::new("sign-in-nonces"),
            event_tx,
        }
    }

    /// Subscribe to market events
    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.event_tx.subscribe()
    }
}

/// Create the Axum application with all routes
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let api_routes = Router::new()
        // Markets
        .route(
            "/markets",
            get(routes::markets::list_markets).post(routes::markets::create_market),
        )
        .route("/markets/:id", get(routes::markets::get_market))
        .route("/markets/:id/resolve", post(routes::markets::resolve_market))
        // Predictions
        .route("/predictions", post(routes::predictions::create_prediction))
        .route("/predictions/:wallet", get(routes::predictions::list_predictions))
        // Stats and badges
        .route("/stats/:wallet", get(routes::stats::get_stats))
        .route("/leaderboard", get(routes::stats::get_leaderboard))
        .route("/badges", post(routes::stats::award_badge))
        .route("/badges/:wallet", get(routes::stats::list_badges))
        // Proposals
        .route(
            "/proposals",
            get(routes::proposals::list_proposals).post(routes::proposals::create_proposal),
        )
        .route("/proposals/:id", get(routes::proposals::get_proposal))
        .route(
            "/proposals/:id/vote",
            post(routes::proposals::vote).delete(routes::proposals::unvote),
        )
        .route("/proposals/:id/vote/:wallet", get(routes::proposals::vote_status))
        .route("/proposals/:id/convert", post(routes::proposals::convert))
        // AI drafting
        .route("/ai/generate-prediction", post(routes::ai::generate_prediction))
        // Wallet sign-in
        .route("/auth/wallet/nonce", post(routes::auth::request_nonce))
        .route("/auth/wallet/verify", post(routes::auth::verify))
        .route("/auth/wallet/logout", post(routes::auth::logout))
        // X account linking
        .route("/auth/x/initiate", post(routes::x_auth::initiate))
        .route("/auth/x/callback", get(routes::x_auth::callback))
        .route(
            "/auth/x/connection/:wallet",
            get(routes::x_auth::get_connection).delete(routes::x_auth::delete_connection),
        )
        // X monitor
        .route("/monitor/status", get(routes::monitor::status))
        .route("/monitor/poll", post(routes::monitor::poll));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiConfig, AuthConfig, MonitorConfig};
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            database_path: ":memory:".to_string(),
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            public_base_url: Some("https://markets.test".to_string()),
            x_client_id: None,
            x_client_secret: None,
            credential_secret: "test-secret".to_string(),
            ai: AiConfig::default(),
            monitor: MonitorConfig::default(),
            auth: AuthConfig::default(),
        }
    }

    async fn test_state() -> AppState {
        let db = Arc::new(Database::in_memory().await.unwrap());
        // Nothing in these tests reaches the network
        let x_client = XClient::with_base_url("http://127.0.0.1:9");
        AppState::with_services(
            db,
            test_config(),
            x_client.clone(),
            Arc::new(x_client),
            MarketDrafter::new(None),
        )
    }

    async fn call(
        state: &AppState,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = create_app(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Full wallet sign-in; returns the bearer token and the wallet
    async fn sign_in(state: &AppState) -> (String, String) {
        let signer = PrivateKeySigner::random();
        let address = signer.address().to_string();

        let (status, challenge) = call(
            state,
            "POST",
            "/api/auth/wallet/nonce",
            None,
            Some(json!({ "address": address })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let message = challenge["message"].as_str().unwrap().to_string();

        let sig = signer.sign_message_sync(message.as_bytes()).unwrap();
        let signature = format!("0x{}", hex::encode(sig.as_bytes()));
        let (status, session) = call(
            state,
            "POST",
            "/api/auth/wallet/verify",
            None,
            Some(json!({ "address": address, "signature": signature })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        (
            session["sessionToken"].as_str().unwrap().to_string(),
            session["wallet"].as_str().unwrap().to_string(),
        )
    }

    fn market_body(title: &str) -> Value {
        json!({
            "title": title,
            "description": "test market",
            "endDate": (Utc::now() + Duration::days(3)).to_rfc3339(),
            "options": ["Yes", "No"],
        })
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state().await;
        let resp = create_app(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_write_endpoints_need_session() {
        let state = test_state().await;
        let (status, body) =
            call(&state, "POST", "/api/markets", None, Some(market_body("No auth"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Missing bearer token");

        let (status, _) = call(
            &state,
            "POST",
            "/api/markets",
            Some("not-a-session"),
            Some(market_body("Bad token")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_nonce_is_single_use() {
        let state = test_state().await;
        let signer = PrivateKeySigner::random();
        let address = signer.address().to_string();

        let (_, challenge) = call(
            &state,
            "POST",
            "/api/auth/wallet/nonce",
            None,
            Some(json!({ "address": address })),
        )
        .await;
        let message = challenge["message"].as_str().unwrap().to_string();
        let sig = signer.sign_message_sync(message.as_bytes()).unwrap();
        let body = json!({ "address": address, "signature": format!("0x{}", hex::encode(sig.as_bytes())) });

        let (status, _) = call(&state, "POST", "/api/auth/wallet/verify", None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, "POST", "/api/auth/wallet/verify", None, Some(body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_signer_is_rejected() {
        let state = test_state().await;
        let wallet = PrivateKeySigner::random();
        let impostor = PrivateKeySigner::random();
        let address = wallet.address().to_string();

        let (_, challenge) = call(
            &state,
            "POST",
            "/api/auth/wallet/nonce",
            None,
            Some(json!({ "address": address })),
        )
        .await;
        let message = challenge["message"].as_str().unwrap().to_string();
        let sig = impostor.sign_message_sync(message.as_bytes()).unwrap();

        let (status, _) = call(
            &state,
            "POST",
            "/api/auth/wallet/verify",
            None,
            Some(json!({ "address": address, "signature": format!("0x{}", hex::encode(sig.as_bytes())) })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rejected_signature_keeps_nonce() {
        let state = test_state().await;
        let wallet = PrivateKeySigner::random();
        let impostor = PrivateKeySigner::random();
        let address = wallet.address().to_string();

        let (_, challenge) = call(
            &state,
            "POST",
            "/api/auth/wallet/nonce",
            None,
            Some(json!({ "address": address })),
        )
        .await;
        let message = challenge["message"].as_str().unwrap().to_string();

        let forged = impostor.sign_message_sync(message.as_bytes()).unwrap();
        let attempts = [
            (format!("0x{}", hex::encode(forged.as_bytes())), StatusCode::UNAUTHORIZED),
            ("0xdeadbeef".to_string(), StatusCode::BAD_REQUEST),
        ];
        for (signature, expected) in attempts {
            let (status, _) = call(
                &state,
                "POST",
                "/api/auth/wallet/verify",
                None,
                Some(json!({ "address": address, "signature": signature })),
            )
            .await;
            assert_eq!(status, expected);
        }

        // The owner's sign-in still goes through
        let sig = wallet.sign_message_sync(message.as_bytes()).unwrap();
        let (status, session) = call(
            &state,
            "POST",
            "/api/auth/wallet/verify",
            None,
            Some(json!({ "address": address, "signature": format!("0x{}", hex::encode(sig.as_bytes())) })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(session["sessionToken"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_market_lifecycle() {
        let state = test_state().await;
        let mut events = state.subscribe();
        let (token, wallet) = sign_in(&state).await;

        let (status, market) = call(
            &state,
            "POST",
            "/api/markets",
            Some(&token),
            Some(market_body("Will it rain tomorrow?")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(market["creatorWallet"], wallet.as_str());
        assert_eq!(market["options"][0]["percentage"], 0);
        assert_eq!(market["options"][1]["percentage"], 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            MarketEvent::MarketCreated { .. }
        ));

        let market_id = market["id"].as_str().unwrap().to_string();
        let yes = market["options"][0]["id"].as_str().unwrap().to_string();
        let no = market["options"][1]["id"].as_str().unwrap().to_string();

        for option in [&yes, &no] {
            let (status, _) = call(
                &state,
                "POST",
                "/api/predictions",
                Some(&token),
                Some(json!({ "marketId": market_id, "optionId": option, "amount": "1.0" })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, market) = call(&state, "GET", &format!("/api/markets/{}", market_id), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(market["options"][0]["percentage"], 50);
        assert_eq!(market["options"][1]["percentage"], 50);
        assert_eq!(market["participants"], 2);

        let (status, resolved) = call(
            &state,
            "POST",
            &format!("/api/markets/{}/resolve", market_id),
            Some(&token),
            Some(json!({ "winnerId": yes })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["changed"], true);
        assert_eq!(resolved["market"]["winner"], yes.as_str());

        // Second resolve is a no-op
        let (status, resolved) = call(
            &state,
            "POST",
            &format!("/api/markets/{}/resolve", market_id),
            Some(&token),
            Some(json!({ "winnerId": no })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["changed"], false);
        assert_eq!(resolved["market"]["winner"], yes.as_str());

        let (_, stats) = call(&state, "GET", &format!("/api/stats/{}", wallet), None, None).await;
        assert_eq!(stats["marketsJoined"], 2);
        assert_eq!(stats["wins"], 1);
        assert_eq!(stats["winRate"], 50);

        let (_, list) = call(&state, "GET", "/api/markets?status=resolved", None, None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_market_validation_and_ownership() {
        let state = test_state().await;
        let (creator, _) = sign_in(&state).await;
        let (other, _) = sign_in(&state).await;

        let mut body = market_body("Too few options");
        body["options"] = json!(["Only"]);
        let (status, _) = call(&state, "POST", "/api/markets", Some(&creator), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, market) = call(
            &state,
            "POST",
            "/api/markets",
            Some(&creator),
            Some(market_body("Owned market")),
        )
        .await;
        let market_id = market["id"].as_str().unwrap();
        let yes = market["options"][0]["id"].as_str().unwrap();

        let (status, _) = call(
            &state,
            "POST",
            &format!("/api/markets/{}/resolve", market_id),
            Some(&other),
            Some(json!({ "winnerId": yes })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &state,
            "POST",
            &format!("/api/markets/{}/resolve", market_id),
            Some(&creator),
            Some(json!({ "winnerId": "not-an-option" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, "GET", "/api/markets/missing", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proposal_voting_and_conversion() {
        let state = test_state().await;
        let (token, wallet) = sign_in(&state).await;

        let (status, proposal) = call(
            &state,
            "POST",
            "/api/proposals",
            Some(&token),
            Some(json!({ "title": "Will the bridge open?", "category": "Community" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = proposal["id"].as_str().unwrap().to_string();

        let (status, voted) = call(&state, "POST", &format!("/api/proposals/{}/vote", id), Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(voted["votes"], 1);

        let (status, _) = call(&state, "POST", &format!("/api/proposals/{}/vote", id), Some(&token), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, has) = call(&state, "GET", &format!("/api/proposals/{}/vote/{}", id, wallet), None, None).await;
        assert_eq!(has["hasVoted"], true);

        let (_, unvoted) = call(&state, "DELETE", &format!("/api/proposals/{}/vote", id), Some(&token), None).await;
        assert_eq!(unvoted["votes"], 0);
        let (_, unvoted) = call(&state, "DELETE", &format!("/api/proposals/{}/vote", id), Some(&token), None).await;
        assert_eq!(unvoted["votes"], 0);

        let convert = json!({
            "endDate": (Utc::now() + Duration::days(7)).to_rfc3339(),
            "options": ["Yes", "No"],
        });
        let (status, converted) = call(
            &state,
            "POST",
            &format!("/api/proposals/{}/convert", id),
            Some(&token),
            Some(convert.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(converted["proposal"]["status"], "created");
        assert_eq!(converted["market"]["title"], "Will the bridge open?");
        assert_eq!(converted["market"]["resolutionMethod"], "Community Vote");

        let (status, _) = call(
            &state,
            "POST",
            &format!("/api/proposals/{}/convert", id),
            Some(&token),
            Some(convert),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_ai_draft_fallback() {
        let state = test_state().await;
        let (status, _) = call(
            &state,
            "POST",
            "/api/ai/generate-prediction",
            None,
            Some(json!({ "userInput": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, draft) = call(
            &state,
            "POST",
            "/api/ai/generate-prediction",
            None,
            Some(json!({ "userInput": "the team wins the final" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(draft["options"], json!(["Yes", "No"]));
        assert_eq!(draft["category"], "Community");
    }

    #[tokio::test]
    async fn test_x_link_requires_configuration_and_valid_state() {
        let state = test_state().await;
        let (token, wallet) = sign_in(&state).await;

        let (status, _) = call(&state, "POST", "/api/auth/x/initiate", Some(&token), None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let resp = create_app(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/auth/x/callback?code=abc&state=unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "/profile?error=invalid_state"
        );

        let (status, conn) = call(&state, "GET", &format!("/api/auth/x/connection/{}", wallet), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(conn.is_null());
    }

    #[tokio::test]
    async fn test_x_initiate_builds_authorize_url() {
        let mut config = test_config();
        config.x_client_id = Some("client".to_string());
        config.x_client_secret = Some("secret".to_string());
        let db = Arc::new(Database::in_memory().await.unwrap());
        let x_client = XClient::with_base_url("http://127.0.0.1:9");
        let state = AppState::with_services(
            db,
            config,
            x_client.clone(),
            Arc::new(x_client),
            MarketDrafter::new(None),
        );
        let (token, _) = sign_in(&state).await;

        let (status, body) = call(&state, "POST", "/api/auth/x/initiate", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let url = body["authUrl"].as_str().unwrap();
        assert!(url.contains("client_id=client"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fmarkets.test%2Fapi%2Fauth%2Fx%2Fcallback"));
        assert_eq!(state.oauth_states.len().await, 1);
    }

    #[tokio::test]
    async fn test_monitor_endpoints() {
        let state = test_state().await;
        let (status, body) = call(&state, "GET", "/api/monitor/status", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert_eq!(body["pollIntervalSeconds"], 300);

        let (token, _) = sign_in(&state).await;
        let (status, body) = call(&state, "POST", "/api/monitor/poll", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["report"]["recordsChecked"], 0);
    }

    #[tokio::test]
    async fn test_badges() {
        let state = test_state().await;
        let (token, wallet) = sign_in(&state).await;

        let (status, _) = call(
            &state,
            "POST",
            "/api/badges",
            Some(&token),
            Some(json!({ "badgeType": "x_verified" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, badge) = call(
            &state,
            "POST",
            "/api/badges",
            Some(&token),
            Some(json!({ "badgeType": "early_adopter" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(badge["badgeType"], "early_adopter");

        let (_, badges) = call(&state, "GET", &format!("/api/badges/{}", wallet), None, None).await;
        assert_eq!(badges.as_array().unwrap().len(), 1);
    }
}
