/// HTTP surface tests, driven through the router without a socket
mod common;

#[cfg(test)]
mod server_tests {
    use super::common::{
        fast_readiness, fast_settings, orchestrator, FakeEnvironment, FakeProbe, FakeProvider,
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use reqwest::Url;
    use sandbox_preview::config::RateLimitSettings;
    use sandbox_preview::orchestrator::Orchestrator;
    use sandbox_preview::project::FileLimits;
    use sandbox_preview::provider::{
        CommandResult, Environment, EnvironmentSpec, ProviderError, SandboxProvider,
    };
    use sandbox_preview::readiness::{LivenessProbe, ReadinessVerifier};
    use sandbox_preview::server::{router, AppState, HttpSettings, RELEASE_TOKEN_HEADER};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn http_settings(max_requests: u32) -> HttpSettings {
        HttpSettings {
            payload_limit: 11 * 1024 * 1024,
            allowed_origins: vec!["https://studio.example.com".to_string()],
            rate_limit: RateLimitSettings {
                window: Duration::from_secs(900),
                max_requests,
            },
        }
    }

    fn serve(orchestrator: Orchestrator, max_requests: u32) -> Router {
        let state = Arc::new(AppState {
            orchestrator,
            limits: FileLimits::default(),
            redact_errors: true,
        });
        router(state, &http_settings(max_requests)).expect("valid router settings")
    }

    fn app(
        env: Arc<FakeEnvironment>,
        provider_fails: bool,
        max_requests: u32,
    ) -> (Router, Arc<FakeProvider>) {
        let provider = Arc::new(if provider_fails {
            FakeProvider::failing(env)
        } else {
            FakeProvider::new(env)
        });
        let probe = Arc::new(FakeProbe::live());
        let orchestrator = orchestrator(provider.clone(), fast_settings(&[5173, 3000]), probe);
        (serve(orchestrator, max_requests), provider)
    }

    struct BrokenProvider;

    #[async_trait]
    impl SandboxProvider for BrokenProvider {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn create(
            &self,
            _spec: &EnvironmentSpec,
        ) -> Result<Arc<dyn Environment>, ProviderError> {
            panic!("unexpected provider bug")
        }

        async fn release(&self, _environment_id: &str) -> Result<(), ProviderError> {
            panic!("unexpected provider bug")
        }
    }

    struct BrokenLivenessCheck;

    #[async_trait]
    impl LivenessProbe for BrokenLivenessCheck {
        async fn probe(&self, _url: &Url) -> Result<(), String> {
            panic!("liveness check exploded")
        }
    }

    fn delete_request(id: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::DELETE)
            .uri(format!("/api/sandbox/{}", id));
        if let Some(token) = token {
            builder = builder.header(RELEASE_TOKEN_HEADER, token);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn create_request(body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/sandbox/create")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).expect("response body is JSON")
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app(Arc::new(FakeEnvironment::new("sbx")), false, 30);

        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
        let body = read_json(response).await;
        assert_eq!(body["status"], "OK");
    }

    #[tokio::test]
    async fn test_create_returns_preview_url() {
        let env = Arc::new(FakeEnvironment::new("sbx_abc").with_domain(5173, "sb-abc.example.run"));
        let (app, provider) = app(env, false, 30);

        let response = app
            .oneshot(create_request(json!({
                "files": {
                    "my-app/package.json": "{\"name\":\"my-app\"}",
                    "my-app/src/main.js": "console.log(1)"
                }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json(response).await;
        assert_eq!(body["releaseToken"].as_str().map(str::len), Some(64));
        let mut body = body;
        body.as_object_mut().unwrap().remove("releaseToken");
        assert_eq!(
            body,
            json!({
                "success": true,
                "previewUrl": "https://sb-abc.example.run",
                "sandboxId": "sbx_abc",
                "output": "added 42 packages",
                "verified": true
            })
        );
        assert_eq!(provider.created(), 1);
    }

    #[tokio::test]
    async fn test_build_failure_is_422() {
        let install = CommandResult::finished(1, "", "module not found");
        let env = Arc::new(FakeEnvironment::new("sbx_bad").with_install(install));
        let (app, _) = app(env, false, 30);

        let response = app
            .oneshot(create_request(json!({ "files": { "package.json": "{}" } })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            read_json(response).await,
            json!({ "success": false, "error": "Build_Failed: module not found" })
        );
    }

    #[tokio::test]
    async fn test_path_traversal_rejected_before_provisioning() {
        let (app, provider) = app(Arc::new(FakeEnvironment::new("sbx")), false, 30);

        let response = app
            .oneshot(create_request(json!({ "files": { "../../etc/passwd": "x" } })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("Security_Violation"));
        assert_eq!(provider.created(), 0);
    }

    #[tokio::test]
    async fn test_empty_file_set_is_invalid_input() {
        let (app, provider) = app(Arc::new(FakeEnvironment::new("sbx")), false, 30);

        let response = app
            .oneshot(create_request(json!({ "files": {} })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid_Input"));
        assert_eq!(provider.created(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_input() {
        let (app, _) = app(Arc::new(FakeEnvironment::new("sbx")), false, 30);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/sandbox/create")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"files\": [1, 2"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid_Input"));
    }

    #[tokio::test]
    async fn test_provider_failure_is_502() {
        let (app, _) = app(Arc::new(FakeEnvironment::new("sbx")), true, 30);

        let response = app
            .oneshot(create_request(json!({ "files": { "package.json": "{}" } })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = read_json(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Provider_Error"));
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_second_request() {
        let env = Arc::new(FakeEnvironment::new("sbx_rl").with_domain(5173, "sb.example.run"));
        let (app, provider) = app(env, false, 1);

        let first = app
            .clone()
            .oneshot(create_request(json!({ "files": { "package.json": "{}" } })))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(create_request(json!({ "files": { "package.json": "{}" } })))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(
            read_json(second).await,
            json!({ "success": false, "error": "Too many requests, please try again later." })
        );
        assert_eq!(provider.created(), 1);
    }

    #[tokio::test]
    async fn test_health_is_not_rate_limited() {
        let (app, _) = app(Arc::new(FakeEnvironment::new("sbx")), false, 1);

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_release_with_token_from_create() {
        let env = Arc::new(FakeEnvironment::new("sbx_42").with_domain(5173, "sb.example.run"));
        let (app, provider) = app(env, false, 30);

        let created = app
            .clone()
            .oneshot(create_request(json!({ "files": { "package.json": "{}" } })))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let body = read_json(created).await;
        let token = body["releaseToken"].as_str().unwrap().to_string();

        let response = app
            .oneshot(delete_request("sbx_42", Some(&token)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(provider.released_ids(), vec!["sbx_42".to_string()]);
    }

    #[tokio::test]
    async fn test_release_requires_valid_token() {
        let (app, provider) = app(Arc::new(FakeEnvironment::new("sbx")), false, 30);

        let missing = app
            .clone()
            .oneshot(delete_request("sbx_42", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        let body = read_json(missing).await;
        assert!(body["error"].as_str().unwrap().starts_with("Security_Violation"));

        let forged = app
            .oneshot(delete_request("sbx_42", Some(&"0".repeat(64))))
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::BAD_REQUEST);

        assert!(provider.released_ids().is_empty());
    }

    #[tokio::test]
    async fn test_provider_panic_becomes_redacted_500() {
        let verifier = ReadinessVerifier::new(fast_readiness(&[5173]), Arc::new(FakeProbe::live()));
        let orchestrator =
            Orchestrator::new(Arc::new(BrokenProvider), fast_settings(&[5173]), verifier);
        let app = serve(orchestrator, 30);

        let response = app
            .oneshot(create_request(json!({ "files": { "package.json": "{}" } })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            read_json(response).await,
            json!({ "success": false, "error": "An unexpected server error occurred" })
        );
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_redacted_500() {
        let env = Arc::new(FakeEnvironment::new("sbx_p").with_domain(5173, "sb.example.run"));
        let provider = Arc::new(FakeProvider::new(env));
        let verifier =
            ReadinessVerifier::new(fast_readiness(&[5173]), Arc::new(BrokenLivenessCheck));
        let orchestrator = Orchestrator::new(provider, fast_settings(&[5173]), verifier);
        let app = serve(orchestrator, 30);

        let response = app
            .oneshot(create_request(json!({ "files": { "package.json": "{}" } })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
        assert_eq!(
            read_json(response).await,
            json!({ "success": false, "error": "An unexpected server error occurred" })
        );
    }

    #[tokio::test]
    async fn test_release_rejects_malformed_id() {
        let (app, provider) = app(Arc::new(FakeEnvironment::new("sbx")), false, 30);

        let response = app
            .oneshot(delete_request("sbx.42", Some(&"0".repeat(64))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(provider.released_ids().is_empty());
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let (app, _) = app(Arc::new(FakeEnvironment::new("sbx")), false, 30);

        let response = app
            .oneshot(
                Request::get("/api/health")
                    .header(header::ORIGIN, "https://studio.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "https://studio.example.com"
        );
    }
}
