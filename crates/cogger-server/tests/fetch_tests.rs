//! Provider fetcher behavior against a mocked imagery API

use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cogger_server::fetch::{FetchConfig, SceneFetcher};
use cogger_server::pipeline::{SceneSource, StageError};

fn config_for(server: &MockServer) -> FetchConfig {
    FetchConfig {
        token_url: format!("{}/token", server.uri()),
        catalog_url: format!("{}/scenes", server.uri()),
        username: "user@example.com".to_string(),
        password: "hunter2".to_string(),
        max_retries: 3,
        backoff_base: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
    }
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok-1",
            "expires_in": 600,
        })))
        .mount(server)
        .await;
}

async fn mount_scene(server: &MockServer, source_id: &str) {
    let assets: serde_json::Value = ["B02", "B03", "B04"]
        .iter()
        .map(|band| {
            (
                band.to_string(),
                serde_json::json!({ "href": format!("{}/bands/{band}", server.uri()) }),
            )
        })
        .collect::<serde_json::Map<_, _>>()
        .into();

    Mock::given(method("GET"))
        .and(path(format!("/scenes/{source_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "assets": assets,
        })))
        .mount(server)
        .await;
}

async fn mount_bands(server: &MockServer) {
    for band in ["B02", "B03", "B04"] {
        Mock::given(method("GET"))
            .and(path(format!("/bands/{band}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(format!("{band} raster bytes")),
            )
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_fetch_downloads_all_bands() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_scene(&server, "scene-1").await;
    mount_bands(&server).await;

    let fetcher = SceneFetcher::new(config_for(&server)).unwrap();
    let scene = fetcher.fetch("scene-1").await.unwrap();

    for band in ["B02", "B03", "B04"] {
        let path = scene.band(band).expect("band file present");
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content, format!("{band} raster bytes"));
    }
}

#[tokio::test]
async fn test_transient_failures_retry_with_backoff() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_scene(&server, "scene-2").await;

    // First two attempts fail upstream, the third succeeds
    Mock::given(method("GET"))
        .and(path("/bands/B02"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_bands(&server).await;

    let fetcher = SceneFetcher::new(config_for(&server)).unwrap();
    let scene = fetcher.fetch("scene-2").await.unwrap();
    assert!(scene.band("B02").is_some());
}

#[tokio::test]
async fn test_retries_exhausted_is_transient() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_scene(&server, "scene-3").await;

    Mock::given(method("GET"))
        .and(path("/bands/B02"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    mount_bands(&server).await;

    let fetcher = SceneFetcher::new(config_for(&server)).unwrap();
    let err = fetcher.fetch("scene-3").await.unwrap_err();
    assert!(err.is_retryable(), "expected transient, got {err}");
}

#[tokio::test]
async fn test_unknown_scene_is_not_found() {
    let server = MockServer::start().await;
    mount_token(&server).await;

    Mock::given(method("GET"))
        .and(path("/scenes/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let fetcher = SceneFetcher::new(config_for(&server)).unwrap();
    let err = fetcher.fetch("missing").await.unwrap_err();
    assert!(matches!(err, StageError::NotFound(_)), "got {err}");
}

#[tokio::test]
async fn test_rejected_credentials_are_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let fetcher = SceneFetcher::new(config_for(&server)).unwrap();
    let err = fetcher.fetch("scene-4").await.unwrap_err();
    assert!(matches!(err, StageError::Auth(_)), "got {err}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_scene_missing_required_band_is_corrupt() {
    let server = MockServer::start().await;
    mount_token(&server).await;

    // Catalog document lacks B04
    Mock::given(method("GET"))
        .and(path("/scenes/partial"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "assets": {
                "B02": { "href": format!("{}/bands/B02", server.uri()) },
                "B03": { "href": format!("{}/bands/B03", server.uri()) },
            }
        })))
        .mount(&server)
        .await;

    let fetcher = SceneFetcher::new(config_for(&server)).unwrap();
    let err = fetcher.fetch("partial").await.unwrap_err();
    assert!(matches!(err, StageError::DataCorruption(_)), "got {err}");
}

#[tokio::test]
async fn test_empty_band_download_is_corrupt() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_scene(&server, "scene-5").await;

    Mock::given(method("GET"))
        .and(path("/bands/B02"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(Vec::new()))
        .mount(&server)
        .await;
    mount_bands(&server).await;

    let fetcher = SceneFetcher::new(config_for(&server)).unwrap();
    let err = fetcher.fetch("scene-5").await.unwrap_err();
    assert!(matches!(err, StageError::DataCorruption(_)), "got {err}");
}
