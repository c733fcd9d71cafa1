/// Feed client tests with a mocked registry endpoint.
/// Exercises pagination parameters, retry behavior, and rate limiting
/// without touching the real feed.
use fmcsa_carrier_api::errors::AppError;
use fmcsa_carrier_api::feed::RegistryFeedClient;
use serde_json::json;
use wiremock::matchers::{header, method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(base_url: String, page_size: u32, max_retries: u32) -> RegistryFeedClient {
    RegistryFeedClient::new(base_url, Some("test-token".to_string()), page_size, 5, max_retries)
        .expect("client builds")
}

#[tokio::test]
async fn fetch_page_passes_paging_params_and_token() {
    let mock_server = MockServer::start().await;

    let body = json!([
        {"dot_number": "1", "legal_name": "A"},
        {"dot_number": "2", "legal_name": "B"}
    ]);
    Mock::given(method("GET"))
        .and(query_param("$limit", "2"))
        .and(query_param("$offset", "4"))
        .and(query_param("$order", "dot_number"))
        .and(header("X-App-Token", "test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client(mock_server.uri(), 2, 0);
    let page = client.fetch_page(4).await.expect("page fetches");
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["dot_number"], "1");
}

#[tokio::test]
async fn transient_server_error_is_retried() {
    let mock_server = MockServer::start().await;

    // First attempt fails, the retry succeeds.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"dot_number": "7"}])))
        .mount(&mock_server)
        .await;

    let client = client(mock_server.uri(), 100, 2);
    let page = client.fetch_page(0).await.expect("retry succeeds");
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn rate_limit_honors_retry_after() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let client = client(mock_server.uri(), 100, 2);
    let page = client.fetch_page(0).await.expect("recovers after 429");
    assert!(page.is_empty());
}

#[tokio::test]
async fn exhausted_retries_surface_an_external_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let client = client(mock_server.uri(), 100, 1);
    let err = client.fetch_page(0).await.expect_err("budget exhausted");
    assert!(matches!(err, AppError::ExternalApiError(_)));
}

#[tokio::test]
async fn estimate_total_parses_the_count_query() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(query_param("$select", "count(dot_number) AS total"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"total": "2167412"}])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client(mock_server.uri(), 100, 0);
    assert_eq!(client.estimate_total().await, 2_167_412);
}

#[tokio::test]
async fn estimate_total_falls_back_when_the_feed_cannot_count() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let client = client(mock_server.uri(), 100, 0);
    assert_eq!(
        client.estimate_total().await,
        fmcsa_carrier_api::feed::DEFAULT_ESTIMATED_TOTAL
    );
}

#[tokio::test]
async fn client_errors_fail_without_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    // Three retries available, but a 404 must not consume any of them.
    let client = client(mock_server.uri(), 100, 3);
    let err = client.fetch_page(0).await.expect_err("fatal status");
    assert!(matches!(err, AppError::ExternalApiError(_)));
}
