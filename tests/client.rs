use std::time::Duration;

use rustsyntheca::client::{RequestOptions, RetryPolicy, RetryingClient};
use rustsyntheca::config::Settings;
use rustsyntheca::SynthecaError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_client(max_attempts: u32) -> RetryingClient {
    RetryingClient::new(&Settings::default())
        .expect("client builds")
        .with_policy(RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        })
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map(|r| r.len()).unwrap_or(0)
}

#[tokio::test]
async fn retries_rate_limit_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let body = fast_client(4)
        .get_text(&format!("{}/flaky", server.uri()), &RequestOptions::new())
        .await
        .expect("third attempt succeeds");

    assert_eq!(body, "ok");
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = fast_client(4)
        .get_text(&format!("{}/missing", server.uri()), &RequestOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SynthecaError::Http { status: 404, .. }));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn server_errors_exhaust_the_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = fast_client(4)
        .get_text(&format!("{}/down", server.uri()), &RequestOptions::new())
        .await
        .unwrap_err();

    match &err {
        SynthecaError::RetriesExhausted { attempts, .. } => assert_eq!(*attempts, 4),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.status(), Some(503));
    assert_eq!(request_count(&server).await, 4);
}

#[tokio::test]
async fn timeouts_share_the_attempt_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let opts = RequestOptions::new().timeout(Duration::from_millis(50));
    let err = fast_client(2)
        .get_text(&format!("{}/slow", server.uri()), &opts)
        .await
        .unwrap_err();

    match err {
        SynthecaError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, SynthecaError::Network(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn invalid_json_is_a_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = fast_client(4)
        .get_json::<serde_json::Value>(&format!("{}/json", server.uri()), &RequestOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SynthecaError::Parse(_)));
    assert_eq!(request_count(&server).await, 1);
}

/// Serve one canned reply per connection, reading each request head first.
async fn serve_replies(listener: TcpListener, replies: Vec<&'static str>) {
    for reply in replies {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut head = Vec::new();
        let mut buf = [0u8; 512];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.expect("read request");
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        socket.write_all(reply.as_bytes()).await.expect("write reply");
        socket.shutdown().await.ok();
    }
}

#[tokio::test]
async fn truncated_body_is_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(serve_replies(
        listener,
        vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\npartial",
            "HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\ncomplete",
        ],
    ));

    let body = fast_client(3)
        .get_text(&format!("http://{addr}/page"), &RequestOptions::new())
        .await
        .expect("second attempt succeeds");

    assert_eq!(body, "complete");
    server.await.expect("server task");
}
