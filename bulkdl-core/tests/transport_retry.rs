//! Transport retry behavior against a fake server.
//!
//! These run with a shrunk retry policy; the delays under test are the
//! production structure (attempt loop, short-read loop, deadline rounds)
//! at test-friendly timescales.

use std::collections::HashMap;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bulkdl_core::{Endpoint, RetryPolicy, Transport, TransportError};

fn endpoint_for(server: &MockServer) -> Endpoint {
    let uri: reqwest::Url = server.uri().parse().unwrap();
    Endpoint {
        token: "t".to_string(),
        host: uri.host_str().unwrap().to_string(),
        port: uri.port().unwrap(),
        protocol: "http".to_string(),
        job_id: None,
        ca_file: None,
        insecure_skip_verify: false,
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 10,
        initial_backoff: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(40),
        short_read_retries: 3,
        short_read_pause: Duration::from_millis(5),
        deadline_rounds: 2,
        deadline_pause: Duration::from_millis(10),
        data_deadline: Duration::from_secs(30),
        control_deadline: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn transient_503_is_retried_until_success() {
    let server = MockServer::start().await;
    let body = b"ranged content bytes".to_vec();

    // Three 503s, then the real content: exactly four attempts total.
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(body.clone()))
        .with_priority(5)
        .mount(&server)
        .await;

    let transport = Transport::with_policy(&endpoint_for(&server), fast_policy()).unwrap();
    let mut buf = Vec::new();
    transport
        .fetch_range(
            &format!("{}/blob", server.uri()),
            &HashMap::new(),
            0,
            body.len() as u64,
            &mut buf,
        )
        .await
        .unwrap();

    assert_eq!(buf, body);
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn fatal_status_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .expect(1)
        .mount(&server)
        .await;

    let transport = Transport::with_policy(&endpoint_for(&server), fast_policy()).unwrap();
    let mut buf = Vec::new();
    let err = transport
        .fetch_range(&format!("{}/blob", server.uri()), &HashMap::new(), 0, 10, &mut buf)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Http { status: 403, .. }), "{err:?}");
}

#[tokio::test]
async fn short_reads_are_retried_then_surface() {
    let server = MockServer::start().await;
    // Server keeps answering with fewer bytes than the requested range.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"short".to_vec()))
        .expect(3)
        .mount(&server)
        .await;

    let transport = Transport::with_policy(&endpoint_for(&server), fast_policy()).unwrap();
    let mut buf = Vec::new();
    let err = transport
        .fetch_range(&format!("{}/blob", server.uri()), &HashMap::new(), 0, 100, &mut buf)
        .await
        .unwrap_err();

    match err {
        TransportError::ShortRead {
            expected,
            got,
            attempts,
        } => {
            assert_eq!(expected, 100);
            assert_eq!(got, 5);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected a short read, got {other:?}"),
    }
}

#[tokio::test]
async fn deadline_cancels_the_attempt_and_unwinds() {
    let server = MockServer::start().await;
    // Responses are slower than the whole data-plane deadline.
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(b"late".to_vec())
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let mut policy = fast_policy();
    policy.data_deadline = Duration::from_millis(50);

    let transport = Transport::with_policy(&endpoint_for(&server), policy).unwrap();
    let mut buf = Vec::new();
    let started = std::time::Instant::now();
    let err = transport
        .fetch_range(&format!("{}/blob", server.uri()), &HashMap::new(), 0, 4, &mut buf)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Deadline { .. }), "{err:?}");
    // Two deadline rounds plus one pause, far below the server delay times
    // the retry budget: cancellation cut through both nested loops.
    assert!(started.elapsed() < Duration::from_secs(2));
}
