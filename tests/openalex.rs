use std::time::Duration;

use rustsyntheca::cache::CacheLayer;
use rustsyntheca::client::{RetryPolicy, RetryingClient};
use rustsyntheca::config::Settings;
use rustsyntheca::matching::{CandidateSource, Lookup};
use rustsyntheca::openalex::{IdType, OpenAlexClient};
use rustsyntheca::progress::PositionAllocator;
use rustsyntheca::{FieldAccess, Value};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn openalex(server: &MockServer, mailto: Option<&str>) -> OpenAlexClient {
    let settings = Settings {
        openalex_base_url: server.uri(),
        openalex_mailto: mailto.map(str::to_string),
        ..Settings::default()
    };
    let client = RetryingClient::new(&settings)
        .expect("client builds")
        .with_policy(RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        });
    OpenAlexClient::new(client, &settings, PositionAllocator::new())
}

fn work(id: &str, title: &str, doi: &str, corresponding: bool) -> serde_json::Value {
    let institutions = if corresponding {
        vec!["https://openalex.org/I94624287"]
    } else {
        vec![]
    };
    json!({
        "id": format!("https://openalex.org/{id}"),
        "display_name": title,
        "doi": format!("https://doi.org/{doi}"),
        "publication_year": 2022,
        "corresponding_institution_ids": institutions
    })
}

fn dois(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("https://doi.org/10.1/{i}")).collect()
}

#[tokio::test]
async fn ids_are_fetched_in_batches_of_fifty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/works"))
        .and(query_param("per-page", "50"))
        .and(query_param("mailto", "team@example.org"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"results": [work("W1", "One", "10.1/0", false)]})),
        )
        .mount(&server)
        .await;

    let outcome = openalex(&server, Some("team@example.org"))
        .get_works_by_ids(&dois(120), IdType::Doi)
        .await;

    assert_eq!(outcome.requested, 120);
    assert_eq!(outcome.failed_batches, 0);
    assert_eq!(outcome.records.len(), 3);

    let requests = server.received_requests().await.expect("recording enabled");
    let mut sizes: Vec<usize> = requests
        .iter()
        .filter_map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "filter")
                .map(|(_, v)| v.into_owned())
        })
        .map(|filter| {
            assert!(filter.starts_with("doi:10.1/"), "prefix stripped: {filter}");
            filter.split('|').count()
        })
        .collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![20, 50, 50]);
}

#[tokio::test]
async fn failed_batch_is_skipped() {
    let server = MockServer::start().await;
    let first_batch: Vec<String> = (0..50).map(|i| format!("10.1/{i}")).collect();
    Mock::given(method("GET"))
        .and(path("/works"))
        .and(query_param("filter", format!("doi:{}", first_batch.join("|"))))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"results": [work("W1", "One", "10.1/0", false)]})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/works"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let outcome = openalex(&server, None)
        .get_works_by_ids(&dois(60), IdType::Doi)
        .await;

    assert_eq!(outcome.failed_batches, 1);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].text("doi"), Some("10.1/0"));
}

#[tokio::test]
async fn title_search_keeps_order_and_skips_failed_details() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/autocomplete/works"))
        .and(query_param("q", "Deep Learning for X"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"id": "https://openalex.org/W1"},
                {"id": "https://openalex.org/W2"},
                {"id": "https://openalex.org/W3"}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/works/W1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(work("W1", "Deep Learning for X", "10.1/a", false)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/works/W2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/works/W3"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(work("W3", "Deep Learning for Y", "10.1/c", true)),
        )
        .mount(&server)
        .await;

    let client = openalex(&server, None);
    let records = client
        .get_works_by_title("Deep Learning for X")
        .await
        .expect("autocomplete succeeds");
    let ids: Vec<&str> = records.iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(ids, vec!["W1", "W3"]);
    assert_eq!(
        records[1].field("institution_is_corresponding"),
        Some(&Value::Bool(true))
    );

    match client.lookup("Deep Learning for X").await {
        Lookup::Found(candidates) => {
            assert_eq!(candidates.len(), 2);
            assert!(!candidates[0].trusted);
            assert!(candidates[1].trusted);
        }
        other => panic!("unexpected lookup result: {other:?}"),
    }
}

#[tokio::test]
async fn failed_autocomplete_is_a_lookup_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/autocomplete/works"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/autocomplete/works"))
        .and(query_param("q", "nothing here"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .with_priority(1)
        .mount(&server)
        .await;

    let client = openalex(&server, None);
    assert!(client.lookup("broken").await.is_error());
    assert_eq!(client.lookup("nothing here").await, Lookup::NotFound);
}

#[tokio::test]
async fn cached_title_searches_stay_separate() {
    let server = MockServer::start().await;
    let shared = "Proceedings of the International Conference on Robotics and Automation";
    let one = format!("{shared} Part One");
    let two = format!("{shared} Part Two");
    for (title, id) in [(&one, "W_ONE"), (&two, "W_TWO")] {
        Mock::given(method("GET"))
            .and(path("/autocomplete/works"))
            .and(query_param("q", title.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"id": format!("https://openalex.org/{id}")}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/works/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(work(id, title, "10.1/x", false)))
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().expect("tempdir");
    let client = openalex(&server, None).with_cache(CacheLayer::new(dir.path(), true, true));

    for _ in 0..2 {
        let first = client.get_works_by_title(&one).await.expect("first title");
        let second = client.get_works_by_title(&two).await.expect("second title");
        assert_eq!(first[0].identifier, "W_ONE");
        assert_eq!(second[0].identifier, "W_TWO");
    }
}
