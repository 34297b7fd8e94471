//! Wire-level tests for the record-service REST client.

use rollcall::client::Member;
use rollcall::config::RecordsConfig;
use rollcall::records::{HttpRecordService, RecordService, SessionFragment};

use chrono::Utc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(server: &MockServer, api_key: Option<&str>) -> HttpRecordService {
    HttpRecordService::new(&RecordsConfig {
        base_url: server.uri(),
        api_key: api_key.map(String::from),
        ..RecordsConfig::default()
    })
    .unwrap()
}

fn fragment(session_id: &str, index: u32, total: u32) -> SessionFragment {
    SessionFragment {
        session_id: session_id.into(),
        chunk_index: index,
        total_chunks: total,
        payload: "cGF5bG9hZA==".into(),
        compressed: true,
        active: true,
        timestamp: Utc::now(),
    }
}

fn fragment_body(session_id: &str, index: u32, total: u32) -> serde_json::Value {
    serde_json::to_value(fragment(session_id, index, total)).unwrap()
}

#[tokio::test]
async fn listing_sends_bearer_header_and_filters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fragments"))
        .and(header("authorization", "Bearer secret-key"))
        .and(query_param("session_id", "primary"))
        .and(query_param("active", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "records": [
                {"id": "rec1", "fields": fragment_body("primary", 0, 1)},
            ],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let service = service(&server, Some("secret-key"));
    let page = service.list_fragments("primary", true, None).await.unwrap();

    assert_eq!(page.fragments.len(), 1);
    assert_eq!(page.fragments[0].record_id, "rec1");
    assert_eq!(page.fragments[0].fragment.chunk_index, 0);
    assert!(page.next_offset.is_none());
}

#[tokio::test]
async fn listing_follows_pagination_offsets() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fragments"))
        .and(query_param("offset", "page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "records": [
                {"id": "rec2", "fields": fragment_body("primary", 1, 2)},
            ],
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fragments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "records": [
                {"id": "rec1", "fields": fragment_body("primary", 0, 2)},
            ],
            "offset": "page2",
        })))
        .mount(&server)
        .await;

    let service = service(&server, None);

    let first = service.list_fragments("primary", true, None).await.unwrap();
    assert_eq!(first.next_offset.as_deref(), Some("page2"));

    let second = service
        .list_fragments("primary", true, first.next_offset.as_deref())
        .await
        .unwrap();
    assert_eq!(second.fragments[0].record_id, "rec2");
    assert!(second.next_offset.is_none());
}

#[tokio::test]
async fn create_posts_fields_and_returns_record_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fragments"))
        .and(body_partial_json(serde_json::json!({
            "fields": {
                "session_id": "primary",
                "chunk_index": 2,
                "total_chunks": 3,
                "compressed": true,
                "active": true,
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "rec-new",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let service = service(&server, None);
    let id = service
        .create_fragment(&fragment("primary", 2, 3))
        .await
        .unwrap();
    assert_eq!(id, "rec-new");
}

#[tokio::test]
async fn delete_targets_the_record_id() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/fragments/rec42"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let service = service(&server, None);
    service.delete_fragment("rec42").await.unwrap();
}

#[tokio::test]
async fn roster_upload_puts_members() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/rosters/Team%20Alpha"))
        .and(body_partial_json(serde_json::json!({
            "members": [{"phone_number": "+111", "display_name": "Ana"}],
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let service = service(&server, None);
    let members = vec![Member {
        phone_number: "+111".into(),
        display_name: "Ana".into(),
        join_date: Utc::now(),
        left_date: None,
        is_active: true,
    }];
    service.record_group_scan("Team Alpha", &members).await.unwrap();
}

#[tokio::test]
async fn server_errors_carry_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fragments"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance window"))
        .mount(&server)
        .await;

    let service = service(&server, None);
    let err = service
        .list_fragments("primary", true, None)
        .await
        .expect_err("listing should fail");
    let msg = err.to_string();
    assert!(msg.contains("503"));
    assert!(msg.contains("maintenance window"));
}
