//! BlueskyPublisher against a mocked PDS

use govedits_core::Error;
use govedits_core::traits::{Post, Publisher};
use govedits_sinks::bluesky::MAX_IMAGE_BYTES;
use govedits_sinks::{BlueskyPublisher, BlueskySettings};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION: &str = "/xrpc/com.atproto.server.createSession";
const UPLOAD: &str = "/xrpc/com.atproto.repo.uploadBlob";
const RECORD: &str = "/xrpc/com.atproto.repo.createRecord";

fn publisher(server: &MockServer, min_interval: Duration) -> BlueskyPublisher {
    let mut settings = BlueskySettings::new("watcher.example", "app-pass");
    settings.service_url = server.uri();
    settings.min_interval = min_interval;
    BlueskyPublisher::new(settings, "govedits-test").unwrap()
}

fn post(image: Option<PathBuf>) -> Post {
    Post {
        text: "Example Page Wikipedia article edited anonymously from Example Gov.\n\nhttps://en.wikipedia.org/w/index.php?diff=2&oldid=1".to_string(),
        link: "https://en.wikipedia.org/w/index.php?diff=2&oldid=1".to_string(),
        image,
        image_alt: "Screenshot of edit for Example Page".to_string(),
    }
}

async fn mount_session(server: &MockServer, times: u64) {
    Mock::given(method("POST"))
        .and(path(SESSION))
        .and(body_partial_json(json!({ "identifier": "watcher.example" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessJwt": "jwt-1",
            "refreshJwt": "refresh-1",
            "did": "did:plc:watcher",
            "handle": "watcher.example",
        })))
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_record(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(RECORD))
        .and(header("authorization", "Bearer jwt-1"))
        .and(body_partial_json(json!({
            "repo": "did:plc:watcher",
            "collection": "app.bsky.feed.post",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uri": "at://did:plc:watcher/app.bsky.feed.post/3k",
            "cid": "bafy",
        })))
        .mount(server)
        .await;
}

async fn posted_records(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == RECORD)
        .map(|r| r.body_json::<Value>().unwrap()["record"].clone())
        .collect()
}

#[tokio::test]
async fn text_post_reuses_the_session() {
    let server = MockServer::start().await;
    mount_session(&server, 1).await;
    mount_record(&server).await;

    let publisher = publisher(&server, Duration::ZERO);
    let uri = publisher.publish(&post(None)).await.unwrap();
    assert_eq!(uri, "at://did:plc:watcher/app.bsky.feed.post/3k");
    publisher.publish(&post(None)).await.unwrap();

    let records = posted_records(&server).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["facets"][0]["index"]["byteStart"], 69);
    assert!(records[0].get("embed").is_none());
}

#[tokio::test]
async fn image_is_uploaded_and_embedded() {
    let server = MockServer::start().await;
    mount_session(&server, 1).await;
    mount_record(&server).await;
    Mock::given(method("POST"))
        .and(path(UPLOAD))
        .and(header("content-type", "image/png"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "blob": { "$type": "blob", "ref": { "$link": "bafkrei" }, "mimeType": "image/png", "size": 3 },
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("shot.png");
    std::fs::write(&image, b"png").unwrap();

    publisher(&server, Duration::ZERO)
        .publish(&post(Some(image)))
        .await
        .unwrap();

    let records = posted_records(&server).await;
    let embed = &records[0]["embed"];
    assert_eq!(embed["$type"], "app.bsky.embed.images");
    assert_eq!(embed["images"][0]["alt"], "Screenshot of edit for Example Page");
    assert_eq!(embed["images"][0]["image"]["ref"]["$link"], "bafkrei");
}

#[tokio::test]
async fn oversized_image_falls_back_to_text() {
    let server = MockServer::start().await;
    mount_session(&server, 1).await;
    mount_record(&server).await;
    Mock::given(method("POST"))
        .and(path(UPLOAD))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("big.png");
    std::fs::write(&image, vec![0u8; MAX_IMAGE_BYTES as usize + 1]).unwrap();

    publisher(&server, Duration::ZERO)
        .publish(&post(Some(image)))
        .await
        .unwrap();

    let records = posted_records(&server).await;
    assert!(records[0].get("embed").is_none());
}

#[tokio::test]
async fn rejected_token_forces_a_new_session() {
    let server = MockServer::start().await;
    mount_session(&server, 2).await;
    Mock::given(method("POST"))
        .and(path(RECORD))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "ExpiredToken",
            "message": "Token has expired",
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_record(&server).await;

    let publisher = publisher(&server, Duration::ZERO);
    let err = publisher.publish(&post(None)).await.unwrap_err();
    assert!(matches!(err, Error::Dispatch { ref collaborator, .. } if collaborator == "bluesky"));

    publisher.publish(&post(None)).await.unwrap();
}

#[tokio::test]
async fn bad_credentials_are_a_dispatch_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "AuthenticationRequired",
            "message": "Invalid identifier or password",
        })))
        .mount(&server)
        .await;

    let err = publisher(&server, Duration::ZERO)
        .publish(&post(None))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("authentication failed"));
}

#[tokio::test]
async fn posts_are_spaced_by_the_minimum_interval() {
    let server = MockServer::start().await;
    mount_session(&server, 1).await;
    mount_record(&server).await;

    let publisher = publisher(&server, Duration::from_millis(300));
    publisher.publish(&post(None)).await.unwrap();
    let started = Instant::now();
    publisher.publish(&post(None)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
}
