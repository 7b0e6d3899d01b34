//! Shared fixtures for the Wikimedia source tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use govedits_core::WatchConfig;
use govedits_core::clock::FixedClock;
use serde_json::{Value, json};
use std::sync::Arc;
use wiremock::MockServer;

pub const API_PATH: &str = "/w/api.php";
pub const STREAM_PATH: &str = "/v2/stream/recentchange";

/// 2024-05-01 12:00:00 UTC plus `secs`
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn clock(secs: i64) -> Arc<FixedClock> {
    Arc::new(FixedClock::new(at(secs)))
}

/// Config aimed at `server` with no waiting anywhere
pub fn config(server: &MockServer) -> WatchConfig {
    let mut config = WatchConfig::new("ranges.csv");
    config.feed.api_url = format!("{}{}", server.uri(), API_PATH);
    config.feed.stream_url = format!("{}{}", server.uri(), STREAM_PATH);
    config.feed.min_request_delay_ms = 0;
    config.feed.stream_idle_timeout_secs = 5;
    config.engine.retry_delay_ms = 0;
    config.engine.max_backoff_ms = 0;
    config.engine.max_retries = 2;
    config
}

/// One `list=recentchanges` entry
pub fn rc(rev: u64, secs: i64, user: &str) -> Value {
    json!({
        "type": "edit",
        "ns": 0,
        "title": format!("Page {}", rev),
        "revid": rev,
        "old_revid": rev - 1,
        "rcid": rev + 50_000,
        "user": user,
        "anon": user.parse::<std::net::IpAddr>().is_ok(),
        "timestamp": at(secs).format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "comment": "copyedit",
        "oldlen": 1000,
        "newlen": 1010,
    })
}

/// API response body with `changes` and an optional continuation
pub fn rc_page(changes: Vec<Value>, next: Option<&str>) -> Value {
    let mut body = json!({
        "batchcomplete": next.is_none(),
        "query": { "recentchanges": changes },
    });
    if let Some(token) = next {
        body["continue"] = json!({ "rccontinue": token, "continue": "-||" });
    }
    body
}

/// EventStreams recent-change payload
pub fn stream_event(rev: u64, secs: i64, user: &str, wiki: &str) -> Value {
    json!({
        "$schema": "/mediawiki/recentchange/1.0.0",
        "id": rev + 50_000,
        "type": "edit",
        "namespace": 0,
        "title": format!("Page {}", rev),
        "comment": "copyedit",
        "timestamp": at(secs).timestamp(),
        "user": user,
        "bot": false,
        "length": { "old": 1000, "new": 1010 },
        "revision": { "old": rev - 1, "new": rev },
        "server_name": "en.wikipedia.org",
        "wiki": wiki,
    })
}

/// SSE body carrying each payload as one `message` event
pub fn sse_body(payloads: &[String]) -> String {
    payloads
        .iter()
        .map(|data| format!("event: message\ndata: {}\n\n", data))
        .collect()
}
