//! Range requests against chunked objects.
//!
//! These tests verify that single byte ranges are served from exactly the
//! chunks they touch, across chunk boundaries, and that unsupported or
//! unsatisfiable ranges are refused.

mod common;

use std::time::Duration;

use common::*;
use futures::StreamExt;
use reqwest::{Method, StatusCode};

/// 1100 recognizable bytes in parts of 400, 400 and 300.
async fn proxy_with_file() -> (TestProxy, Vec<u8>) {
    let proxy = TestProxy::start().await;
    let content = counting_bytes(1100);
    proxy.put_ok("/big.bin", content.clone()).await;
    proxy.backend.clear_log();
    (proxy, content)
}

async fn ranged_body(proxy: &TestProxy, range: &str) -> (StatusCode, Option<String>, Vec<u8>) {
    let resp = proxy.get_range("/big.bin", range).await;
    let status = resp.status();
    let content_range = resp
        .headers()
        .get("content-range")
        .map(|v| v.to_str().unwrap().to_string());
    (status, content_range, resp.bytes().await.unwrap().to_vec())
}

// ============================================================================
// Basic Range Requests
// ============================================================================

#[tokio::test]
async fn test_range_within_first_chunk() {
    let (proxy, content) = proxy_with_file().await;

    let (status, content_range, body) = ranged_body(&proxy, "bytes=0-99").await;
    assert_status(status, StatusCode::PARTIAL_CONTENT, "First bytes");
    assert_eq!(content_range.as_deref(), Some("bytes 0-99/1100"));
    assert_eq!(body, &content[0..100]);
    assert_eq!(proxy.backend.count(&Method::GET, ".part0000"), 1);
    assert_eq!(proxy.backend.count(&Method::GET, ".part0001"), 0);
}

#[tokio::test]
async fn test_range_spanning_chunk_boundary() {
    let (proxy, content) = proxy_with_file().await;

    let (status, content_range, body) = ranged_body(&proxy, "bytes=350-449").await;
    assert_status(status, StatusCode::PARTIAL_CONTENT, "Boundary range");
    assert_eq!(content_range.as_deref(), Some("bytes 350-449/1100"));
    assert_eq!(body, &content[350..450]);
    assert_eq!(proxy.backend.count(&Method::GET, ".part0000"), 1);
    assert_eq!(proxy.backend.count(&Method::GET, ".part0001"), 1);
    assert_eq!(proxy.backend.count(&Method::GET, ".part0002"), 0);
}

#[tokio::test]
async fn test_range_covering_every_chunk() {
    let (proxy, content) = proxy_with_file().await;

    let (status, _, body) = ranged_body(&proxy, "bytes=399-800").await;
    assert_status(status, StatusCode::PARTIAL_CONTENT, "Three-chunk range");
    assert_eq!(body, &content[399..=800]);
}

#[tokio::test]
async fn test_suffix_range() {
    let (proxy, content) = proxy_with_file().await;

    let (status, content_range, body) = ranged_body(&proxy, "bytes=-150").await;
    assert_status(status, StatusCode::PARTIAL_CONTENT, "Suffix range");
    assert_eq!(content_range.as_deref(), Some("bytes 950-1099/1100"));
    assert_eq!(body, &content[950..]);
    assert_eq!(proxy.backend.count(&Method::GET, ".part0002"), 1);
    assert_eq!(proxy.backend.count(&Method::GET, ".part0000"), 0);
}

#[tokio::test]
async fn test_open_ended_range() {
    let (proxy, content) = proxy_with_file().await;

    let (status, content_range, body) = ranged_body(&proxy, "bytes=800-").await;
    assert_status(status, StatusCode::PARTIAL_CONTENT, "Open-ended range");
    assert_eq!(content_range.as_deref(), Some("bytes 800-1099/1100"));
    assert_eq!(body, &content[800..]);
}

#[tokio::test]
async fn test_range_end_is_clamped() {
    let (proxy, content) = proxy_with_file().await;

    let (status, content_range, body) = ranged_body(&proxy, "bytes=1000-5000").await;
    assert_status(status, StatusCode::PARTIAL_CONTENT, "Clamped range");
    assert_eq!(content_range.as_deref(), Some("bytes 1000-1099/1100"));
    assert_eq!(body, &content[1000..]);
}

#[tokio::test]
async fn test_single_byte_at_boundary() {
    let (proxy, content) = proxy_with_file().await;

    let (_, _, body) = ranged_body(&proxy, "bytes=400-400").await;
    assert_eq!(body, &content[400..401]);
    assert_eq!(proxy.backend.count(&Method::GET, ".part0000"), 0);
}

// ============================================================================
// Refused and ignored ranges
// ============================================================================

#[tokio::test]
async fn test_range_past_end_is_unsatisfiable() {
    let (proxy, _) = proxy_with_file().await;

    let (status, content_range, _) = ranged_body(&proxy, "bytes=1100-1200").await;
    assert_status(status, StatusCode::RANGE_NOT_SATISFIABLE, "Past end");
    assert_eq!(content_range.as_deref(), Some("bytes */1100"));
}

#[tokio::test]
async fn test_multiple_ranges_are_refused() {
    let (proxy, _) = proxy_with_file().await;

    let (status, _, _) = ranged_body(&proxy, "bytes=0-10,20-30").await;
    assert_status(status, StatusCode::RANGE_NOT_SATISFIABLE, "Multi-range");
    assert_eq!(proxy.backend.count(&Method::GET, ".part"), 0);
}

#[tokio::test]
async fn test_unknown_unit_serves_whole_object() {
    let (proxy, content) = proxy_with_file().await;

    let (status, content_range, body) = ranged_body(&proxy, "items=0-5").await;
    assert_status(status, StatusCode::OK, "Unknown range unit");
    assert_eq!(content_range, None);
    assert_eq!(body, content);
}

#[tokio::test]
async fn test_backend_ignoring_ranges() {
    let (proxy, content) = proxy_with_file().await;
    proxy.backend.ignore_ranges(true);

    let (status, _, body) = ranged_body(&proxy, "bytes=350-449").await;
    assert_status(status, StatusCode::PARTIAL_CONTENT, "Range over full chunks");
    assert_eq!(body, &content[350..450]);

    let (_, _, body) = ranged_body(&proxy, "bytes=-50").await;
    assert_eq!(body, &content[1050..]);
}

#[tokio::test]
async fn test_failed_later_chunk_truncates_body() {
    let (proxy, content) = proxy_with_file().await;
    proxy
        .backend
        .fail(Method::GET, ".part0001", 10, StatusCode::INTERNAL_SERVER_ERROR);

    let resp = proxy.get("/big.bin").await;
    assert_status(resp.status(), StatusCode::OK, "Headers go out with the first chunk");

    let mut body = resp.bytes_stream();
    let mut received = Vec::new();
    let mut broken = false;
    while let Some(frame) = body.next().await {
        match frame {
            Ok(buf) => received.extend_from_slice(&buf),
            Err(_) => {
                broken = true;
                break;
            }
        }
    }
    assert!(broken, "a short body must end the transfer with an error");
    assert!(received.len() < content.len());
    assert_eq!(received, &content[..received.len()]);

    for _ in 0..50 {
        if proxy.stats().truncated_streams > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(proxy.stats().truncated_streams, 1);
    assert_eq!(proxy.backend.count(&Method::GET, ".part0002"), 0);
}
