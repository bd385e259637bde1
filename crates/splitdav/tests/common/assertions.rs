//! Custom assertions for proxy integration tests.

use reqwest::StatusCode;
use sha2::{Digest, Sha256};

use crate::common::TestProxy;

/// Assert that a file is served with the expected content.
pub async fn assert_file_content(proxy: &TestProxy, path: &str, expected: &[u8]) {
    match proxy.get_bytes(path).await {
        Ok(actual) => {
            assert_eq!(
                sha256(&actual),
                sha256(expected),
                "File content mismatch at {}: expected {} bytes, got {} bytes",
                path,
                expected.len(),
                actual.len()
            );
        }
        Err((status, body)) => {
            panic!("Failed to read file {path}: status={status}, body={body}");
        }
    }
}

/// Assert that a path returns 404 Not Found.
pub async fn assert_not_found(proxy: &TestProxy, path: &str) {
    let resp = proxy.get(path).await;
    assert_eq!(
        resp.status(),
        StatusCode::NOT_FOUND,
        "Expected 404 for {}, got {}",
        path,
        resp.status()
    );
}

/// Assert that a response has a specific status code.
pub fn assert_status(actual: StatusCode, expected: StatusCode, context: &str) {
    assert_eq!(
        actual, expected,
        "{context}: expected status {expected}, got {actual}"
    );
}

/// Assert that a Depth 1 listing shows exactly `expected` as children.
pub async fn assert_dir_entries(proxy: &TestProxy, path: &str, expected: &[&str]) {
    let mut actual = proxy.list_names(path).await;
    actual.sort();
    let mut expected: Vec<String> = expected.iter().map(ToString::to_string).collect();
    expected.sort();
    assert_eq!(actual, expected, "Listing of {path} differs");
}

/// Assert that the backend holds no bookkeeping for an upload.
pub fn assert_no_bookkeeping(proxy: &TestProxy, name: &str) {
    let leftovers: Vec<String> = proxy
        .backend
        .paths()
        .into_iter()
        .filter(|p| {
            let file = splitdav::path::file_name(p);
            file != name && file.starts_with(name)
        })
        .collect();
    assert!(leftovers.is_empty(), "Bookkeeping left behind: {leftovers:?}");
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
