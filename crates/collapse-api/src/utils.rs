//! Request identity helpers shared by the proxy handlers.

use axum::http::{Method, Uri};

/// Derives the coalescing key for a request.
///
/// The key is the method, the normalized path and, when `include_query` is
/// set, the raw query string:
/// - `GET /users//42/` → `"GET /users/42"`
/// - `GET /search?q=rust` → `"GET /search?q=rust"`
///
/// Requests with equal keys are answered by one upstream call, so anything
/// that changes the upstream response must be part of the key.
pub fn coalescing_key(method: &Method, uri: &Uri, include_query: bool) -> String {
    let path = normalize_path(uri.path());
    match uri.query() {
        Some(query) if include_query && !query.is_empty() => {
            format!("{} {}?{}", method.as_str(), path, query)
        }
        _ => format!("{} {}", method.as_str(), path),
    }
}

/// Collapses repeated slashes and drops a trailing slash.
///
/// An empty path becomes `/`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("//"), "/");
        assert_eq!(normalize_path("/foo"), "/foo");
        assert_eq!(normalize_path("/foo/"), "/foo");
        assert_eq!(normalize_path("/foo//bar///baz"), "/foo/bar/baz");
    }

    #[test]
    fn test_key_includes_method_and_path() {
        assert_eq!(coalescing_key(&Method::GET, &uri("/foo"), true), "GET /foo");
        assert_eq!(
            coalescing_key(&Method::HEAD, &uri("/foo/"), true),
            "HEAD /foo"
        );
        assert_ne!(
            coalescing_key(&Method::GET, &uri("/foo"), true),
            coalescing_key(&Method::HEAD, &uri("/foo"), true)
        );
    }

    #[test]
    fn test_key_query_handling() {
        let with_query = uri("/search?q=rust&page=2");

        assert_eq!(
            coalescing_key(&Method::GET, &with_query, true),
            "GET /search?q=rust&page=2"
        );
        assert_eq!(
            coalescing_key(&Method::GET, &with_query, false),
            "GET /search"
        );
        // An empty query is the same resource as no query.
        assert_eq!(
            coalescing_key(&Method::GET, &uri("/search?"), true),
            "GET /search"
        );
    }

    #[test]
    fn test_equivalent_paths_share_a_key() {
        let a = coalescing_key(&Method::GET, &uri("/a//b/"), true);
        let b = coalescing_key(&Method::GET, &uri("/a/b"), true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_absolute_form_uri_uses_path_only() {
        assert_eq!(
            coalescing_key(&Method::GET, &uri("http://example.com/foo?x=1"), true),
            "GET /foo?x=1"
        );
    }
}
