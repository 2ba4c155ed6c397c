//! Header rewriting for the local proxy.
//!
//! Hop-by-hop headers describe the connection to the proxy, not the request,
//! and never cross the tunnel. Custom set/remove rules are applied after.

use ntunnel_shared::protocol::Headers;

/// Stripped from requests before they are tunnelled
const REQUEST_HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Stripped from tunnelled responses before they reach the caller
const RESPONSE_HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

/// Header rewrite rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderRule {
    /// Set header (overwrites existing)
    Set(String, String),
    /// Remove header by name
    Remove(String),
}

#[derive(Debug, Clone)]
pub struct HeaderRewriter {
    pub strip_hop_by_hop: bool,
    /// Applied in order to outgoing requests
    pub rules: Vec<HeaderRule>,
}

impl Default for HeaderRewriter {
    fn default() -> Self {
        Self {
            strip_hop_by_hop: true,
            rules: Vec::new(),
        }
    }
}

impl HeaderRewriter {
    pub fn with_rules(rules: Vec<HeaderRule>) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }

    /// Rewrite request headers before they enter the tunnel
    pub fn rewrite_request(&self, headers: &mut Headers) {
        if self.strip_hop_by_hop {
            strip(headers, REQUEST_HOP_BY_HOP);
        }

        for rule in &self.rules {
            match rule {
                HeaderRule::Set(k, v) => upsert(headers, k, v),
                HeaderRule::Remove(k) => headers.retain(|name, _| !name.eq_ignore_ascii_case(k)),
            }
        }
    }

    /// Rewrite response headers before sending back to the caller
    pub fn rewrite_response(&self, headers: &mut Headers) {
        if self.strip_hop_by_hop {
            strip(headers, RESPONSE_HOP_BY_HOP);
        }
    }
}

fn strip(headers: &mut Headers, names: &[&str]) {
    headers.retain(|name, _| !names.iter().any(|n| name.eq_ignore_ascii_case(n)));
}

/// Insert or update a header; names are stored lowercase
fn upsert(headers: &mut Headers, key: &str, value: &str) {
    headers.retain(|name, _| !name.eq_ignore_ascii_case(key));
    headers.insert(key.to_ascii_lowercase(), value.to_string());
}

/// Parse a `Name: value` line
pub fn parse_header(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_ascii_lowercase(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_request_hop_by_hop_stripped() {
        let rw = HeaderRewriter::default();
        let mut h = headers(&[
            ("host", "localhost:3000"),
            ("connection", "keep-alive"),
            ("Transfer-Encoding", "chunked"),
            ("content-type", "application/json"),
        ]);
        rw.rewrite_request(&mut h);
        assert_eq!(h, headers(&[("content-type", "application/json")]));
    }

    #[test]
    fn test_response_hop_by_hop_stripped() {
        let rw = HeaderRewriter::default();
        let mut h = headers(&[
            ("transfer-encoding", "chunked"),
            ("connection", "close"),
            ("x-echo", "true"),
        ]);
        rw.rewrite_response(&mut h);
        assert_eq!(h, headers(&[("x-echo", "true")]));
    }

    #[test]
    fn test_custom_rules() {
        let rw = HeaderRewriter::with_rules(vec![
            HeaderRule::Set("X-Custom".into(), "hello".into()),
            HeaderRule::Remove("Cookie".into()),
        ]);
        let mut h = headers(&[("cookie", "secret"), ("x-custom", "old")]);
        rw.rewrite_request(&mut h);
        assert!(!h.contains_key("cookie"));
        assert_eq!(h.get("x-custom").map(String::as_str), Some("hello"));
    }

    #[test]
    fn test_stripping_can_be_disabled() {
        let rw = HeaderRewriter {
            strip_hop_by_hop: false,
            rules: Vec::new(),
        };
        let mut h = headers(&[("host", "example.com")]);
        rw.rewrite_request(&mut h);
        assert!(h.contains_key("host"));
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Content-Type: text/plain"),
            Some(("content-type".into(), "text/plain".into()))
        );
        assert_eq!(
            parse_header("x-time: 12:30"),
            Some(("x-time".into(), "12:30".into()))
        );
        assert_eq!(parse_header("no-colon"), None);
        assert_eq!(parse_header(": value"), None);
    }
}
