//! Wording patterns used by the classification rules.
//!
//! Sources surface failures as free text (plus an optional status or
//! transport code). These patterns turn that text into a failure kind.
//! All matching is case-insensitive. `message` and `code` are matched
//! separately and a hit in either one counts.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // =========================================================================
    // FATAL
    // =========================================================================

    /// TLS handshake / certificate failures
    pub static ref TLS_PATTERN: Regex = Regex::new(
        r"(?i)\b(ssl|tls|certificate|cert_|x509|self[- ]signed|handshake failed)"
    ).unwrap();

    /// Authentication / authorization failures
    pub static ref AUTH_PATTERN: Regex = Regex::new(
        r"(?i)(unauthori[sz]ed|forbidden|invalid api key|authentication|permission denied|access denied)"
    ).unwrap();

    // =========================================================================
    // TRANSIENT
    // =========================================================================

    /// Rate limiting
    pub static ref RATE_LIMIT_PATTERN: Regex = Regex::new(
        r"(?i)(rate[ _-]?limit|too many requests|quota exceeded|overloaded)"
    ).unwrap();

    /// Request-level timeouts reported by the source
    pub static ref REQUEST_TIMEOUT_PATTERN: Regex = Regex::new(
        r"(?i)(request timeout|timed out waiting|deadline exceeded)"
    ).unwrap();

    // =========================================================================
    // NETWORK
    // =========================================================================

    pub static ref CONNECTION_DROPPED_PATTERN: Regex = Regex::new(
        r"(?i)(connection (dropped|lost|closed)|socket hang up|broken pipe|epipe)"
    ).unwrap();

    pub static ref FETCH_FAILED_PATTERN: Regex = Regex::new(
        r"(?i)(failed to fetch|fetch failed|request failed to start)"
    ).unwrap();

    pub static ref CONNECTION_RESET_PATTERN: Regex = Regex::new(
        r"(?i)(econnreset|connection reset)"
    ).unwrap();

    pub static ref CONNECTION_REFUSED_PATTERN: Regex = Regex::new(
        r"(?i)(econnrefused|connection refused)"
    ).unwrap();

    pub static ref STREAM_ABORTED_PATTERN: Regex = Regex::new(
        r"(?i)((sse|event[- ]?stream).*(abort|closed|interrupted)|stream aborted)"
    ).unwrap();

    pub static ref NO_BYTES_PATTERN: Regex = Regex::new(
        r"(?i)(no bytes|zero bytes|empty (response )?body)"
    ).unwrap();

    pub static ref PARTIAL_CHUNKS_PATTERN: Regex = Regex::new(
        r"(?i)(partial (chunk|response)|truncated|unexpected end of (json|stream|input))"
    ).unwrap();

    pub static ref RUNTIME_KILLED_PATTERN: Regex = Regex::new(
        r"(?i)(runtime (killed|terminated)|worker (killed|terminated)|process exited)"
    ).unwrap();

    pub static ref BACKGROUND_THROTTLE_PATTERN: Regex = Regex::new(
        r"(?i)(background.*throttl|throttl.*background|tab (hidden|suspended))"
    ).unwrap();

    pub static ref DNS_PATTERN: Regex = Regex::new(
        r"(?i)(enotfound|getaddrinfo|dns|name resolution|eai_again)"
    ).unwrap();

    pub static ref NETWORK_TIMEOUT_PATTERN: Regex = Regex::new(
        r"(?i)(etimedout|network timeout|socket timeout|connect timeout)"
    ).unwrap();

    /// Catch-all transport wording, checked after every specific network kind
    pub static ref NETWORK_GENERIC_PATTERN: Regex = Regex::new(
        r"(?i)(network|socket|connection|ehostunreach|enetunreach)"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_detection() {
        assert!(TLS_PATTERN.is_match("SSL routines: certificate verify failed"));
        assert!(TLS_PATTERN.is_match("self-signed certificate in chain"));
        assert!(TLS_PATTERN.is_match("TLS handshake failed"));
        assert!(!TLS_PATTERN.is_match("connection reset by peer"));
    }

    #[test]
    fn test_network_detection() {
        assert!(CONNECTION_RESET_PATTERN.is_match("read ECONNRESET"));
        assert!(CONNECTION_REFUSED_PATTERN.is_match("connect ECONNREFUSED 127.0.0.1:443"));
        assert!(DNS_PATTERN.is_match("getaddrinfo ENOTFOUND api.example.com"));
        assert!(STREAM_ABORTED_PATTERN.is_match("SSE connection aborted"));
        assert!(PARTIAL_CHUNKS_PATTERN.is_match("Unexpected end of JSON input"));
        assert!(NETWORK_GENERIC_PATTERN.is_match("network unreachable"));
    }

    #[test]
    fn test_transient_detection() {
        assert!(RATE_LIMIT_PATTERN.is_match("429 Too Many Requests"));
        assert!(RATE_LIMIT_PATTERN.is_match("rate_limit_error"));
        assert!(REQUEST_TIMEOUT_PATTERN.is_match("Request timeout after 30s"));
        assert!(!RATE_LIMIT_PATTERN.is_match("all good"));
    }

    #[test]
    fn test_auth_detection() {
        assert!(AUTH_PATTERN.is_match("401 Unauthorized"));
        assert!(AUTH_PATTERN.is_match("Invalid API key provided"));
        assert!(!AUTH_PATTERN.is_match("server exploded"));
    }
}
