//! URL helpers for building provider endpoints
//!
//! Base addresses come from configuration and environment variables, so they
//! may or may not carry trailing slashes or an API version segment.

/// Normalize a base URL by removing trailing slashes
///
/// # Examples
///
/// ```
/// use parley::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.example.com/v1///"), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Join a base URL and an endpoint path without doubling slashes
///
/// # Examples
///
/// ```
/// use parley::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "/chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Build a Gemini-style endpoint under `/v1beta`, tolerating base URLs that
/// already include the version segment.
pub fn native_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let versioned = if normalized_base.ends_with("/v1beta") {
        normalized_base
    } else {
        format!("{normalized_base}/v1beta")
    };
    construct_api_url(&versioned, endpoint)
}

/// Append query parameters, percent-encoding their values.
pub fn with_query(url: &str, params: &[(&str, &str)]) -> Result<String, String> {
    reqwest::Url::parse_with_params(url, params)
        .map(|url| url.to_string())
        .map_err(|err| format!("invalid URL {url}: {err}"))
}

/// Host portion of a base URL, lowercased, for vendor detection.
pub fn host_of(base_url: &str) -> Option<String> {
    reqwest::Url::parse(base_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
}
