//! Translation of raw provider failures into user-facing diagnostics.
//!
//! Rules are matched in order against the lowercased failure text and the
//! first hit wins. Messages regularly mention more than one status code
//! (`"Error 404: 401 unauthorized"`), so the order is part of the contract.

use std::fmt;

const MAX_UNCLASSIFIED_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    IllegalCredentialCharacters,
    NetworkUnreachable,
    Unauthorized,
    PaymentRequired,
    ApiNotEnabled,
    Forbidden,
    NotFound,
    QuotaExhausted,
    RateLimited,
    UpstreamError,
    MalformedRequest,
    /// Anything else; carries the raw text truncated for display.
    Unclassified(String),
}

struct Rule {
    patterns: &'static [&'static str],
    classify: fn(&str) -> ErrorCategory,
}

const RULES: &[Rule] = &[
    Rule {
        patterns: &[
            "failed to parse header value",
            "invalid header value",
            "non iso-8859-1",
            "iso-8859-1 code point",
            "illegal character",
        ],
        classify: illegal_credential,
    },
    Rule {
        patterns: &[
            "failed to fetch",
            "network error",
            "error sending request",
            "error trying to connect",
            "connection refused",
            "connection reset",
            "dns error",
            "network is unreachable",
        ],
        classify: network_unreachable,
    },
    Rule {
        patterns: &["401", "unauthorized", "api key not valid", "invalid api key", "invalid x-api-key"],
        classify: unauthorized,
    },
    Rule {
        patterns: &["402", "payment required", "insufficient balance", "insufficient_balance"],
        classify: payment_required,
    },
    Rule {
        patterns: &["403", "permission_denied", "forbidden"],
        classify: forbidden,
    },
    Rule {
        patterns: &["404", "not found", "not_found"],
        classify: not_found,
    },
    Rule {
        patterns: &["429", "resource_exhausted", "rate limit", "too many requests"],
        classify: too_many_requests,
    },
    Rule {
        patterns: &["500", "502", "503", "504", "internal server error", "overloaded", "unavailable"],
        classify: upstream_error,
    },
    Rule {
        patterns: &["400", "bad request", "invalid_argument", "invalid_request_error"],
        classify: malformed_request,
    },
];

fn illegal_credential(_: &str) -> ErrorCategory {
    ErrorCategory::IllegalCredentialCharacters
}

fn network_unreachable(_: &str) -> ErrorCategory {
    ErrorCategory::NetworkUnreachable
}

fn unauthorized(_: &str) -> ErrorCategory {
    ErrorCategory::Unauthorized
}

fn payment_required(_: &str) -> ErrorCategory {
    ErrorCategory::PaymentRequired
}

fn forbidden(text: &str) -> ErrorCategory {
    if text.contains("not enabled")
        || text.contains("has not been used")
        || text.contains("service_disabled")
    {
        ErrorCategory::ApiNotEnabled
    } else {
        ErrorCategory::Forbidden
    }
}

fn not_found(_: &str) -> ErrorCategory {
    ErrorCategory::NotFound
}

fn too_many_requests(text: &str) -> ErrorCategory {
    if text.contains("quota") {
        ErrorCategory::QuotaExhausted
    } else {
        ErrorCategory::RateLimited
    }
}

fn upstream_error(_: &str) -> ErrorCategory {
    ErrorCategory::UpstreamError
}

fn malformed_request(_: &str) -> ErrorCategory {
    ErrorCategory::MalformedRequest
}

impl ErrorCategory {
    pub fn classify(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        RULES
            .iter()
            .find(|rule| rule.patterns.iter().any(|pattern| lower.contains(pattern)))
            .map(|rule| (rule.classify)(&lower))
            .unwrap_or_else(|| {
                ErrorCategory::Unclassified(truncate_chars(raw.trim(), MAX_UNCLASSIFIED_CHARS))
            })
    }

    pub fn user_message(&self) -> String {
        match self {
            ErrorCategory::IllegalCredentialCharacters => {
                "The API key contains characters that cannot be sent in a request header. Re-enter it without spaces or non-ASCII characters.".to_string()
            }
            ErrorCategory::NetworkUnreachable => {
                "Could not reach the provider. Check your network connection, proxy, or base URL.".to_string()
            }
            ErrorCategory::Unauthorized => {
                "Authentication failed (401). The API key is missing, invalid, or revoked.".to_string()
            }
            ErrorCategory::PaymentRequired => {
                "Payment required (402). The account balance is insufficient.".to_string()
            }
            ErrorCategory::ApiNotEnabled => {
                "Access denied (403). The API is not enabled for this project or key.".to_string()
            }
            ErrorCategory::Forbidden => {
                "Access denied (403). The key lacks permission, or the service is not available in your region.".to_string()
            }
            ErrorCategory::NotFound => {
                "Not found (404). The model or endpoint does not exist; check the model name and base URL.".to_string()
            }
            ErrorCategory::QuotaExhausted => {
                "Quota exhausted (429). The usage quota for this key has been used up.".to_string()
            }
            ErrorCategory::RateLimited => {
                "Rate limited (429). Too many requests; wait a moment and try again.".to_string()
            }
            ErrorCategory::UpstreamError => {
                "The provider had a server error (5xx). Try again later.".to_string()
            }
            ErrorCategory::MalformedRequest => {
                "The provider rejected the request as malformed (400). Check the model and its parameters.".to_string()
            }
            ErrorCategory::Unclassified(raw) => format!("Request failed: {raw}"),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user_message())
    }
}

/// Classify a raw failure and render its user-facing message.
pub fn translate(raw: &str) -> String {
    ErrorCategory::classify(raw).user_message()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}…", &text[..byte_index]),
        None => text.to_string(),
    }
}
