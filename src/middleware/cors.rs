use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN},
    HeaderName, HeaderValue, Method,
};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Origins allowed to call the API from a browser.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
    local_dev: Regex,
}

impl OriginPolicy {
    pub fn new(allowed: Vec<String>) -> Self {
        let local_dev = Regex::new(r"^https?://(localhost|127\.0\.0\.1)(:\d{1,5})?$")
            .expect("local development origin pattern is valid");
        Self { allowed, local_dev }
    }

    /// Exact allow-list match, or localhost / 127.0.0.1 on any port.
    pub fn is_allowed(&self, origin: &str) -> bool {
        self.allowed.iter().any(|o| o == origin) || self.local_dev.is_match(origin)
    }

    pub fn into_layer(self) -> CorsLayer {
        let policy = Arc::new(self);
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _request_parts| {
                    origin
                        .to_str()
                        .map(|o| policy.is_allowed(o))
                        .unwrap_or(false)
                },
            ))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::PATCH,
                Method::OPTIONS,
            ])
            .allow_headers([
                AUTHORIZATION,
                CONTENT_TYPE,
                ACCEPT,
                ORIGIN,
                HeaderName::from_static("x-requested-with"),
            ])
            .expose_headers([
                HeaderName::from_static("x-ratelimit-limit"),
                HeaderName::from_static("x-ratelimit-remaining"),
                HeaderName::from_static("retry-after"),
            ])
            .allow_credentials(true)
            .max_age(Duration::from_secs(3600))
    }
}
