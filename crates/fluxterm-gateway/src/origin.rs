//! Browser origin policy.
//!
//! One policy decides both who may upgrade to a session and which origins
//! the REST surface answers cross-origin requests for.

use axum::http::header::{CONTENT_TYPE, HOST, ORIGIN};
use axum::http::{HeaderMap, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::OriginSettings;

/// Decides which browser origins may open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    AllowAny,
    /// Exact origins. When empty, only same-host origins pass.
    AllowList(Vec<String>),
}

impl Default for OriginPolicy {
    fn default() -> Self {
        OriginPolicy::AllowList(Vec::new())
    }
}

impl OriginPolicy {
    pub fn from_settings(settings: &OriginSettings) -> Self {
        if settings.allow_any {
            OriginPolicy::AllowAny
        } else {
            OriginPolicy::AllowList(
                settings
                    .allowed
                    .iter()
                    .map(|o| o.trim_end_matches('/').to_string())
                    .collect(),
            )
        }
    }

    /// `Err` carries the rejected origin. Requests without an `Origin`
    /// header are not from a browser and pass.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), String> {
        let Some(origin) = headers.get(ORIGIN) else {
            return Ok(());
        };
        let origin = origin.to_str().map_err(|_| "<non-ascii>".to_string())?;
        let allowed = match self {
            OriginPolicy::AllowAny => true,
            OriginPolicy::AllowList(list) if list.is_empty() => headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .is_some_and(|host| origin_authority(origin).eq_ignore_ascii_case(host)),
            OriginPolicy::AllowList(list) => {
                let origin = origin.trim_end_matches('/');
                list.iter().any(|o| o == origin)
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(origin.to_string())
        }
    }

    /// CORS layer that grants exactly the origins [`check`](Self::check)
    /// accepts.
    pub fn cors_layer(&self) -> CorsLayer {
        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([CONTENT_TYPE]);
        match self {
            OriginPolicy::AllowAny => cors.allow_origin(Any),
            policy => {
                let policy = policy.clone();
                cors.allow_origin(AllowOrigin::predicate(move |_, request| {
                    policy.check(&request.headers).is_ok()
                }))
            }
        }
    }
}

/// `https://host:port/...` → `host:port`
fn origin_authority(origin: &str) -> &str {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest)
}
