//! The redirection contract.
//!
//! Object-scope requests are answered with HTTP 307 so that clients
//! re-issue the same method and body against the owning target. The
//! redirect URL carries a monotonic timestamp (`uts`, for target-side
//! request-age checks) and a network-role hint (`net=data|control`).

use axum::body::Body;
use axum::http::{Response, StatusCode, Uri};

use crate::{GatewayState, QPARAM_NET, QPARAM_UTS, SERVER_NAME};

/// Network-role hints carried in redirect URLs.
pub(crate) const NET_DATA: &str = "data";
pub(crate) const NET_CONTROL: &str = "control";

/// Build the redirect URL: target endpoint + original path and query,
/// plus the timestamp and network hint.
pub(crate) fn redirect_url(state: &GatewayState, target_url: &str, uri: &Uri, net: &str) -> String {
    let uts = state.clock.tick();
    let path = uri.path();
    match uri.query() {
        Some(q) if !q.is_empty() => {
            format!("{target_url}{path}?{q}&{QPARAM_UTS}={uts}&{QPARAM_NET}={net}")
        }
        _ => format!("{target_url}{path}?{QPARAM_UTS}={uts}&{QPARAM_NET}={net}"),
    }
}

/// 307 with the computed location. Method and body are preserved by the
/// client; the body here stays empty.
pub(crate) fn s3_redirect(
    state: &GatewayState,
    target_url: &str,
    uri: &Uri,
    net: &str,
) -> Response<Body> {
    let location = redirect_url(state, target_url, uri, net);
    tracing::debug!(%location, "s3 redirect");
    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header("location", location)
        .header("server", SERVER_NAME)
        .body(Body::empty())
        .expect("static response")
}
