//! Request-scoped context extracted from HTTP requests.

use std::convert::Infallible;

use admitq_id::RequestId;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(|| RequestId::new().to_string());

        Ok(Self { request_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> RequestContext {
        let (mut parts, _) = request.into_parts();
        RequestContext::from_request_parts(&mut parts, &())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_uses_caller_request_id() {
        let request = Request::builder()
            .header(REQUEST_ID_HEADER, "req-from-caller")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await.request_id, "req-from-caller");
    }

    #[tokio::test]
    async fn test_generates_request_id() {
        let ctx = extract(Request::builder().body(()).unwrap()).await;
        assert!(ctx.request_id.starts_with("req_"));
    }
}
