//! Per-endpoint request counters.
//!
//! Requests are bucketed by their route template (`GET /api/v1/sessions/{id}`)
//! rather than the raw path, so per-session lookups share one entry.
//! The WebSocket upgrade is counted once, at handshake time.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::debug;

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

/// `"{METHOD} {route}"`, falling back to the raw path for unmatched requests.
pub fn endpoint_key(method: &str, pattern: Option<&str>, path: &str) -> String {
    format!("{} {}", method, pattern.unwrap_or(path))
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = endpoint_key(
            req.method().as_str(),
            req.match_pattern().as_deref(),
            req.uri().path(),
        );
        let app_state = req.app_data::<web::Data<AppState>>().cloned();

        if let Some(state) = &app_state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
                Err(_) => true,
            };

            if let Some(state) = app_state {
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
                if is_error {
                    state.increment_error_count();
                }
            }
            debug!(endpoint = %endpoint, duration_ms, is_error, "Request recorded");

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_key_prefers_route_template() {
        assert_eq!(
            endpoint_key("GET", Some("/api/v1/sessions/{id}"), "/api/v1/sessions/client_1"),
            "GET /api/v1/sessions/{id}"
        );
        assert_eq!(endpoint_key("GET", None, "/missing"), "GET /missing");
    }
}
