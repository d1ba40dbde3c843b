//! Per-endpoint request counters.
//!
//! Requests are keyed by their route pattern (`GET /api/v1/config`) rather
//! than the raw path so parameterised routes share one entry. Unmatched
//! paths are grouped under `"<unmatched>"`.

use crate::state::AppState;
use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    middleware::Next,
    web, Error,
};
use std::time::Instant;

pub async fn record_metrics(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let start_time = Instant::now();
    let pattern = req
        .match_pattern()
        .unwrap_or_else(|| "<unmatched>".to_string());
    let endpoint = format!("{} {}", req.method(), pattern);
    let state = req.app_data::<web::Data<AppState>>().cloned();

    if let Some(state) = &state {
        state.increment_request_count();
    }

    let result = next.call(req).await;

    if let Some(state) = &state {
        let is_error = match &result {
            Ok(response) => {
                response.status().is_client_error() || response.status().is_server_error()
            }
            Err(_) => true,
        };
        let duration_ms = start_time.elapsed().as_millis() as u64;
        state.record_endpoint_request(&endpoint, duration_ms, is_error);
        if is_error {
            state.increment_error_count();
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use actix_web::{middleware::from_fn, test, App, HttpResponse};

    #[actix_web::test]
    async fn test_requests_are_keyed_by_pattern() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .wrap(from_fn(record_metrics))
                .route("/pets/{id}", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/broken", web::get().to(|| async { HttpResponse::InternalServerError().finish() })),
        )
        .await;

        for uri in ["/pets/1", "/pets/2", "/broken"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            test::call_service(&app, req).await;
        }

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /pets/{id}"].request_count, 2);
        assert_eq!(metrics.endpoint_metrics["GET /broken"].error_count, 1);
    }
}
