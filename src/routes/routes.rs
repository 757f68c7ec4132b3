//! Defines the HTTP surface of the webhook service.
//!
//! ## Structure
//! - **Webhook**
//!   - `POST /webhook`: MinIO bucket notification target
//!   - `POST /`: same handler, for targets configured without a path
//!
//! - **Reports** (configured bucket only)
//!   - `GET  /reports`: list stored reports (supports prefix, limit)
//!   - `GET  /reports/{*key}`: stored report of one object
//!   - `POST /reports/{*key}`: profile the object now and store the result
//!
//! - **Health**
//!   - `GET /healthz`, `GET /readyz`
//!
//! The wildcard `*key` allows nested keys like `soil/2025/SEN_soc.tif`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        report_handlers::{get_report, list_reports, refresh_report},
        webhook_handlers::receive_event,
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the application router with its shared state attached.
pub fn app(state: AppState) -> Router {
    routes().with_state(state)
}

/// Build and return the router for all webhook-service routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // MinIO notification target
        .route("/", post(receive_event))
        .route("/webhook", post(receive_event))
        // Stored reports
        .route("/reports", get(list_reports))
        .route("/reports/{*key}", get(get_report).post(refresh_report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_service::test_support::{BUCKET, sample_geotiff, service_with};
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn created(bucket: &str, key: &str) -> Value {
        json!({
            "eventName": "s3:ObjectCreated:Put",
            "s3": { "bucket": { "name": bucket }, "object": { "key": key } }
        })
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let app = app(AppState::new(service_with(&[]).await, None));
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn readyz_reports_each_check() {
        let app = app(AppState::new(service_with(&[]).await, None));
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["checks"]["sqlite"]["ok"], json!(true));
        assert_eq!(body["checks"]["object_store"]["ok"], json!(true));
    }

    #[tokio::test]
    async fn webhook_accepts_rasters_and_counts_the_rest() {
        let service = service_with(&[("soil/SEN_soc.tif", sample_geotiff())]).await;
        let app = app(AppState::new(service, None));

        let payload = json!({
            "Records": [
                created(BUCKET, "soil%2FSEN_soc.tif"),
                created(BUCKET, "notes.txt"),
                created("elsewhere", "x.tif"),
                { "eventName": "s3:ObjectAccessed:Get" }
            ]
        });
        let response = app.oneshot(post_json("/webhook", payload)).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            body_json(response).await,
            json!({"accepted": 1, "ignored": 3})
        );
    }

    #[tokio::test]
    async fn webhook_rejects_invalid_json() {
        let app = app(AppState::new(service_with(&[]).await, None));
        let response = app
            .oneshot(
                Request::post("/webhook")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], json!(400));
    }

    #[tokio::test]
    async fn empty_delivery_is_acknowledged() {
        let app = app(AppState::new(service_with(&[]).await, None));
        let response = app
            .oneshot(Request::post("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            body_json(response).await,
            json!({"accepted": 0, "ignored": 0})
        );
    }

    #[tokio::test]
    async fn webhook_enforces_configured_token() {
        let service = service_with(&[]).await;
        let app = app(AppState::new(service, Some("s3cret".into())));
        let payload = json!({"Records": []});

        let missing = app
            .clone()
            .oneshot(post_json("/webhook", payload.clone()))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let mut wrong = post_json("/webhook", payload.clone());
        wrong
            .headers_mut()
            .insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        let wrong = app.clone().oneshot(wrong).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        for value in ["Bearer s3cret", "s3cret"] {
            let mut request = post_json("/webhook", payload.clone());
            request
                .headers_mut()
                .insert(header::AUTHORIZATION, value.parse().unwrap());
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED, "{value}");
        }
    }

    #[tokio::test]
    async fn webhook_answers_503_when_backlog_is_full() {
        let service = service_with(&[]).await.with_max_pending(1);
        let app = app(AppState::new(service.clone(), None));

        let payload = json!({
            "Records": [created(BUCKET, "a.tif"), created(BUCKET, "b.tif")]
        });
        let response = app.oneshot(post_json("/webhook", payload)).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], json!(503));
        assert_eq!(service.pending(), 0);
    }

    #[tokio::test]
    async fn accepted_deliveries_are_processed_before_shutdown_returns() {
        let service = service_with(&[("soil/SEN_soc.tif", sample_geotiff())]).await;
        let app = app(AppState::new(service.clone(), None));

        let payload = json!({ "Records": [created(BUCKET, "soil/SEN_soc.tif")] });
        let response = app.oneshot(post_json("/webhook", payload)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        service.shutdown().await;
        let stored = service.reports.get(BUCKET, "soil/SEN_soc.tif").await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn reports_can_be_refreshed_fetched_and_listed() {
        let service = service_with(&[("soil/SEN_soc.tif", sample_geotiff())]).await;
        let app = app(AppState::new(service, None));

        let missing = app
            .clone()
            .oneshot(
                Request::get("/reports/soil/SEN_soc.tif")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let refreshed = app
            .clone()
            .oneshot(
                Request::post("/reports/soil/SEN_soc.tif")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(refreshed.status(), StatusCode::OK);
        let body = body_json(refreshed).await;
        assert_eq!(body["event_name"], json!("manual"));
        assert_eq!(body["report"]["driver"]["short_name"], json!("GTiff"));
        assert_eq!(body["report"]["size"]["band_count"], json!(1));

        let fetched = app
            .clone()
            .oneshot(
                Request::get("/reports/soil/SEN_soc.tif")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);
        assert_eq!(body_json(fetched).await["key"], json!("soil/SEN_soc.tif"));

        let listed = app
            .oneshot(
                Request::get("/reports?prefix=soil/&limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        let listed = body_json(listed).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refreshing_a_missing_object_is_not_found() {
        let app = app(AppState::new(service_with(&[]).await, None));
        let response = app
            .oneshot(
                Request::post("/reports/absent.tif")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
