use crate::relay::CloseReason;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: i64,
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        time: state.monotonic_unix_time(),
    })
}

/// Prometheus text exposition of the gateway counters.
pub async fn prometheus_metrics(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(render_metrics(&state))
}

fn render_metrics(state: &AppState) -> String {
    let metrics = state.metrics_snapshot();
    let sessions = state.registry.stats();
    let mut out = String::new();

    gauge(&mut out, "gateway_uptime_seconds", "Seconds since the gateway started", state.get_uptime_seconds());
    gauge(
        &mut out,
        "gateway_sink_fallback",
        "1 when the echo fallback sink is active instead of a downstream pipeline",
        u64::from(state.sink.is_fallback()),
    );

    counter(&mut out, "gateway_http_requests_total", "HTTP requests served", metrics.request_count);
    counter(&mut out, "gateway_http_errors_total", "HTTP responses with a 4xx or 5xx status", metrics.error_count);

    let mut routes: Vec<_> = metrics.endpoint_metrics.iter().collect();
    routes.sort_by(|a, b| a.0.cmp(b.0));
    header(&mut out, "gateway_route_requests_total", "HTTP requests per route", "counter");
    for (route, metric) in &routes {
        let _ = writeln!(out, "gateway_route_requests_total{{route=\"{}\"}} {}", escape(route), metric.request_count);
    }
    header(&mut out, "gateway_route_errors_total", "HTTP error responses per route", "counter");
    for (route, metric) in &routes {
        let _ = writeln!(out, "gateway_route_errors_total{{route=\"{}\"}} {}", escape(route), metric.error_count);
    }
    header(&mut out, "gateway_route_duration_ms_avg", "Average response time per route", "gauge");
    for (route, metric) in &routes {
        let _ = writeln!(
            out,
            "gateway_route_duration_ms_avg{{route=\"{}\"}} {:.3}",
            escape(route),
            metric.average_duration_ms()
        );
    }

    counter(&mut out, "gateway_sessions_created_total", "Sessions created", sessions.created_total);
    counter(&mut out, "gateway_sessions_ended_total", "Sessions ended by client or idle timeout", sessions.ended_total);
    gauge(&mut out, "gateway_sessions_active", "Sessions currently active", sessions.active as u64);
    gauge(&mut out, "gateway_sessions_retained", "Ended sessions inside the retention window", sessions.ended as u64);

    counter(&mut out, "gateway_relay_opened_total", "Relay connections that started streaming", metrics.relay_opened);
    gauge(&mut out, "gateway_relay_active", "Relay connections currently streaming", metrics.relay_active);
    header(&mut out, "gateway_relay_closed_total", "Relay connections closed, by reason", "counter");
    for reason in CloseReason::ALL {
        let count = metrics.relay_closed.get(&reason).copied().unwrap_or(0);
        let _ = writeln!(out, "gateway_relay_closed_total{{reason=\"{}\"}} {}", reason.as_str(), count);
    }
    counter(&mut out, "gateway_frames_in_total", "Frames read from relay clients", metrics.frames_in);
    counter(&mut out, "gateway_frames_out_total", "Frames written to relay clients", metrics.frames_out);

    counter(&mut out, "gateway_ingest_accepted_total", "Voice payloads accepted", metrics.ingest_accepted);
    counter(&mut out, "gateway_ingest_rejected_total", "Voice payloads refused", metrics.ingest_rejected);
    gauge(&mut out, "gateway_ingest_in_flight", "Voice payloads currently with the sink", state.ingest.in_flight() as u64);

    out
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    header(out, name, help, "counter");
    let _ = writeln!(out, "{} {}", name, value);
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    header(out, name, help, "gauge");
    let _ = writeln!(out, "{} {}", name, value);
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_time_never_decreases() {
        let state = AppState::for_tests(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let mut previous = i64::MIN;
        for _ in 0..5 {
            let req = test::TestRequest::get().uri("/health").to_request();
            let body: HealthResponse = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body.status, "healthy");
            assert!(body.time >= previous);
            previous = body.time;
        }
    }

    #[actix_web::test]
    async fn test_metrics_exposition() {
        let state = AppState::for_tests(AppConfig::default());
        state.registry.create().unwrap();
        state.record_endpoint_request("POST /api/v1/sessions", 3, false);
        state.record_ingest(true);

        let text = render_metrics(&state);
        assert!(text.contains("gateway_sink_fallback 1"));
        assert!(text.contains("gateway_sessions_created_total 1"));
        assert!(text.contains("gateway_sessions_active 1"));
        assert!(text.contains("gateway_route_requests_total{route=\"POST /api/v1/sessions\"} 1"));
        assert!(text.contains("gateway_relay_closed_total{reason=\"capacity\"} 0"));
        assert!(text.contains("gateway_ingest_accepted_total 1"));
        assert!(text.contains("gateway_ingest_in_flight 0"));
    }
}
