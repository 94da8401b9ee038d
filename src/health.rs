use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let active_sessions = state.sessions.len();

    HttpResponse::Ok().json(json!({
        "status": if config.backend.is_configured() { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "voice-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "backend": {
            "name": state.backend_name,
            "mode": config.backend.mode,
            "configured": config.backend.is_configured()
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_sessions": active_sessions
        },
        "system": system_status(&config, active_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_sessions": state.sessions.len(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "relay": metrics.relay,
        "endpoints": endpoint_stats,
        "performance": {
            "max_concurrent_sessions": state.sessions.max_sessions()
        }
    }))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn system_status(config: &AppConfig, active_sessions: usize) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_status_thresholds() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 10;

        assert_eq!(system_status(&config, 2)["status"], "normal");
        assert_eq!(system_status(&config, 8)["status"], "moderate_load");
        let busy = system_status(&config, 10);
        assert_eq!(busy["status"], "high_load");
        assert_eq!(busy["load_warnings"].as_array().map(|a| a.len()), Some(1));
    }

    #[test]
    fn test_error_rate_without_requests() {
        assert_eq!(error_rate(&AppMetrics::default()), 0.0);
    }
}
