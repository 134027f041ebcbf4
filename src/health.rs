//! # Health Check and Metrics Endpoints
//!
//! ## Endpoints:
//! - `GET /health` and `GET /api/v1/health`: liveness plus a summary of
//!   session load and media storage
//! - `GET /api/v1/metrics`: full counters, per-endpoint statistics, and
//!   media session totals
//!
//! Both endpoints only read state. Neither one ever fails; a missing
//! playback asset or media directory is reported in the body, not as an
//! error status, because recording still works without playback.

use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::path::Path;

/// Liveness and a coarse view of load.
///
/// ## Response shape:
/// ```json
/// {
///   "status": "healthy",
///   "uptime_seconds": 3600,
///   "service": { "name": "media-ingest-server", "version": "0.1.0", ... },
///   "sessions": { "active": 3, "max": 64, ... },
///   "media": { "audio_dir": {...}, "playback_asset": {...}, ... },
///   "memory": { "resident_memory_bytes": 12345678, ... },
///   "system": { "status": "normal", ... }
/// }
/// ```
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": metrics.active_sessions,
            "max": config.performance.max_concurrent_sessions,
            "opened": metrics.sessions_opened,
            "finalized": metrics.sessions_finalized
        },
        "media": media_status(&config).await,
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

/// Everything [`AppState`] counts, for dashboards and debugging.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<serde_json::Value> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "sessions": {
            "active": metrics.active_sessions,
            "opened": metrics.sessions_opened,
            "finalized": metrics.sessions_finalized,
            "rejected": metrics.sessions_rejected,
            "ids": state.registry.ids()
        },
        "media": {
            "audio_artifacts": metrics.audio_artifacts,
            "video_artifacts": metrics.video_artifacts,
            "finalize_failures": metrics.finalize_failures,
            "playback_started": metrics.playback_started,
            "rejected_messages": metrics.rejected_messages
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

async fn path_status(path: &Path) -> serde_json::Value {
    json!({
        "path": path.display().to_string(),
        "exists": tokio::fs::try_exists(path).await.unwrap_or(false)
    })
}

async fn media_status(config: &AppConfig) -> serde_json::Value {
    json!({
        "audio_dir": path_status(&config.media.audio_dir).await,
        "video_dir": path_status(&config.media.video_dir).await,
        "scratch_dir": path_status(&config.media.scratch_dir).await,
        "playback_asset": path_status(&config.media.playback_asset).await,
        "ffmpeg_path": config.codec.ffmpeg_path
    })
}

/// Resident and virtual memory of this process, from `/proc` on Linux.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let path = format!("/proc/{}/status", std::process::id());
        if let Ok(status) = std::fs::read_to_string(path) {
            let kib = |prefix: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": kib("VmRSS:") * 1024,
                "virtual_memory_bytes": kib("VmSize:") * 1024,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let max = config.performance.max_concurrent_sessions;
    let session_usage = if max > 0 {
        metrics.active_sessions as f64 / max as f64
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
        "max_sessions": max,
        "current_sessions": metrics.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
