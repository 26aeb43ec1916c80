//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册策略引擎指标描述
///
/// 描述会出现在 /metrics 端点的 HELP 注释中
pub fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "policy_evaluations_total",
        "Total number of policy engine builds by aggregate result"
    );
    metrics::describe_histogram!(
        "policy_engine_build_duration_seconds",
        "Policy engine build duration in seconds"
    );
    metrics::describe_counter!(
        "policy_binding_evaluations_total",
        "Total number of binding checks by rule kind"
    );
    metrics::describe_counter!(
        "policy_rule_errors_total",
        "Total number of rule evaluation errors by rule kind"
    );
    metrics::describe_counter!("policy_cache_hits_total", "Policy result cache hits");
    metrics::describe_counter!("policy_cache_misses_total", "Policy result cache misses");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次引擎评估
#[inline]
pub fn record_engine_build(mode: &str, passing: bool, duration_secs: f64) {
    let result = if passing { "pass" } else { "deny" };
    metrics::counter!(
        "policy_evaluations_total",
        "mode" => mode.to_string(),
        "result" => result
    )
    .increment(1);

    metrics::histogram!(
        "policy_engine_build_duration_seconds",
        "mode" => mode.to_string()
    )
    .record(duration_secs);
}

/// 记录一次绑定检查
///
/// `cache_hit` 为 None 表示本次评估未启用缓存
#[inline]
pub fn record_binding_evaluation(kind: &str, cache_hit: Option<bool>, errored: bool) {
    metrics::counter!("policy_binding_evaluations_total", "kind" => kind.to_string()).increment(1);

    match cache_hit {
        Some(true) => metrics::counter!("policy_cache_hits_total").increment(1),
        Some(false) => metrics::counter!("policy_cache_misses_total").increment(1),
        None => {}
    }

    if errored {
        metrics::counter!("policy_rule_errors_total", "kind" => kind.to_string()).increment(1);
    }
}
