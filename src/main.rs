// =============================================================================
// Meridian Signal Engine — Main Entry Point
// =============================================================================
//
// Startup order is leaf-first: config and secrets (fail fast, exit 2), the
// store with a full integrity check (exit 3 on a broken chain), then the
// subsystem graph, then the background loops. Shutdown drains the current
// cycle, flushes the pending batch, and writes a final audit record.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_engine::api::health_router;
use meridian_engine::app_state::AppState;
use meridian_engine::config::{Config, Secrets};
use meridian_engine::error::exit_codes;
use meridian_engine::generator::GeneratorState;
use meridian_engine::rejected::{run_rejected_queue, HttpStateProbe};
use meridian_engine::store::run_flusher;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Signal Engine — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian_config.json".into());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return exit_codes::INVALID_CONFIG;
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration rejected");
        return exit_codes::INVALID_CONFIG;
    }
    let secrets = match Secrets::resolve(&config) {
        Ok(secrets) => secrets,
        Err(e) => {
            error!(error = %e, "secrets resolution failed");
            return exit_codes::INVALID_CONFIG;
        }
    };

    info!(
        environment = %config.environment,
        always_on = config.always_on,
        symbols = ?config.symbols,
        sources = config.sources.len(),
        executors = config.executors.len(),
        "configuration loaded"
    );

    // ── 2. Build the engine ──────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut state = match AppState::build(config, &secrets, shutdown_rx.clone()) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "engine assembly failed");
            return exit_codes::UNHANDLED;
        }
    };

    // ── 3. Startup integrity check ───────────────────────────────────────
    {
        let store = state.store.clone();
        let started = std::time::Instant::now();
        let report = match tokio::task::spawn_blocking(move || store.verify_integrity(None)).await
        {
            Ok(Ok(report)) => report,
            other => {
                error!(result = ?other, "integrity check did not complete");
                return exit_codes::INTEGRITY_FAILURE;
            }
        };
        state
            .metrics
            .integrity_duration
            .observe(started.elapsed().as_secs_f64());
        if !report.is_clean() {
            error!(
                checked = report.checked,
                mismatches = report.mismatches.len(),
                "hash chain verification FAILED at startup"
            );
            return exit_codes::INTEGRITY_FAILURE;
        }
        info!(checked = report.checked, "hash chain verified");
        let _ = state.audit.append(
            "engine",
            "INTEGRITY_CHECK",
            "signals.db",
            serde_json::json!({"checked": report.checked, "ok": report.ok}),
        );
    }

    let _ = state.audit.append(
        "engine",
        "STARTUP",
        "engine",
        serde_json::json!({"environment": state.config.environment.to_string()}),
    );

    // ── 4. HTTP servers ──────────────────────────────────────────────────
    let executor_router = state.executor_service.clone().router();
    let executor_addr = format!("0.0.0.0:{}", state.config.http_port);
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&executor_addr)
            .await
            .expect("failed to bind executor API");
        info!(addr = %executor_addr, "trading executor API listening");
        axum::serve(listener, executor_router)
            .await
            .expect("executor API failed");
    });

    let health = health_router(state.health_state());
    let health_addr = format!("0.0.0.0:{}", state.config.metrics_port);
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&health_addr)
            .await
            .expect("failed to bind health server");
        info!(addr = %health_addr, "health/metrics server listening");
        axum::serve(listener, health)
            .await
            .expect("health server failed");
    });

    // ── 5. Background loops ──────────────────────────────────────────────
    tokio::spawn(run_flusher(
        state.store.clone(),
        Duration::from_secs(state.config.flush_interval_secs),
        state.metrics.clone(),
        shutdown_rx.clone(),
    ));

    let rejection_rx = state.rejection_rx.take().expect("rejection receiver wired once");
    let probe = Arc::new(HttpStateProbe::new(
        state
            .config
            .executors
            .iter()
            .map(|e| (e.executor_id.clone(), e.endpoint_url.clone())),
    ));
    tokio::spawn(run_rejected_queue(
        state.rejected_queue.clone(),
        state.distributor.clone(),
        probe,
        state.distributor.executor_ids(),
        rejection_rx,
        shutdown_rx.clone(),
    ));

    // Audit retention maintenance, once a day.
    {
        let audit = state.audit.clone();
        let retention_days = state.config.audit_retention_days;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let audit = audit.clone();
                        let _ = tokio::task::spawn_blocking(move || {
                            audit.prune_expired(retention_days)
                        })
                        .await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    let generator = state.generator.clone();
    let generation = tokio::spawn(
        generator
            .clone()
            .start_background_generation(shutdown_rx.clone()),
    );

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal listener failed");
        return exit_codes::UNHANDLED;
    }
    warn!("shutdown signal received, stopping gracefully");

    let _ = shutdown_tx.send(true);

    // Wait for the current cycle to finish, 15 s at most.
    if tokio::time::timeout(Duration::from_secs(15), generation)
        .await
        .is_err()
    {
        warn!("generator did not stop inside 15 s, cancelling");
    }
    if generator.state() != GeneratorState::Stopped {
        warn!(state = %generator.state(), "generator state at shutdown");
    }

    // Final synchronous flush of the pending batch.
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.flush()).await {
        Ok(Ok(count)) => info!(count, "final batch flushed"),
        Ok(Err(e)) => error!(error = %e, "final flush failed"),
        Err(e) => error!(error = %e, "final flush panicked"),
    }

    let _ = state
        .audit
        .append("engine", "SHUTDOWN", "engine", serde_json::json!({}));

    info!("Meridian Signal Engine shut down complete");
    exit_codes::CLEAN
}
