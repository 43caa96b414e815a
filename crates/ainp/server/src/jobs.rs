//! Background jobs: interval loops with graceful shutdown.
//!
//! Four sweeps run alongside the HTTP surface: negotiation expiry,
//! usefulness cache refresh, pending-receipt finalization, and payment
//! request expiry. Each loop exits when the shutdown signal flips.

use crate::api::rest::state::AppState;
use crate::config::JobsConfig;
use ainp_storage::{PaymentState, PaymentStore};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;

/// Spawn all background jobs.
pub fn spawn_jobs(state: AppState, config: JobsConfig, shutdown: watch::Receiver<bool>) {
    spawn_loop(
        "negotiation-expiry",
        Duration::from_secs(config.negotiation_expiry_secs.max(1)),
        shutdown.clone(),
        {
            let state = state.clone();
            move || {
                let state = state.clone();
                async move {
                    match state.negotiations.expire_stale().await {
                        Ok(0) => {}
                        Ok(count) => tracing::info!(count, "expired stale negotiations"),
                        Err(e) => tracing::warn!(error = %e, "negotiation expiry sweep failed"),
                    }
                }
            }
        },
    );

    spawn_loop(
        "usefulness-refresh",
        Duration::from_secs(config.usefulness_refresh_secs.max(1)),
        shutdown.clone(),
        {
            let state = state.clone();
            move || {
                let state = state.clone();
                async move {
                    if let Err(e) = state.usefulness.refresh_cache().await {
                        tracing::warn!(error = %e, "usefulness cache refresh failed");
                    }
                }
            }
        },
    );

    spawn_loop(
        "receipt-finalization",
        Duration::from_secs(config.receipt_finalize_secs.max(1)),
        shutdown.clone(),
        {
            let state = state.clone();
            move || {
                let state = state.clone();
                async move {
                    match state.receipts.finalize_pending().await {
                        Ok(0) => {}
                        Ok(count) => tracing::info!(count, "finalized pending receipts"),
                        Err(e) => tracing::warn!(error = %e, "receipt finalization sweep failed"),
                    }
                }
            }
        },
    );

    spawn_loop(
        "payment-expiry",
        Duration::from_secs(config.payment_expiry_secs.max(1)),
        shutdown,
        {
            let state = state.clone();
            move || {
                let state = state.clone();
                async move {
                    let expired = match state.storage.list_expired_payments(Utc::now()).await {
                        Ok(expired) => expired,
                        Err(e) => {
                            tracing::warn!(error = %e, "payment expiry sweep failed");
                            return;
                        }
                    };
                    for request in expired {
                        if let Err(e) = state
                            .storage
                            .transition_payment(
                                &request.id,
                                PaymentState::Pending,
                                PaymentState::Expired,
                            )
                            .await
                        {
                            tracing::warn!(request = %request.id, error = %e, "payment expiry failed");
                        }
                    }
                }
            }
        },
    );
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut work: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::debug!(job = name, ?period, "background job started");

        loop {
            tokio::select! {
                _ = ticker.tick() => work().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(job = name, "background job stopped");
    });
}
