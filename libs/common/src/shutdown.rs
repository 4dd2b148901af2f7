//! Graceful shutdown signal shared by every process-wide singleton: the
//! engine, and anything else started with an explicit `Start`/`Stop` pair,
//! awaits this future rather than each wiring up its own
//! `ctrl_c`/`SIGTERM` handling.

/// Resolves on `SIGINT` (ctrl-c) or, on unix, `SIGTERM` — whichever comes
/// first. Intended to be raced against a component's main loop so it can
/// exit its current iteration and drain in-flight work instead of being
/// killed mid-tick.
pub async fn listen() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
