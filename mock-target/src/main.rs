//! Trivial HTTP responder used as the load target.
//!
//! The harness varies the tuning knobs below per configuration; the server
//! itself does nothing but answer quickly.

use axum::{extract::Path, routing::get, Router};

fn main() {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = env_usize("LOADMARK_MAX_WORKER_THREADS") {
        builder.worker_threads(workers);
    }
    if let Some(spin) = env_usize("LOADMARK_SPIN_LIMIT") {
        builder.event_interval(spin.max(1) as u32);
    }
    builder.enable_all().build().unwrap().block_on(serve());
}

async fn serve() {
    let port = env_usize("PORT").unwrap_or(5001);
    let app = Router::new().route("/user/:id", get(user));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn user(Path(id): Path<String>) -> String {
    format!("{{\"userId\":\"{id}\"}}")
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}
