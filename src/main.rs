use std::sync::Arc;

use canvasroom::config::Config;
use canvasroom::db::{self, MemoryRoomStore, PgRoomStore, RoomStore};
use canvasroom::routes;
use canvasroom::services::persistence;
use canvasroom::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    let port = config.port;

    let store: Arc<dyn RoomStore> = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed");
            Arc::new(PgRoomStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryRoomStore::new())
        }
    };
    let state = AppState::new(store, config);

    // Spawn background persistence task.
    let _persistence = persistence::spawn_persistence_task(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "canvasroom listening");
    axum::serve(listener, app).await.expect("server failed");
}
