//! Lattice Server - real-time relational sync over WebSocket.
//!
//! Projects the schema into PostgreSQL, attaches the sync protocol handlers
//! to the WebSocket route, and fans committed mutations out to subscribed
//! clients.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use lattice_engine::{
    boolean, collection, create_relations, create_schema, id, number, reference, string,
    timestamp, many, one, Schema,
};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lattice_server::config::Config;
use lattice_server::router::ResourceRouter;
use lattice_server::storage::Storage;
use lattice_server::sync::SyncServer;
use lattice_server::{db, routes, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lattice_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Lattice Server on {}:{}", config.host, config.port);

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Load the schema and project it into storage (additive only).
    let schema = load_schema()?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tracing::info!(
        collections = schema.collections.len(),
        "projecting schema into storage"
    );
    let storage = Storage::init(pool, schema, Some(events_tx)).await?;

    // Build the protocol surface and start the background tasks.
    let router = ResourceRouter::from_schema(storage.schema());
    let sync = SyncServer::new(storage, router);
    sync.spawn_fan_out(events_rx);
    sync.spawn_reaper(Duration::from_secs(config.idle_timeout_secs));

    let state = AppState {
        config: Arc::new(config.clone()),
        sync,
    };

    // Build router
    let app = Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Load the schema from `LATTICE_SCHEMA` (a JSON file produced by
/// `Schema::to_json`), falling back to the built-in demo schema.
fn load_schema() -> Result<Schema, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("LATTICE_SCHEMA") {
        let raw = std::fs::read_to_string(&path)?;
        let schema = Schema::from_json(&raw)?;
        tracing::info!(%path, "loaded schema");
        return Ok(schema);
    }
    tracing::info!("LATTICE_SCHEMA not set, using the built-in demo schema");
    Ok(demo_schema())
}

/// The demo schema.
/// A real deployment points LATTICE_SCHEMA at its own schema file.
fn demo_schema() -> Schema {
    let users = collection(
        "users",
        [
            ("id", id()),
            ("name", string().nullable()),
            ("email", string().nullable()),
        ],
    );
    let posts = collection(
        "posts",
        [
            ("id", id()),
            ("title", string()),
            ("views", number().nullable()),
            ("published", boolean().nullable()),
            ("createdAt", timestamp().nullable()),
            ("userId", reference("users", "id")),
        ],
    );
    let comments = collection(
        "comments",
        [
            ("id", id()),
            ("body", string()),
            ("postId", reference("posts", "id")),
        ],
    );

    let user_rel = create_relations(&users, [("posts", many("posts", "userId"))]);
    let post_rel = create_relations(
        &posts,
        [
            ("user", one("users", "userId").required()),
            ("comments", many("comments", "postId")),
        ],
    );
    let comment_rel = create_relations(&comments, [("post", one("posts", "postId").required())]);

    create_schema([users, posts, comments], [user_rel, post_rel, comment_rel])
        .expect("demo schema is valid")
}
