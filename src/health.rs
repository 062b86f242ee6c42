//! Optional HTTP status endpoint: `GET /health` returns [`BotStats`] as JSON.

use actix_web::{
    App,
    HttpServer,
    dev::ServerHandle,
    web,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    net::TcpListener,
    sync::Arc,
    thread::JoinHandle,
};
use tracing::info;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotStats {
    pub status: String,
    /// Human readable, e.g. `1h2m3s`.
    pub uptime: String,
    pub uptime_seconds: u64,
    pub bombs: i64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_count: u32,
    pub channel: String,
    pub username: String,
}

pub trait StatsProvider: Send + Sync + 'static {
    fn stats(&self) -> BotStats;
}

/// Runs on its own thread with its own actix system; stopped on drop.
pub struct HealthServer {
    base_url: String,
    server_handle: ServerHandle,
    server_thread: Option<JoinHandle<()>>,
}

impl HealthServer {
    /// Port 0 picks a free port; see [`HealthServer::base_url`].
    pub fn bind(host: &str, port: u16, stats: Arc<dyn StatsProvider>) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .wrap_err_with(|| format!("Failed to bind health endpoint on {host}:{port}"))?;
        let address = listener
            .local_addr()
            .wrap_err("Failed to read health endpoint address")?;
        let base_url = format!("http://{address}");

        let stats = web::Data::from(stats);
        let server = HttpServer::new(move || App::new().configure(routes(stats.clone())))
            .workers(1)
            .listen(listener)
            .wrap_err("Failed to start health endpoint")?
            .run();
        info!(%base_url, "health endpoint listening");

        let server_handle = server.handle();
        let server_thread = std::thread::spawn(move || {
            let sys = actix_web::rt::System::new();
            let _ = sys.block_on(server);
        });

        Ok(Self {
            base_url,
            server_handle,
            server_thread: Some(server_thread),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        let _ = self.server_handle.stop(true);
        if let Some(thread) = self.server_thread.take() {
            let _ = thread.join();
        }
    }
}

fn routes(stats: web::Data<dyn StatsProvider>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(stats)
            .route("/health", web::get().to(handle_health));
    }
}

async fn handle_health(stats: web::Data<dyn StatsProvider>) -> web::Json<BotStats> {
    web::Json(stats.stats())
}
