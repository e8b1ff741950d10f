use std::sync::Arc;

use log::{error, info};
use warp::Filter;

use carelink::config::Config;
use carelink::routes::{self, AppState};
use carelink::store::Database;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let db = match &config.data_path {
        Some(path) => match Database::open(path).await {
            Ok(db) => db,
            Err(e) => {
                error!("Failed to open store at {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No CARELINK_DATA_PATH set, using an in-memory store");
            Database::in_memory()
        }
    };

    let state = AppState::new(Arc::new(db), &config);
    let fallback = match &config.static_dir {
        Some(dir) => routes::static_files(dir.clone()),
        None => routes::no_static_files(),
    };
    let routes = routes::routes(state, fallback).with(warp::log("carelink"));

    match &config.tls {
        Some(tls) => {
            info!("Starting secure server (HTTPS/WSS) on {}", config.bind_addr);
            warp::serve(routes)
                .tls()
                .cert_path(&tls.cert)
                .key_path(&tls.key)
                .run(config.bind_addr)
                .await;
        }
        None => {
            info!("Starting server (HTTP/WS) on {}", config.bind_addr);
            warp::serve(routes).run(config.bind_addr).await;
        }
    }
}
