pub mod config;
pub mod directory;
pub mod err;
pub mod flash;
pub mod io;
pub mod models;
pub mod programme;
pub mod routes;
pub mod sessions;
pub mod store;

use axum::Json;
use serde::Serialize;

use crate::config::Config;
use crate::err::{Error, Fine, Success};
use crate::flash::FlashKey;
use crate::routes::AppState;
use crate::sessions::RemarkPolicy;

pub type Payload<T> = Result<Json<Success<T>>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V> where V: Serialize {
    Ok(Json(Fine(value)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;
    log::info!("Opening {} store", config.backend.tag());
    let store = store::open(&config).await?;

    let app = routes::router(AppState {
        store,
        flash: FlashKey::new(&config.secret_key),
        remarks: RemarkPolicy::from_flag(config.allow_blank_remarks),
    });

    log::info!("Starting tutor roster HTTP server on http://{}", config.bind);
    axum::Server::bind(&config.bind)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
