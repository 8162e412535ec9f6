use actix_web::{middleware, web::Data, App, HttpServer};
use anyhow::Result;
use neutree_cluster::controllers::State;

use crate::handlers::{health, metrics};

/// Serve diagnostics, health and metrics until shutdown.
pub async fn start_server(state: State, listen_addr: &str) -> Result<()> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health::index)
            .service(health::health)
            .service(metrics::metrics)
    })
    .bind(listen_addr)?
    .shutdown_timeout(5);

    server.run().await?;
    Ok(())
}
