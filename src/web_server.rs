use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::pipeline::JobPipeline;
use crate::routes::{compile_handler, execute_handler, json_error_handler, status_handler};
use crate::vm::FilesystemPooler;

pub fn build_server(
    server_config: ServerConfig,
    pipeline: Arc<JobPipeline>,
    pooler: Arc<FilesystemPooler>,
    shutdown: CancellationToken,
) -> std::io::Result<Server> {
    let bind_address = server_config
        .bind_address
        .clone()
        .unwrap_or("127.0.0.1".to_string());
    let bind_port = server_config.bind_port.unwrap_or(12345);

    let server_config = web::Data::new(server_config);
    let pipeline = web::Data::from(pipeline);
    let pooler = web::Data::from(pooler);
    let shutdown = web::Data::new(shutdown);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(server_config.clone())
            .app_data(pipeline.clone())
            .app_data(pooler.clone())
            .app_data(shutdown.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(execute_handler)
            .service(compile_handler)
            .service(status_handler)
    })
    .bind((bind_address, bind_port))?
    .run();

    Ok(server)
}
