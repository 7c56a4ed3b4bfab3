use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::cache::TaskCache;
use crate::config::Settings;
use crate::frontend::Frontend;
use crate::queue::JudgeQueue;
use crate::routes::{json_error_handler, judge_handler, ping, pull_test_cases_handler};

pub fn build_server(
    settings: Arc<Settings>,
    cache: Arc<TaskCache>,
    queue: Arc<JudgeQueue>,
    frontend: Frontend,
) -> std::io::Result<Server> {
    let bind = (settings.bind_address.clone(), settings.bind_port);

    let settings = web::Data::new(settings);
    let cache = web::Data::new(cache);
    let queue = web::Data::new(queue);
    let frontend = web::Data::new(frontend);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(settings.clone())
            .app_data(cache.clone())
            .app_data(queue.clone())
            .app_data(frontend.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(ping)
            .service(judge_handler)
            .service(pull_test_cases_handler)
    })
    .bind(bind)?
    .run();

    Ok(server)
}
