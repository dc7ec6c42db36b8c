use actix_web::web;

pub mod health;
pub mod messages;
pub mod scheduler;

/// Registers every route. Expects `web::Data<MessageService>` and
/// `web::Data<Scheduler>` in app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health::healthz).service(
        web::scope("/api/v1")
            .service(messages::service())
            .service(scheduler::service()),
    );
}
