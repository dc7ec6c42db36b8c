use actix_web::{get, post, web, HttpResponse, Responder, Scope};
use serde::Serialize;

use crate::{error::Error, scheduler::Scheduler};

#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    status: &'static str,
}

fn lifecycle_response(res: Result<(), Error>, done: &str, running: bool) -> HttpResponse {
    let state = if running { "running" } else { "stopped" };

    match res {
        Ok(()) => HttpResponse::Ok().json(LifecycleResponse {
            message: Some(done.to_owned()),
            error: None,
            status: state,
        }),
        Err(e @ (Error::AlreadyRunning | Error::NotRunning)) => {
            HttpResponse::BadRequest().json(LifecycleResponse {
                message: None,
                error: Some(e.to_string()),
                status: state,
            })
        }
        Err(e) => actix_web::ResponseError::error_response(&e),
    }
}

#[post("/start")]
async fn start(scheduler: web::Data<Scheduler>) -> impl Responder {
    let res = scheduler.start().await;
    lifecycle_response(res, "Scheduler started", scheduler.is_running())
}

#[post("/stop")]
async fn stop(scheduler: web::Data<Scheduler>) -> impl Responder {
    let res = scheduler.stop().await;
    lifecycle_response(res, "Scheduler stopped", scheduler.is_running())
}

#[get("/status")]
async fn scheduler_status(scheduler: web::Data<Scheduler>) -> impl Responder {
    web::Json(scheduler.status())
}

pub fn service() -> Scope {
    web::scope("/scheduler")
        .service(start)
        .service(stop)
        .service(scheduler_status)
}
