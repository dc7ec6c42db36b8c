use actix_web::{get, post, web, HttpResponse, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    message::{CreateMessageRequest, Message},
    service::MessageService,
};

const DEFAULT_PAGE_LIMIT: usize = 10;
const MAX_PAGE_LIMIT: usize = 100;
const MAX_RETRY_BATCH: usize = 100;

#[post("")]
async fn create_message(
    service: web::Data<MessageService>,
    data: web::Json<CreateMessageRequest>,
) -> Result<impl Responder, Error> {
    let message = service.create_message(data.into_inner()).await?;

    Ok(HttpResponse::Created().json(message))
}

#[derive(Debug, Deserialize)]
pub struct ListSentQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

impl ListSentQuery {
    fn page(&self) -> usize {
        self.page.filter(|p| *p >= 1).unwrap_or(1)
    }

    fn limit(&self) -> usize {
        self.limit
            .filter(|l| (1..=MAX_PAGE_LIMIT).contains(l))
            .unwrap_or(DEFAULT_PAGE_LIMIT)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSentResponse {
    pub data: Vec<Message>,
    pub total: u64,
    pub page: usize,
    pub limit: usize,
}

#[get("/sent")]
async fn list_sent(
    service: web::Data<MessageService>,
    query: web::Query<ListSentQuery>,
) -> Result<impl Responder, Error> {
    let page = query.page();
    let limit = query.limit();

    let offset = (page - 1).saturating_mul(limit);
    let (data, total) = service.list_sent(offset, limit).await?;

    Ok(web::Json(ListSentResponse {
        data,
        total,
        page,
        limit,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    batch_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub retried_count: usize,
}

#[post("/retry")]
async fn retry_failed(
    service: web::Data<MessageService>,
    data: Option<web::Json<RetryRequest>>,
) -> Result<impl Responder, Error> {
    let batch_size = data
        .and_then(|d| d.into_inner().batch_size)
        .filter(|n| *n > 0)
        .unwrap_or(service.batch_size())
        .min(MAX_RETRY_BATCH);

    let retried_count = service.retry_failed_messages(batch_size).await?;

    Ok(web::Json(RetryResponse { retried_count }))
}

#[get("/{id}")]
async fn get_message(
    service: web::Data<MessageService>,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    let id = path
        .parse::<i64>()
        .map_err(|_| Error::invalid_parameter(format!("invalid message id: {path}")))?;

    Ok(web::Json(service.get_message(id).await?))
}

pub fn service() -> Scope {
    // `/sent` must be registered ahead of `/{id}`.
    web::scope("/messages")
        .service(create_message)
        .service(list_sent)
        .service(retry_failed)
        .service(get_message)
}
