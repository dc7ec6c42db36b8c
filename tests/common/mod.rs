#![allow(dead_code)]

use std::{
    collections::VecDeque,
    net::SocketAddr,
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use actix_web::{
    http::{header, StatusCode},
    web, App, HttpRequest, HttpResponse, HttpServer,
};
use courier::{
    db::message::MessageStore,
    delivery::{BackoffPolicy, WebhookClient},
    message::CreateMessageRequest,
    service::MessageService,
};
use tempfile::TempDir;

#[derive(Default)]
pub struct MockState {
    script: Mutex<VecDeque<u16>>,
    fallback: u16,
    body: Option<String>,
    hits: AtomicUsize,
    payloads: Mutex<Vec<serde_json::Value>>,
    user_agents: Mutex<Vec<String>>,
}

/// Webhook receiver on an ephemeral port. Answers with the scripted statuses
/// in order, then with `fallback` forever.
pub struct MockEndpoint {
    state: Arc<MockState>,
    addr: SocketAddr,
}

async fn hook(
    state: web::Data<MockState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> HttpResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);

    if let Some(ua) = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
    {
        state.user_agents.lock().unwrap().push(ua.to_owned());
    }
    state.payloads.lock().unwrap().push(body.into_inner());

    let status = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(state.fallback);

    let body = state
        .body
        .clone()
        .unwrap_or_else(|| format!("status {status}"));

    HttpResponse::build(StatusCode::from_u16(status).unwrap()).body(body)
}

impl MockEndpoint {
    pub fn start(script: impl IntoIterator<Item = u16>, fallback: u16) -> Self {
        Self::serve(MockState {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            ..Default::default()
        })
    }

    /// Always answers `status` with `body`.
    pub fn with_body(status: u16, body: String) -> Self {
        Self::serve(MockState {
            fallback: status,
            body: Some(body),
            ..Default::default()
        })
    }

    fn serve(state: MockState) -> Self {
        let state = Arc::new(state);

        let data = web::Data::from(state.clone());

        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/hook", web::post().to(hook))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];

        actix_web::rt::spawn(server.run());

        Self { state, addr }
    }

    pub fn always(status: u16) -> Self {
        Self::start(std::iter::empty(), status)
    }

    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.state.payloads.lock().unwrap().clone()
    }

    pub fn user_agents(&self) -> Vec<String> {
        self.state.user_agents.lock().unwrap().clone()
    }
}

/// A URL nothing listens on.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    format!("http://{addr}/hook")
}

/// Short waits so retry tests finish quickly.
pub fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        min: Duration::from_millis(10),
        max: Duration::from_secs(2),
        jitter: Duration::ZERO,
        max_retries: 2,
    }
}

pub fn webhook_client() -> WebhookClient {
    WebhookClient::new(fast_policy(), Duration::from_secs(2)).unwrap()
}

pub struct TmpService {
    svc: MessageService,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = MessageService;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

impl TmpService {
    pub fn path(&self) -> std::path::PathBuf {
        self.tmpdir.path().join("courier.db")
    }
}

pub async fn setup() -> TmpService {
    let tmpdir = tempfile::tempdir().unwrap();
    let pool = courier::db::connect(tmpdir.path().join("courier.db").to_string_lossy())
        .await
        .unwrap();

    TmpService {
        svc: MessageService::builder()
            .store(MessageStore::new(pool))
            .delivery(Arc::new(webhook_client()))
            .build()
            .unwrap(),
        tmpdir,
    }
}

pub fn request(webhook_url: impl Into<String>) -> CreateMessageRequest {
    CreateMessageRequest {
        recipient: "a@b.com".to_owned(),
        content: "hi".to_owned(),
        webhook_url: webhook_url.into(),
        max_retries: None,
    }
}
