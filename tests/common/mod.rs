#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use url::Url;
use uuid::Uuid;

use plume::app::feed::FeedView;
use plume::config::AppConfig;
use plume::domain::engagement::Comment;
use plume::domain::post::{FeedPost, Post};
use plume::domain::user::User;
use plume::AppState;

pub const DEFAULT_PASSWORD: &str = "testpassword123";

/// Wait until the live view satisfies the predicate, or fail after 5s.
pub async fn wait_for_feed(view: &FeedView, predicate: impl Fn(&[FeedPost]) -> bool) {
    let mut watch = view.watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let posts = watch.borrow_and_update();
                if predicate(posts.as_slice()) {
                    return;
                }
            }
            watch.changed().await.expect("feed view closed");
        }
    })
    .await
    .expect("timed out waiting for feed update");
}

// ---------------------------------------------------------------------------
// TestApp — a client AppState wired to an in-process mock backend
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub state: AppState,
    pub backend: MockBackend,
    config: AppConfig,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let backend = MockBackend::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock backend");
        let addr = listener.local_addr().expect("mock backend has no addr");
        let app = router(backend.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock backend died");
        });

        let config = AppConfig {
            backend_url: Url::parse(&format!("http://{}", addr)).expect("mock backend url"),
            anon_key: "test-anon-key".to_string(),
            storage_bucket: "posts".to_string(),
            session_file: None,
            http_timeout_seconds: 5,
            realtime_heartbeat_seconds: 1,
        };
        let state = AppState::connect(&config)
            .await
            .expect("failed to connect client to mock backend");

        Self {
            state,
            backend,
            config,
        }
    }

    /// A second client against the same backend, e.g. to exercise session
    /// restore across "process" restarts.
    pub async fn connect_client(&self, session_file: Option<std::path::PathBuf>) -> AppState {
        let mut config = self.config.clone();
        config.session_file = session_file;
        AppState::connect(&config)
            .await
            .expect("failed to connect client to mock backend")
    }

    // ------------------------------------------------------------------
    // Seeding — direct writes into the mock backend's state
    // ------------------------------------------------------------------

    pub fn create_user(&self, name: &str) -> User {
        let email = format!("{}@example.com", name);
        let user_id = self
            .backend
            .register_credentials(&email, DEFAULT_PASSWORD);
        let row = self.backend.insert_row(
            "users",
            json!({
                "id": user_id,
                "email": email,
                "display_name": name,
                "created_at": rfc3339(OffsetDateTime::now_utc()),
            }),
        );
        serde_json::from_value(row).expect("seeded user row is not a User")
    }

    pub async fn sign_in(&self, user: &User) {
        self.state
            .auth
            .sign_in_with_password(&user.email, DEFAULT_PASSWORD)
            .await
            .expect("sign in failed");
    }

    pub fn seed_post(&self, author: &User, content: &str, created_at: OffsetDateTime) -> Post {
        let row = self.backend.insert_row(
            "posts",
            json!({
                "user_id": author.id,
                "user_name": author.display_name,
                "user_email": author.email,
                "content": content,
                "image_url": null,
                "created_at": rfc3339(created_at),
                "updated_at": rfc3339(created_at),
            }),
        );
        serde_json::from_value(row).expect("seeded post row is not a Post")
    }

    pub fn seed_like(&self, post: &Post, user: &User) {
        self.backend.insert_row(
            "likes",
            json!({ "post_id": post.id, "user_id": user.id }),
        );
    }

    pub fn seed_comment(&self, post: &Post, user: &User, content: &str) -> Comment {
        let row = self.backend.insert_row(
            "comments",
            json!({
                "post_id": post.id,
                "user_id": user.id,
                "user_name": user.display_name,
                "content": content,
            }),
        );
        serde_json::from_value(row).expect("seeded comment row is not a Comment")
    }
}

pub fn rfc3339(timestamp: OffsetDateTime) -> String {
    timestamp.format(&Rfc3339).expect("timestamp formats")
}

// ---------------------------------------------------------------------------
// MockBackend — in-memory relations, storage, auth tokens, change fan-out
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    credentials: Mutex<HashMap<String, (Uuid, String)>>,
    tokens: Mutex<HashMap<String, Uuid>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    changes: broadcast::Sender<Change>,
    rest_requests: AtomicUsize,
    fail_uploads: AtomicBool,
    fail_logout: AtomicBool,
    fail_inserts: Mutex<HashSet<String>>,
    delay_next_read: Mutex<Option<Duration>>,
}

#[derive(Debug, Clone)]
struct Change {
    table: String,
    kind: &'static str,
    old: Option<Value>,
    new: Option<Value>,
}

impl MockBackend {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BackendInner {
                tables: Mutex::new(HashMap::new()),
                credentials: Mutex::new(HashMap::new()),
                tokens: Mutex::new(HashMap::new()),
                objects: Mutex::new(HashMap::new()),
                changes,
                rest_requests: AtomicUsize::new(0),
                fail_uploads: AtomicBool::new(false),
                fail_logout: AtomicBool::new(false),
                fail_inserts: Mutex::new(HashSet::new()),
                delay_next_read: Mutex::new(None),
            }),
        }
    }

    pub fn register_credentials(&self, email: &str, password: &str) -> Uuid {
        let user_id = Uuid::new_v4();
        self.inner
            .credentials
            .lock()
            .unwrap()
            .insert(email.to_string(), (user_id, password.to_string()));
        user_id
    }

    /// Insert a row, filling in id/timestamps the way the backend would,
    /// and fan the change out to realtime subscribers.
    pub fn insert_row(&self, table: &str, mut row: Value) -> Value {
        let now = rfc3339(OffsetDateTime::now_utc());
        {
            let object = row.as_object_mut().expect("row must be a JSON object");
            object
                .entry("id")
                .or_insert_with(|| json!(Uuid::new_v4()));
            object
                .entry("created_at")
                .or_insert_with(|| json!(now.clone()));
            if table == "posts" {
                object.entry("updated_at").or_insert_with(|| json!(now));
            }
        }
        self.inner
            .tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        let _ = self.inner.changes.send(Change {
            table: table.to_string(),
            kind: "INSERT",
            old: None,
            new: Some(row.clone()),
        });
        row
    }

    fn delete_rows(&self, table: &str, params: &[(String, String)]) -> usize {
        let mut removed = Vec::new();
        {
            let mut tables = self.inner.tables.lock().unwrap();
            let rows = tables.entry(table.to_string()).or_default();
            rows.retain(|row| {
                if matches_filters(row, params) {
                    removed.push(row.clone());
                    false
                } else {
                    true
                }
            });
        }
        for row in &removed {
            let _ = self.inner.changes.send(Change {
                table: table.to_string(),
                kind: "DELETE",
                old: Some(row.clone()),
                new: None,
            });
        }
        removed.len()
    }

    fn select(&self, table: &str, params: &[(String, String)]) -> Vec<Value> {
        let mut rows = self
            .inner
            .tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default();
        rows.retain(|row| matches_filters(row, params));

        if let Some((_, order)) = params.iter().find(|(key, _)| key == "order") {
            if let Some(column) = order.strip_suffix(".desc") {
                let column = column.to_string();
                rows.sort_by(|a, b| row_timestamp(b, &column).cmp(&row_timestamp(a, &column)));
            }
        }
        if let Some((_, limit)) = params.iter().find(|(key, _)| key == "limit") {
            if let Ok(limit) = limit.parse::<usize>() {
                rows.truncate(limit);
            }
        }
        rows
    }

    fn issue_tokens(&self, user_id: Uuid) -> Value {
        let access = format!("access-{}", Uuid::new_v4());
        let refresh = format!("refresh-{}", Uuid::new_v4());
        {
            let mut tokens = self.inner.tokens.lock().unwrap();
            tokens.insert(access.clone(), user_id);
            tokens.insert(refresh.clone(), user_id);
        }
        json!({
            "access_token": access,
            "refresh_token": refresh,
            "expires_in": 3600,
            "user": { "id": user_id },
        })
    }

    // ------------------------------------------------------------------
    // Inspection and fault injection
    // ------------------------------------------------------------------

    pub fn rest_requests(&self) -> usize {
        self.inner.rest_requests.load(Ordering::SeqCst)
    }

    pub fn table_len(&self, table: &str) -> usize {
        self.inner
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.inner.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.inner.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_logout(&self, fail: bool) {
        self.inner.fail_logout.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_insert(&self, table: &str, fail: bool) {
        let mut failing = self.inner.fail_inserts.lock().unwrap();
        if fail {
            failing.insert(table.to_string());
        } else {
            failing.remove(table);
        }
    }

    /// Delay the next read of a relation, after it has snapshotted its
    /// rows. Lets a test hold an early response in flight while a later
    /// one completes.
    pub fn delay_next_read(&self, delay: Duration) {
        *self.inner.delay_next_read.lock().unwrap() = Some(delay);
    }
}

fn matches_filters(row: &Value, params: &[(String, String)]) -> bool {
    params.iter().all(|(column, predicate)| {
        if column == "select" || column == "order" || column == "limit" {
            return true;
        }
        let actual = row.get(column).map(value_text).unwrap_or_default();
        if let Some(expected) = predicate.strip_prefix("eq.") {
            actual == expected
        } else if let Some(list) = predicate.strip_prefix("in.(") {
            let list = list.trim_end_matches(')');
            !list.is_empty() && list.split(',').any(|candidate| candidate == actual)
        } else {
            true
        }
    })
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn row_timestamp(row: &Value, column: &str) -> OffsetDateTime {
    row.get(column)
        .and_then(Value::as_str)
        .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

fn router(backend: MockBackend) -> Router {
    Router::new()
        .route("/auth/v1/signup", post(auth_signup))
        .route("/auth/v1/token", post(auth_token))
        .route("/auth/v1/logout", post(auth_logout))
        .route(
            "/rest/v1/:table",
            get(rest_select).post(rest_insert).delete(rest_delete),
        )
        .route("/storage/v1/object/:bucket/*key", post(storage_upload))
        .route("/storage/v1/object/public/:bucket/*key", get(storage_download))
        .route("/realtime/v1/websocket", get(realtime_ws))
        .with_state(backend)
}

#[derive(serde::Deserialize)]
struct SignUpBody {
    email: String,
    password: String,
    #[serde(default)]
    data: Value,
}

async fn auth_signup(
    State(backend): State<MockBackend>,
    Json(body): Json<SignUpBody>,
) -> Response {
    if backend
        .inner
        .credentials
        .lock()
        .unwrap()
        .contains_key(&body.email)
    {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "email already registered");
    }
    let display_name = body
        .data
        .get("display_name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let user_id = backend.register_credentials(&body.email, &body.password);
    // The backend provisions the profile row alongside the account.
    backend.insert_row(
        "users",
        json!({
            "id": user_id,
            "email": body.email,
            "display_name": display_name,
        }),
    );
    Json(backend.issue_tokens(user_id)).into_response()
}

async fn auth_token(
    State(backend): State<MockBackend>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    match params.get("grant_type").map(String::as_str) {
        Some("password") => {
            let email = body["email"].as_str().unwrap_or_default();
            let password = body["password"].as_str().unwrap_or_default();
            let user_id = {
                let credentials = backend.inner.credentials.lock().unwrap();
                match credentials.get(email) {
                    Some((user_id, stored)) if stored == password => Some(*user_id),
                    _ => None,
                }
            };
            match user_id {
                Some(user_id) => Json(backend.issue_tokens(user_id)).into_response(),
                None => error_response(StatusCode::BAD_REQUEST, "invalid login credentials"),
            }
        }
        Some("refresh_token") => {
            let token = body["refresh_token"].as_str().unwrap_or_default();
            let user_id = backend.inner.tokens.lock().unwrap().get(token).copied();
            match user_id {
                Some(user_id) => Json(backend.issue_tokens(user_id)).into_response(),
                None => error_response(StatusCode::BAD_REQUEST, "invalid refresh token"),
            }
        }
        _ => error_response(StatusCode::BAD_REQUEST, "unsupported grant type"),
    }
}

async fn auth_logout(State(backend): State<MockBackend>, headers: HeaderMap) -> Response {
    if backend.inner.fail_logout.load(Ordering::SeqCst) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "logout unavailable");
    }
    if let Some(token) = bearer(&headers) {
        backend.inner.tokens.lock().unwrap().remove(&token);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn rest_select(
    State(backend): State<MockBackend>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    backend.inner.rest_requests.fetch_add(1, Ordering::SeqCst);
    let rows = backend.select(&table, &params);
    let delay = backend.inner.delay_next_read.lock().unwrap().take();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    Json(rows).into_response()
}

async fn rest_insert(
    State(backend): State<MockBackend>,
    Path(table): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    backend.inner.rest_requests.fetch_add(1, Ordering::SeqCst);
    if backend.inner.fail_inserts.lock().unwrap().contains(&table) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "insert rejected");
    }
    let row = backend.insert_row(&table, body);
    Json(vec![row]).into_response()
}

async fn rest_delete(
    State(backend): State<MockBackend>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    backend.inner.rest_requests.fetch_add(1, Ordering::SeqCst);
    backend.delete_rows(&table, &params);
    StatusCode::NO_CONTENT.into_response()
}

async fn storage_upload(
    State(backend): State<MockBackend>,
    Path((bucket, key)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if backend.inner.fail_uploads.load(Ordering::SeqCst) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable");
    }
    backend
        .inner
        .objects
        .lock()
        .unwrap()
        .insert(format!("{}/{}", bucket, key), body.to_vec());
    Json(json!({ "Key": format!("{}/{}", bucket, key) })).into_response()
}

async fn storage_download(
    State(backend): State<MockBackend>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    match backend
        .inner
        .objects
        .lock()
        .unwrap()
        .get(&format!("{}/{}", bucket, key))
    {
        Some(bytes) => bytes.clone().into_response(),
        None => error_response(StatusCode::NOT_FOUND, "object not found"),
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

// ---------------------------------------------------------------------------
// Realtime fan-out
// ---------------------------------------------------------------------------

struct TableSub {
    table: String,
    filter: Option<String>,
}

impl TableSub {
    fn matches(&self, change: &Change) -> bool {
        if self.table != change.table {
            return false;
        }
        let Some(filter) = &self.filter else {
            return true;
        };
        let Some((column, expected)) = filter.split_once("=eq.") else {
            return true;
        };
        change
            .new
            .as_ref()
            .or(change.old.as_ref())
            .and_then(|row| row.get(column))
            .map(|value| value_text(value) == expected)
            .unwrap_or(false)
    }
}

async fn realtime_ws(State(backend): State<MockBackend>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| realtime_session(backend, socket))
}

async fn realtime_session(backend: MockBackend, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut changes = backend.inner.changes.subscribe();
    let mut subscriptions: Vec<(String, Vec<TableSub>)> = Vec::new();

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let topic = frame["topic"].as_str().unwrap_or_default().to_string();
                    match frame["event"].as_str() {
                        Some("subscribe") => {
                            let tables = frame["payload"]["tables"]
                                .as_array()
                                .cloned()
                                .unwrap_or_default()
                                .into_iter()
                                .filter_map(|spec| {
                                    Some(TableSub {
                                        table: spec["table"].as_str()?.to_string(),
                                        filter: spec["filter"].as_str().map(str::to_string),
                                    })
                                })
                                .collect();
                            subscriptions.retain(|(existing, _)| existing != &topic);
                            let ack = json!({ "topic": topic.clone(), "event": "ok" });
                            subscriptions.push((topic, tables));
                            if sender.send(Message::Text(ack.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Some("unsubscribe") => {
                            subscriptions.retain(|(existing, _)| existing != &topic);
                        }
                        _ => {}
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            change = changes.recv() => {
                let change = match change {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                for (topic, tables) in &subscriptions {
                    if tables.iter().any(|sub| sub.matches(&change)) {
                        let frame = json!({
                            "topic": topic,
                            "event": "change",
                            "payload": {
                                "table": change.table,
                                "type": change.kind,
                                "old": change.old,
                                "new": change.new,
                            },
                        });
                        if sender.send(Message::Text(frame.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
