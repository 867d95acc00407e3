pub mod auth;
pub mod chat;
pub mod http;
pub mod presence;
pub mod router;

use self::auth::AuthService;
use self::chat::ChatService;
use self::presence::PresenceService;
use self::router::{Router, SessionEntry, SessionMap, spawn_reconciler, spawn_subscriber};
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::util::{now_millis, query_param};
use edgechat_proto::{CodecError, Frame, FrameData, FrameType, decode_frame_prefix};
use edgechat_storage::{Storage, StorageError, connect, discover_master, generate_token};
use pingora::apps::{HttpServerApp, HttpServerOptions};
use pingora::http::ResponseHeader;
use pingora::protocols::Stream as ReusedHttpStream;
use pingora::protocols::http::ServerSession;
use pingora::protocols::http::v2::server::H2Options;
use pingora::server::ShutdownWatch;
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::select;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE_DEPTH: usize = 128;
const CHAT_QUEUE_DEPTH: usize = 64;
const HEARTBEAT_TICK_SECS: u64 = 5;

#[derive(Debug)]
pub enum ServerError {
    Invalid,
    Io,
    Codec,
    Storage,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid request"),
            Self::Io => write!(f, "io failure"),
            Self::Codec => write!(f, "codec failure"),
            Self::Storage => write!(f, "storage failure"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(_: StorageError) -> Self {
        ServerError::Storage
    }
}

impl From<CodecError> for ServerError {
    fn from(_: CodecError) -> Self {
        ServerError::Codec
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    pub sessions: SessionMap,
    pub router: Arc<Router>,
    pub presence: Arc<PresenceService>,
    pub auth: AuthService,
    pub chat: ChatService,
}

// One unit of CHAT_SEND work, processed strictly in arrival order per
// session so ACKs mirror send order.
struct ChatJob {
    to: i64,
    content: String,
    request_id: u64,
}

pub struct EdgeChatApp {
    pub state: Arc<AppState>,
}

impl EdgeChatApp {
    pub fn new(state: Arc<AppState>) -> Self {
        EdgeChatApp { state }
    }

    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let redis_url = match &config.sentinel {
            Some(sentinel) => {
                let (host, port) =
                    discover_master(&sentinel.host, sentinel.port, &sentinel.master_name).await?;
                info!(host = %host, port, "cache master discovered via sentinel");
                format!("redis://{}:{}/", host, port)
            }
            None => config.cache.url(),
        };
        let storage = Arc::new(
            connect(
                &config.database.dsn(),
                config.replica_dsn().as_deref(),
                &redis_url,
            )
            .await?,
        );
        storage.migrate().await?;
        let metrics = Arc::new(Metrics::new());
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let router = Arc::new(Router::new(
            Arc::clone(&storage),
            Arc::clone(&metrics),
            config.gateway_id.clone(),
            Arc::clone(&sessions),
        ));
        let presence = Arc::new(PresenceService::new(
            Arc::clone(&storage),
            Arc::clone(&router),
            Arc::clone(&metrics),
            StdDuration::from_secs(config.limits.presence_grace_seconds),
        ));
        let auth = AuthService::new(Arc::clone(&storage), Arc::clone(&presence));
        let chat = ChatService::new(Arc::clone(&storage), config.limits.history_limit);
        spawn_subscriber(Arc::clone(&router));
        spawn_reconciler(Arc::clone(&router));
        Ok(Arc::new(AppState {
            config,
            storage,
            metrics,
            sessions,
            router,
            presence,
            auth,
            chat,
        }))
    }
}

impl HttpServerApp for EdgeChatApp {
    fn process_new_http<'life0, 'life1, 'async_trait>(
        self: &'life0 Arc<Self>,
        session: ServerSession,
        shutdown: &'life1 ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = Option<ReusedHttpStream>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move { self.handle_session(session, shutdown).await })
    }

    fn h2_options(&self) -> Option<H2Options> {
        None
    }

    fn server_options(&self) -> Option<&HttpServerOptions> {
        None
    }
}

impl EdgeChatApp {
    async fn handle_session(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        match session.read_request().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                error!("failed to read request: {}", err);
                return None;
            }
        }
        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.to_string();
        match path.as_str() {
            "/healthz" => {
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response.append_header("content-type", "text/plain").ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(Vec::from("ok".as_bytes()).into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            "/readyz" => {
                if self.state.storage.readiness().await.is_ok() {
                    let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                    response.append_header("content-type", "text/plain").ok()?;
                    session
                        .write_response_header(Box::new(response))
                        .await
                        .ok()?;
                    session
                        .write_response_body(Vec::from("ready".as_bytes()).into(), true)
                        .await
                        .ok()?;
                } else {
                    let mut response = ResponseHeader::build_no_case(503, None).ok()?;
                    response.append_header("content-type", "text/plain").ok()?;
                    session
                        .write_response_header(Box::new(response))
                        .await
                        .ok()?;
                    session
                        .write_response_body(Vec::from("degraded".as_bytes()).into(), true)
                        .await
                        .ok()?;
                }
                session.finish().await.ok()?;
                return None;
            }
            "/metrics" => {
                let payload = self.state.metrics.encode_prometheus();
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "text/plain; version=0.0.4")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(payload.into_bytes().into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            _ => {}
        }
        if path == "/connect" && (method == "POST" || method == "GET") {
            return self.process_connect(session, shutdown).await;
        }
        let handled = match (method.as_str(), path.as_str()) {
            ("POST", "/api/register") => Some(http::handle_register(&self.state, &mut session).await),
            ("POST", "/api/login") => Some(http::handle_login(&self.state, &mut session).await),
            ("POST", "/api/friend/add") => {
                Some(http::handle_friend_add(&self.state, &mut session).await)
            }
            ("POST", "/api/friend/request/handle") => {
                Some(http::handle_friend_request_handle(&self.state, &mut session).await)
            }
            ("POST", "/api/friend/delete") => {
                Some(http::handle_friend_delete(&self.state, &mut session).await)
            }
            ("POST", "/api/ack") => Some(http::handle_ack(&self.state, &mut session).await),
            ("GET", "/api/friend/list") => {
                Some(http::handle_friend_list(&self.state, &mut session).await)
            }
            ("GET", "/api/friend/requests") => {
                Some(http::handle_friend_requests(&self.state, &mut session).await)
            }
            ("GET", "/api/history") => Some(http::handle_history(&self.state, &mut session).await),
            ("GET", "/api/sessions") => Some(http::handle_sessions(&self.state, &mut session).await),
            _ => None,
        };
        if let Some(result) = handled {
            self.state.metrics.mark_http_request();
            if let Err(err) = result {
                http::respond_api_error(&mut session, err).await;
            }
            return None;
        }
        let _ = self.respond_status(&mut session, 404, "not found").await;
        session.finish().await.ok()?;
        None
    }

    async fn respond_status(
        &self,
        session: &mut ServerSession,
        status: u16,
        message: &str,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", "application/json")
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        let body = json!({
            "success": false,
            "message": message,
        })
        .to_string();
        session
            .write_response_body(body.into_bytes().into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn write_frame(
        &self,
        session: &mut ServerSession,
        frame: Frame,
    ) -> Result<(), ServerError> {
        let encoded = frame.encode()?;
        session
            .write_response_body(encoded.into(), false)
            .await
            .map_err(|_| ServerError::Io)?;
        self.state.metrics.mark_egress();
        Ok(())
    }

    /// The long-lived client session. The request body carries inbound
    /// frames, the response body outbound frames, both for the life of the
    /// connection.
    async fn process_connect(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        let token = query_param(session.req_header().uri.query(), "token").unwrap_or_default();
        let verified = match self.state.auth.verify_token(&token).await {
            Ok(value) => value,
            Err(err) => {
                error!("token verification unavailable: {}", err);
                let _ = self
                    .respond_status(&mut session, 503, "verification unavailable")
                    .await;
                session.finish().await.ok()?;
                return None;
            }
        };

        // The framing handshake completes either way; a failed verification
        // is answered with a policy error frame and an immediate close.
        let mut response = ResponseHeader::build_no_case(200, None).ok()?;
        response
            .append_header("content-type", "application/octet-stream")
            .ok()?;
        response.append_header("cache-control", "no-store").ok()?;
        session
            .write_response_header(Box::new(response))
            .await
            .ok()?;

        let Some(user_id) = verified else {
            warn!("connect rejected: invalid token");
            let _ = self
                .write_frame(&mut session, Frame::error_frame(0, "invalid token"))
                .await;
            session.finish().await.ok()?;
            return None;
        };

        let session_id = generate_token();
        let (tx_out, mut rx_out) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_DEPTH);
        let (close_tx, mut close_rx) = watch::channel(false);
        {
            // The displaced session is signalled before the new entry is
            // visible, so its teardown sees itself deregistered.
            let mut sessions = self.state.sessions.write().await;
            if let Some(displaced) = sessions.remove(&user_id) {
                info!(user = user_id, "existing session displaced by new registration");
                let _ = displaced.close.send(true);
            }
            sessions.insert(
                user_id,
                SessionEntry {
                    session_id: session_id.clone(),
                    sender: tx_out.clone(),
                    close: close_tx,
                },
            );
        }
        self.state.metrics.incr_connections();
        info!(user = user_id, session = %session_id, "session joined");

        if let Err(err) = self
            .state
            .storage
            .assign_directory(user_id, &self.state.config.gateway_id)
            .await
        {
            warn!(user = user_id, "directory assignment failed: {}", err);
        }

        // Presence owns the friend broadcast; the edge only logs the reply.
        match self.state.presence.login(user_id).await {
            Ok(online_friends) => {
                debug!(
                    user = user_id,
                    online_friends = online_friends.len(),
                    "presence login complete"
                );
            }
            Err(err) => warn!(user = user_id, "presence login failed: {}", err),
        }

        // Offline drain goes to this session only, ordered by timestamp
        // then message id. Written straight to the stream so an arbitrarily
        // large backlog cannot exhaust the outbound queue before the write
        // pump starts.
        match self.state.chat.offline_messages(user_id).await {
            Ok(messages) => {
                let drained = messages.len() as u64;
                for record in messages.into_iter() {
                    let frame = Frame::chat_push(
                        record.msg_id,
                        record.from_user_id,
                        record.to_user_id,
                        record.content,
                        record.timestamp,
                    );
                    if self.write_frame(&mut session, frame).await.is_err() {
                        self.cleanup_session(user_id, &session_id).await;
                        session.finish().await.ok()?;
                        return None;
                    }
                }
                if drained > 0 {
                    self.state.metrics.mark_offline_drained(drained);
                    info!(user = user_id, messages = drained, "offline drain delivered");
                }
            }
            Err(err) => warn!(user = user_id, "offline drain failed: {}", err),
        }

        let (jobs_tx, jobs_rx) = mpsc::channel::<ChatJob>(CHAT_QUEUE_DEPTH);
        spawn_chat_worker(
            Arc::clone(&self.state),
            user_id,
            tx_out.clone(),
            jobs_rx,
        );

        let mut buffer: Vec<u8> = Vec::new();
        let mut shutdown_rx = shutdown.clone();
        let mut ticker = interval(StdDuration::from_secs(HEARTBEAT_TICK_SECS));
        let idle_after = StdDuration::from_secs(self.state.config.limits.heartbeat_idle_seconds);
        let dead_after = StdDuration::from_secs(self.state.config.limits.heartbeat_dead_seconds);
        let mut last_activity = Instant::now();
        let mut ping_sent = false;

        'session_loop: loop {
            select! {
                inbound = session.read_request_body() => {
                    match inbound {
                        Ok(Some(chunk)) => {
                            if chunk.is_empty() {
                                continue;
                            }
                            buffer.extend_from_slice(chunk.as_ref());
                            loop {
                                match decode_frame_prefix(&buffer) {
                                    Ok(Some((body_len, header_len))) => {
                                        let total = header_len + body_len;
                                        let body = buffer[header_len..total].to_vec();
                                        buffer.drain(0..total);
                                        self.state.metrics.mark_ingress();
                                        last_activity = Instant::now();
                                        ping_sent = false;
                                        match Frame::parse_body(&body) {
                                            Ok(frame) => {
                                                self.handle_client_frame(
                                                    user_id, frame, &jobs_tx, &tx_out,
                                                );
                                            }
                                            Err(err) => {
                                                // The stream stays usable; only
                                                // this frame is lost.
                                                warn!(
                                                    user = user_id,
                                                    "malformed frame dropped: {}", err
                                                );
                                            }
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(err) => {
                                        error!(
                                            user = user_id,
                                            "unrecoverable framing error: {}", err
                                        );
                                        break 'session_loop;
                                    }
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(user = user_id, "read failure: {}", err);
                            break;
                        }
                    }
                }
                outbound = rx_out.recv() => {
                    match outbound {
                        Some(frame) => {
                            if let Err(err) = self.write_frame(&mut session, frame).await {
                                debug!(user = user_id, "outbound write failed: {}", err);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = close_rx.changed() => {
                    debug!(user = user_id, "session closed by displacement");
                    break;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let idle = last_activity.elapsed();
                    if idle >= dead_after {
                        info!(user = user_id, "heartbeat timeout, disconnecting");
                        break;
                    }
                    if idle >= idle_after && !ping_sent {
                        let _ = tx_out.try_send(Frame::heartbeat_ping());
                        ping_sent = true;
                    }
                }
            }
        }

        // Dropping the job queue lets in-flight saves run to completion;
        // their ACKs land in a closed channel and vanish harmlessly.
        drop(jobs_tx);
        self.cleanup_session(user_id, &session_id).await;
        session.finish().await.ok()?;
        None
    }

    // Reader-side dispatch never awaits queue capacity: the same loop also
    // drains the outbound queue, so a blocking enqueue here could wedge the
    // session under flood. Replies that find a full queue are dropped and
    // the client retries by request id.
    fn handle_client_frame(
        &self,
        user_id: i64,
        frame: Frame,
        jobs: &mpsc::Sender<ChatJob>,
        outbound: &mpsc::Sender<Frame>,
    ) {
        let request_id = frame.request_id;
        match frame.frame_type {
            FrameType::ChatSend => {
                let FrameData::Chat(chat) = frame.data else {
                    let _ =
                        outbound.try_send(Frame::error_frame(request_id, "malformed chat payload"));
                    return;
                };
                if chat.to_user_id <= 0 || chat.to_user_id == user_id {
                    let _ = outbound.try_send(Frame::error_frame(request_id, "invalid recipient"));
                    return;
                }
                let job = ChatJob {
                    to: chat.to_user_id,
                    content: chat.content,
                    request_id,
                };
                if jobs.try_send(job).is_err() {
                    warn!(user = user_id, "chat queue full, send rejected");
                    let _ =
                        outbound.try_send(Frame::error_frame(request_id, "failed to save message"));
                }
            }
            FrameType::HeartbeatPing => {
                let _ = outbound.try_send(Frame::heartbeat_pong());
            }
            FrameType::HeartbeatPong => {}
            other => {
                debug!(user = user_id, frame = ?other, "unexpected client frame dropped");
            }
        }
    }

    /// Idempotent teardown: only the still-registered session deregisters,
    /// releases the directory entry, and evaluates the presence transition.
    /// A displaced session finds a newer entry and leaves all three alone.
    async fn cleanup_session(&self, user_id: i64, session_id: &str) {
        let last_local = {
            let mut sessions = self.state.sessions.write().await;
            match sessions.get(&user_id) {
                Some(entry) if entry.session_id == session_id => {
                    sessions.remove(&user_id);
                    true
                }
                _ => false,
            }
        };
        if last_local {
            if let Err(err) = self
                .state
                .storage
                .release_directory(user_id, &self.state.config.gateway_id)
                .await
            {
                warn!(user = user_id, "directory release failed: {}", err);
            }
            if let Err(err) = self.state.presence.logout(user_id).await {
                warn!(user = user_id, "presence logout failed: {}", err);
            }
            info!(user = user_id, session = session_id, "session closed");
        } else {
            debug!(user = user_id, session = session_id, "displaced session torn down");
        }
        self.state.metrics.decr_connections();
    }
}

fn spawn_chat_worker(
    state: Arc<AppState>,
    user_id: i64,
    outbound: mpsc::Sender<Frame>,
    mut jobs: mpsc::Receiver<ChatJob>,
) {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let timestamp = now_millis();
            match state
                .chat
                .save_message(user_id, job.to, &job.content, timestamp)
                .await
            {
                Ok(msg_id) => {
                    state.metrics.mark_message_persisted();
                    let _ = outbound.send(Frame::chat_ack(job.request_id, msg_id)).await;
                    let push = Frame::chat_push(msg_id, user_id, job.to, job.content, timestamp);
                    state.router.send_to_user(job.to, push).await;
                }
                Err(err) => {
                    warn!(user = user_id, to = job.to, "message persist failed: {}", err);
                    let _ = outbound
                        .send(Frame::error_frame(job.request_id, "failed to save message"))
                        .await;
                }
            }
        }
    });
}
