use super::AppState;
use super::auth::AuthError;
use crate::util::query_param;
use pingora::http::ResponseHeader;
use pingora::protocols::http::ServerSession;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal,
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Internal => 500,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::BadRequest(reason) => reason.as_str(),
            Self::Internal => "internal server error",
        }
    }
}

#[derive(Deserialize)]
struct CredentialsRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct FriendAddRequest {
    token: String,
    friend_id: i64,
}

#[derive(Deserialize)]
struct FriendHandleRequest {
    token: String,
    // Carries the sender's user id, not the pending-row key.
    request_id: i64,
    accept: bool,
}

#[derive(Deserialize)]
struct FriendDeleteRequest {
    token: String,
    friend_id: i64,
}

#[derive(Deserialize)]
struct AckRequest {
    token: String,
    peer_id: i64,
}

pub async fn respond_json(
    session: &mut ServerSession,
    status: u16,
    payload: Value,
) -> Result<(), ApiError> {
    let mut response = ResponseHeader::build_no_case(status, None).map_err(|_| ApiError::Internal)?;
    response
        .append_header("content-type", "application/json")
        .map_err(|_| ApiError::Internal)?;
    response
        .append_header("cache-control", "no-store")
        .map_err(|_| ApiError::Internal)?;
    session
        .write_response_header(Box::new(response))
        .await
        .map_err(|_| ApiError::Internal)?;
    session
        .write_response_body(payload.to_string().into_bytes().into(), true)
        .await
        .map_err(|_| ApiError::Internal)?;
    Ok(())
}

pub async fn respond_api_error(session: &mut ServerSession, error: ApiError) {
    let payload = json!({
        "success": false,
        "message": error.message(),
    });
    let _ = respond_json(session, error.status(), payload).await;
}

async fn read_body(session: &mut ServerSession) -> Result<Vec<u8>, ApiError> {
    let mut body = Vec::new();
    loop {
        match session.read_request_body().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(_) => return Err(ApiError::Internal),
        }
    }
    Ok(body)
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice::<T>(body)
        .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))
}

async fn respond_rejection(session: &mut ServerSession, status: u16, message: &str) {
    let payload = json!({
        "success": false,
        "message": message,
    });
    let _ = respond_json(session, status, payload).await;
}

/// Resolves the bearer token or answers 401. `Ok(None)` means the response
/// has already been written.
async fn require_token(
    state: &Arc<AppState>,
    session: &mut ServerSession,
    token: Option<&str>,
) -> Result<Option<i64>, ApiError> {
    let token = token.unwrap_or_default();
    match state.auth.verify_token(token).await {
        Ok(Some(user_id)) => Ok(Some(user_id)),
        Ok(None) => {
            debug!("request with invalid token rejected");
            respond_rejection(session, 401, "invalid token").await;
            Ok(None)
        }
        Err(_) => Err(ApiError::Internal),
    }
}

pub async fn handle_register(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let body = read_body(session).await?;
    let request: CredentialsRequest = parse_json(&body)?;
    match state.auth.register(&request.username, &request.password).await {
        Ok(user_id) => {
            respond_json(
                session,
                200,
                json!({
                    "success": true,
                    "message": "register successful",
                    "user_id": user_id,
                }),
            )
            .await
        }
        Err(AuthError::Rejected(message)) => {
            respond_rejection(session, 200, &message).await;
            Ok(())
        }
        Err(AuthError::Backend) => Err(ApiError::Internal),
    }
}

pub async fn handle_login(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let body = read_body(session).await?;
    let request: CredentialsRequest = parse_json(&body)?;
    match state.auth.login(&request.username, &request.password).await {
        Ok(outcome) => {
            respond_json(
                session,
                200,
                json!({
                    "success": true,
                    "message": "login successful",
                    "token": outcome.token,
                    "user_id": outcome.user_id,
                }),
            )
            .await
        }
        Err(AuthError::Rejected(message)) => {
            respond_rejection(session, 401, &message).await;
            Ok(())
        }
        Err(AuthError::Backend) => Err(ApiError::Internal),
    }
}

pub async fn handle_friend_add(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let body = read_body(session).await?;
    let request: FriendAddRequest = parse_json(&body)?;
    let Some(user_id) = require_token(state, session, Some(&request.token)).await? else {
        return Ok(());
    };
    match state.auth.add_friend(user_id, request.friend_id).await {
        Ok(()) => {
            respond_json(
                session,
                200,
                json!({
                    "success": true,
                    "message": "friend request sent",
                }),
            )
            .await
        }
        Err(AuthError::Rejected(message)) => {
            respond_rejection(session, 200, &message).await;
            Ok(())
        }
        Err(AuthError::Backend) => Err(ApiError::Internal),
    }
}

pub async fn handle_friend_request_handle(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let body = read_body(session).await?;
    let request: FriendHandleRequest = parse_json(&body)?;
    let Some(user_id) = require_token(state, session, Some(&request.token)).await? else {
        return Ok(());
    };
    match state
        .auth
        .handle_friend_request(user_id, request.request_id, request.accept)
        .await
    {
        Ok(()) => {
            respond_json(
                session,
                200,
                json!({
                    "success": true,
                    "message": "request handled",
                }),
            )
            .await
        }
        Err(AuthError::Rejected(message)) => {
            respond_rejection(session, 200, &message).await;
            Ok(())
        }
        Err(AuthError::Backend) => Err(ApiError::Internal),
    }
}

pub async fn handle_friend_delete(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let body = read_body(session).await?;
    let request: FriendDeleteRequest = parse_json(&body)?;
    let Some(user_id) = require_token(state, session, Some(&request.token)).await? else {
        return Ok(());
    };
    match state.auth.delete_friend(user_id, request.friend_id).await {
        Ok(()) => {
            respond_json(
                session,
                200,
                json!({
                    "success": true,
                    "message": "friend deleted",
                }),
            )
            .await
        }
        Err(AuthError::Rejected(message)) => {
            respond_rejection(session, 200, &message).await;
            Ok(())
        }
        Err(AuthError::Backend) => Err(ApiError::Internal),
    }
}

pub async fn handle_friend_list(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let token = query_param(session.req_header().uri.query(), "token");
    let Some(user_id) = require_token(state, session, token.as_deref()).await? else {
        return Ok(());
    };
    let friends = state
        .auth
        .friend_list(user_id)
        .await
        .map_err(|_| ApiError::Internal)?;
    let entries: Vec<Value> = friends
        .iter()
        .map(|friend| {
            json!({
                "user_id": friend.user_id,
                "username": friend.username,
                "status": if friend.online { 1 } else { 0 },
            })
        })
        .collect();
    respond_json(
        session,
        200,
        json!({
            "success": true,
            "friends": entries,
        }),
    )
    .await
}

pub async fn handle_friend_requests(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let token = query_param(session.req_header().uri.query(), "token");
    let Some(user_id) = require_token(state, session, token.as_deref()).await? else {
        return Ok(());
    };
    let requests = state
        .auth
        .pending_requests(user_id)
        .await
        .map_err(|_| ApiError::Internal)?;
    let entries: Vec<Value> = requests
        .iter()
        .map(|request| {
            json!({
                "request_id": request.request_id,
                "sender_id": request.sender_id,
                "sender_username": request.sender_username,
                "created_at": request.created_at,
            })
        })
        .collect();
    respond_json(
        session,
        200,
        json!({
            "success": true,
            "requests": entries,
        }),
    )
    .await
}

pub async fn handle_history(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let query = session.req_header().uri.query().map(|q| q.to_string());
    let token = query_param(query.as_deref(), "token");
    let peer_id = query_param(query.as_deref(), "peer_id")
        .and_then(|raw| raw.parse::<i64>().ok())
        .ok_or_else(|| ApiError::BadRequest("peer_id is required".to_string()))?;
    let limit = query_param(query.as_deref(), "limit").and_then(|raw| raw.parse::<i64>().ok());
    let Some(user_id) = require_token(state, session, token.as_deref()).await? else {
        return Ok(());
    };
    let messages = state
        .chat
        .history(user_id, peer_id, limit)
        .await
        .map_err(|_| ApiError::Internal)?;
    let entries: Vec<Value> = messages
        .iter()
        .map(|message| {
            json!({
                "msg_id": message.msg_id,
                "from": message.from_user_id,
                "to": message.to_user_id,
                "content": message.content,
                "timestamp": message.timestamp,
            })
        })
        .collect();
    respond_json(
        session,
        200,
        json!({
            "success": true,
            "messages": entries,
        }),
    )
    .await
}

pub async fn handle_sessions(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let token = query_param(session.req_header().uri.query(), "token");
    let Some(user_id) = require_token(state, session, token.as_deref()).await? else {
        return Ok(());
    };
    let rows = state
        .chat
        .recent_sessions(user_id)
        .await
        .map_err(|_| ApiError::Internal)?;
    let entries: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "peer_id": row.peer_id,
                "last_msg": row.last_msg_content,
                "timestamp": row.last_msg_ts,
                "unread": row.unread_count,
            })
        })
        .collect();
    respond_json(
        session,
        200,
        json!({
            "success": true,
            "sessions": entries,
        }),
    )
    .await
}

/// The acknowledgement path of the offline drain: resets the unread counter
/// for one conversation.
pub async fn handle_ack(
    state: &Arc<AppState>,
    session: &mut ServerSession,
) -> Result<(), ApiError> {
    let body = read_body(session).await?;
    let request: AckRequest = parse_json(&body)?;
    let Some(user_id) = require_token(state, session, Some(&request.token)).await? else {
        return Ok(());
    };
    state
        .chat
        .ack(user_id, request.peer_id)
        .await
        .map_err(|_| ApiError::Internal)?;
    respond_json(
        session,
        200,
        json!({
            "success": true,
            "message": "acknowledged",
        }),
    )
    .await
}
