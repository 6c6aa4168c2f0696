//! HTTP routes and websocket execution sessions
//!
//! Each `/execute` session carries one request and receives the streamed
//! output plus a single exit message. Admission is bounded by a semaphore:
//! a permit is taken before the upgrade and held until the exit message has
//! been flushed, so at most `max_concurrent` interpreters run at once.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{EvalError, EvalResult};
use crate::evaluate::Evaluator;
use crate::page;
use crate::protocol::{ExecutionOutcome, Request, StreamMessage};

/// Buffered messages between the reader and the socket writer
const OUTBOX_CAPACITY: usize = 256;

/// Global counter used to tag sessions in logs
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct AppState {
    pub evaluator: Arc<Evaluator>,
    slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(evaluator: Arc<Evaluator>, max_concurrent: usize) -> Self {
        Self {
            evaluator,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/execute", get(execute_handler))
        .route("/", get(page::index_handler))
        .with_state(state)
}

async fn execute_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let permit = match state.slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        handle_session(socket, state.evaluator).await;
        drop(permit);
    })
}

async fn handle_session(socket: WebSocket, evaluator: Arc<Evaluator>) {
    let session_id = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    info!("Session {}: connected", session_id);

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
    let writer = tokio::spawn(write_messages(session_id, sink, rx));

    match read_request(&mut stream).await {
        Ok(Some(request)) => {
            evaluator.execute(session_id, request, tx).await;
        }
        Ok(None) => {
            info!("Session {}: closed before sending a request", session_id);
            drop(tx);
        }
        Err(e) => {
            warn!("Session {}: {}", session_id, e);
            let exit = StreamMessage::exit(&ExecutionOutcome::failed(e.to_string()));
            if tx.send(exit).await.is_err() {
                warn!("Session {}: failed to deliver exit message", session_id);
            }
            drop(tx);
        }
    }

    if let Err(e) = writer.await {
        warn!("Session {}: writer task failed: {}", session_id, e);
    }
    info!("Session {}: finished", session_id);
}

/// Wait for the single request frame; `None` if the caller left first
async fn read_request(stream: &mut SplitStream<WebSocket>) -> EvalResult<Option<Request>> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return serde_json::from_str(text.as_str())
                    .map(Some)
                    .map_err(|e| EvalError::InvalidRequest(e.to_string()));
            }
            Ok(Message::Binary(_)) => {
                return Err(EvalError::InvalidRequest(
                    "expected a text frame, got binary".into(),
                ));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return Ok(None),
            Err(e) => {
                debug!("Failed to read message: {}", e);
                return Ok(None);
            }
        }
    }
    Ok(None)
}

/// Forward queued messages to the socket; stops at the first write failure
async fn write_messages(
    session_id: u64,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<StreamMessage>,
) {
    while let Some(message) = rx.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Session {}: failed to encode message: {}", session_id, e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            warn!("Session {}: failed to write message: {}", session_id, e);
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Session {}: close failed: {}", session_id, e);
    }
}
