//! Status and log streams

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use stratum_core::dto::task::{TaskStatusMessage, TaskStepQuery};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message, protocol::frame::coding::CloseCode};

use crate::RunnerClient;
use crate::error::{ClientError, Result};

/// Maps a handshake or transfer error
///
/// A rejected upgrade carries the runner's HTTP answer, which becomes an
/// `ApiError` so callers can tell an unknown step (404) from a broken
/// connection.
fn ws_error(err: tungstenite::Error) -> ClientError {
    match err {
        tungstenite::Error::Http(response) => {
            let message = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            ClientError::api_error(response.status().as_u16(), message)
        }
        other => ClientError::WebSocket(other.to_string()),
    }
}

/// Turns an error close frame into a stream error, `None` otherwise
fn close_error(msg: &Message) -> Option<ClientError> {
    match msg {
        Message::Close(Some(frame)) if frame.code != CloseCode::Normal => Some(
            ClientError::StreamClosed(format!("{}: {}", u16::from(frame.code), frame.reason.as_str())),
        ),
        _ => None,
    }
}

impl RunnerClient {
    /// Open the status stream of a step
    ///
    /// Yields one message right away, then one per status interval, then a
    /// final message with `exited` set and all artifacts. An error close
    /// from the runner is yielded as `StreamClosed`.
    pub async fn status_stream(
        &self,
        query: &TaskStepQuery,
    ) -> Result<BoxStream<'static, Result<TaskStatusMessage>>> {
        let url = self.ws_url("/task/status", query)?;
        let (ws, _) = connect_async(url.as_str()).await.map_err(ws_error)?;

        let stream = ws.map_err(ws_error).try_filter_map(|msg| async move {
            if let Some(err) = close_error(&msg) {
                return Err(err);
            }
            match msg {
                Message::Text(text) => serde_json::from_str(text.as_str())
                    .map(Some)
                    .map_err(|e| ClientError::ParseError(format!("invalid status message: {}", e))),
                _ => Ok(None),
            }
        });
        Ok(stream.boxed())
    }

    /// Block until the step exited and return its final status
    pub async fn wait_task(&self, query: &TaskStepQuery) -> Result<TaskStatusMessage> {
        let mut stream = self.status_stream(query).await?;

        while let Some(msg) = stream.next().await {
            let msg = msg?;
            if msg.exited {
                return Ok(msg);
            }
            tracing::trace!(task_id = %query.task_id, "Step still running");
        }

        Err(ClientError::StreamClosed(
            "status stream ended before the step exited".to_string(),
        ))
    }

    /// Follow the log of a step
    ///
    /// Yields raw log chunks until the step exited (plus the runner's grace
    /// delay) or the connection is dropped.
    pub async fn follow_log(&self, query: &TaskStepQuery) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let url = self.ws_url("/task/log/follow", query)?;
        let (ws, _) = connect_async(url.as_str()).await.map_err(ws_error)?;

        let stream = ws.map_err(ws_error).try_filter_map(|msg| async move {
            if let Some(err) = close_error(&msg) {
                return Err(err);
            }
            Ok(match msg {
                Message::Binary(data) => Some(data.to_vec()),
                Message::Text(text) => Some(text.as_str().as_bytes().to_vec()),
                _ => None,
            })
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::ws::{self as server_ws, WebSocketUpgrade};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use futures_util::SinkExt;
    use stratum_core::domain::step::StepType;
    use stratum_core::dto::task::RunTaskRequest;

    async fn serve(app: Router) -> RunnerClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        RunnerClient::new(format!("http://{}", addr))
    }

    fn query() -> TaskStepQuery {
        TaskStepQuery {
            env_id: "env-1".to_string(),
            task_id: "task-1".to_string(),
            step: 0,
        }
    }

    async fn status_handler(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(|mut socket| async move {
            for exited in [false, false, true] {
                let msg = TaskStatusMessage {
                    exited,
                    exit_code: if exited { 3 } else { 0 },
                    log_content: if exited { b"done".to_vec() } else { Vec::new() },
                    ..Default::default()
                };
                let text = serde_json::to_string(&msg).unwrap();
                socket
                    .send(server_ws::Message::Text(text.into()))
                    .await
                    .unwrap();
            }
            let _ = socket.send(server_ws::Message::Close(None)).await;
        })
    }

    async fn failing_status_handler(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(server_ws::Message::Close(Some(server_ws::CloseFrame {
                    code: server_ws::close_code::ERROR,
                    reason: "log read failed".into(),
                })))
                .await;
        })
    }

    async fn log_handler(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(|mut socket| async move {
            for chunk in [&b"line 1\n"[..], &b"line 2\n"[..]] {
                socket
                    .send(server_ws::Message::Binary(chunk.to_vec().into()))
                    .await
                    .unwrap();
            }
            let _ = socket.send(server_ws::Message::Close(None)).await;
        })
    }

    async fn not_found() -> Response {
        (StatusCode::NOT_FOUND, "step not found").into_response()
    }

    #[tokio::test]
    async fn test_wait_task_returns_final_status() {
        let client = serve(Router::new().route("/task/status", get(status_handler))).await;

        let status = client.wait_task(&query()).await.unwrap();
        assert!(status.exited);
        assert_eq!(status.exit_code, 3);
        assert_eq!(status.log_content, b"done");
    }

    #[tokio::test]
    async fn test_error_close_is_reported() {
        let client = serve(Router::new().route("/task/status", get(failing_status_handler))).await;

        let err = client.wait_task(&query()).await.unwrap_err();
        assert!(matches!(err, ClientError::StreamClosed(ref m) if m.contains("log read failed")));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_step_is_not_found() {
        let client = serve(Router::new().route("/task/status", get(not_found))).await;

        let err = client.wait_task(&query()).await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error {:?}", err);
    }

    #[tokio::test]
    async fn test_follow_log_yields_chunks() {
        let client = serve(Router::new().route("/task/log/follow", get(log_handler))).await;

        let chunks: Vec<Vec<u8>> = client
            .follow_log(&query())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"line 1\nline 2\n");
    }

    #[tokio::test]
    async fn test_run_task_conflict() {
        async fn aborted() -> Response {
            (StatusCode::CONFLICT, r#"{"error":"task task-1 was aborted"}"#).into_response()
        }
        let client = serve(Router::new().route("/task/run", post(aborted))).await;

        let req: RunTaskRequest = serde_json::from_value(serde_json::json!({
            "taskId": "task-1",
            "stepType": StepType::Apply,
        }))
        .unwrap();
        let err = client.run_task(&req).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!err.is_transient());
    }
}
