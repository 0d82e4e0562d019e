//! Streaming endpoints
//!
//! Both streams race the step's exit against peer disconnect. A peer that
//! goes away cancels the session's wait, which never touches the container.
//! Failures close the socket with code 1011 and the error text.

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{Sink, SinkExt, StreamExt, stream::SplitStream};
use std::fmt::Display;
use std::time::Duration;
use stratum_core::domain::step::StepInfo;
use stratum_core::dto::task::{TaskStatusMessage, TaskStepQuery};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::error::RunnerError;
use crate::follow::follow;
use crate::task::TaskRunner;

/// Longest close reason a control frame can carry
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("log read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer is gone, nothing left to report to
    #[error("send failed: {0}")]
    Send(String),
}

/// GET /task/status
/// Status stream of one step
pub async fn task_status(
    State(state): State<AppState>,
    query: Result<Query<TaskStepQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let step = state.runner.load_step(&query).await?;
    debug!(task_id = %step.task_id, step = step.step, "Status stream opened");

    Ok(ws.on_upgrade(move |socket| async move {
        let (mut sink, stream) = socket.split();
        let cancel = state.shutdown.child_token();
        let watcher = watch_peer(stream, cancel.clone());

        let interval = state.runner.config().status_interval;
        let res = stream_status(&state.runner, &step, interval, &mut sink, &cancel).await;
        close(&mut sink, res, &step).await;

        cancel.cancel();
        watcher.abort();
    }))
}

/// GET /task/log/follow
/// Raw log stream of one step
pub async fn follow_log(
    State(state): State<AppState>,
    query: Result<Query<TaskStepQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let step = state.runner.load_step(&query).await?;
    debug!(task_id = %step.task_id, step = step.step, "Log stream opened");

    Ok(ws.on_upgrade(move |socket| async move {
        let (mut sink, stream) = socket.split();
        let cancel = state.shutdown.child_token();
        let watcher = watch_peer(stream, cancel.clone());

        let res = stream_log(&state.runner, &step, &mut sink, &cancel).await;
        close(&mut sink, res, &step).await;

        cancel.cancel();
        watcher.abort();
    }))
}

/// Cancels `cancel` once the peer closes or the connection breaks
fn watch_peer(mut stream: SplitStream<WebSocket>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        cancel.cancel();
    })
}

async fn close<S>(sink: &mut S, res: Result<(), StreamError>, step: &StepInfo)
where
    S: Sink<Message> + Unpin,
{
    let frame = match res {
        Ok(()) => CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        },
        Err(StreamError::Send(e)) => {
            debug!(task_id = %step.task_id, "Stream peer gone: {}", e);
            return;
        }
        Err(e) => {
            warn!(task_id = %step.task_id, step = step.step, "Stream failed: {}", e);
            let mut reason = e.to_string();
            if reason.len() > MAX_CLOSE_REASON {
                let mut end = MAX_CLOSE_REASON;
                while !reason.is_char_boundary(end) {
                    end -= 1;
                }
                reason.truncate(end);
            }
            CloseFrame {
                code: close_code::ERROR,
                reason: reason.into(),
            }
        }
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

async fn send<S>(sink: &mut S, msg: Message) -> Result<(), StreamError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    sink.send(msg)
        .await
        .map_err(|e| StreamError::Send(e.to_string()))
}

async fn send_status<S>(sink: &mut S, msg: &TaskStatusMessage) -> Result<(), StreamError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = serde_json::to_string(msg)?;
    send(sink, Message::Text(text.into())).await
}

/// Pushes status messages until the step exited
///
/// The first message goes out immediately, then one per `interval`, all
/// without artifacts. The final message carries every artifact.
pub async fn stream_status<S>(
    runner: &TaskRunner,
    step: &StepInfo,
    interval: Duration,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<(), StreamError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let wait = runner.wait(step, cancel);
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            biased;

            _ = ticker.tick() => {
                let msg = TaskStatusMessage {
                    aborted: runner.is_aborted(&step.env_id, &step.task_id).await?,
                    ..Default::default()
                };
                send_status(sink, &msg).await?;
            }
            res = &mut wait => {
                return match res {
                    Ok(exit_code) => {
                        let msg = runner.final_status(step, exit_code).await?;
                        send_status(sink, &msg).await
                    }
                    Err(e) if e.is_cancelled() => Ok(()),
                    Err(e) => Err(e.into()),
                };
            }
        }
    }
}

/// Streams the step log as binary frames until the step exited
///
/// After the exit the stream keeps going for one follow delay so that lines
/// written right before the exit are not lost.
pub async fn stream_log<S>(
    runner: &TaskRunner,
    step: &StepInfo,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<(), StreamError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let delay = runner.config().follow_delay;
    let path = runner
        .storage()
        .log_path(&step.env_id, &step.task_id, step.step);

    let follow_cancel = cancel.child_token();
    let _guard = follow_cancel.clone().drop_guard();
    let mut follower = follow(&path, 0, delay, follow_cancel).await?;

    let wait = runner.wait(step, cancel);
    tokio::pin!(wait);
    let grace = tokio::time::sleep(delay);
    tokio::pin!(grace);
    let mut exited = false;

    loop {
        tokio::select! {
            chunk = follower.content.recv() => match chunk {
                Some(chunk) => send(sink, Message::Binary(chunk.into())).await?,
                None => return Ok(()),
            },
            Some(e) = follower.errors.recv() => return Err(e.into()),
            res = &mut wait, if !exited => match res {
                Ok(_) => {
                    exited = true;
                    grace.as_mut().reset(Instant::now() + delay);
                }
                Err(e) if e.is_cancelled() => return Ok(()),
                Err(e) => return Err(e.into()),
            },
            _ = &mut grace, if exited => {
                while let Ok(chunk) = follower.content.try_recv() {
                    send(sink, Message::Binary(chunk.into())).await?;
                }
                return Ok(());
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::{query, request, runner_with};
    use stratum_core::domain::step::StepType;
    use tokio::io::AsyncWriteExt;

    fn statuses(messages: &[Message]) -> Vec<TaskStatusMessage> {
        messages
            .iter()
            .map(|m| match m {
                Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_status_stream_sends_first_then_final() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, runtime) = runner_with(dir.path());
        let id = runner.start(request(0, StepType::Plan)).await.unwrap();
        let step = runner.load_step(&query(0)).await.unwrap();

        tokio::spawn({
            let runtime = runtime.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                runtime.finish(&id, 1);
            }
        });

        let mut sink: Vec<Message> = Vec::new();
        stream_status(
            &runner,
            &step,
            Duration::from_millis(50),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let messages = statuses(&sink);
        assert!(messages.len() >= 2);
        assert!(!messages[0].exited);
        assert!(messages[..messages.len() - 1].iter().all(|m| !m.exited));

        let last = messages.last().unwrap();
        assert!(last.exited);
        assert_eq!(last.exit_code, 1);
    }

    #[tokio::test]
    async fn test_status_stream_ends_on_peer_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, runtime) = runner_with(dir.path());
        let id = runner.start(request(0, StepType::Plan)).await.unwrap();
        let step = runner.load_step(&query(0)).await.unwrap();

        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            }
        });

        let mut sink: Vec<Message> = Vec::new();
        stream_status(&runner, &step, Duration::from_secs(30), &mut sink, &cancel)
            .await
            .unwrap();

        let messages = statuses(&sink);
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].exited);
        assert!(runtime.exists(&id));
    }

    #[tokio::test]
    async fn test_log_stream_delivers_until_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, runtime) = runner_with(dir.path());
        let id = runner.start(request(0, StepType::Plan)).await.unwrap();
        let step = runner.load_step(&query(0)).await.unwrap();
        let log_path = runner.storage().log_path("env-1", "task-1", 0);
        tokio::fs::write(&log_path, b"hello\n").await.unwrap();

        tokio::spawn({
            let runtime = runtime.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&log_path)
                    .await
                    .unwrap();
                file.write_all(b"bye\n").await.unwrap();
                file.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                runtime.finish(&id, 0);
            }
        });

        let mut sink: Vec<Message> = Vec::new();
        stream_log(&runner, &step, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        let bytes: Vec<u8> = sink
            .iter()
            .flat_map(|m| match m {
                Message::Binary(b) => b.to_vec(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert_eq!(bytes, b"hello\nbye\n");
    }
}
