use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::pipeline::{Pipeline, PipelineRequest};
use crate::protocol::{AnswerRequest, PlanResponse, QueryRequest, RelayEvent};

pub struct ServerConfig {
    pub listen: String,
}

struct AppState {
    pipeline: Pipeline,
}

type EventStream = Sse<ReceiverStream<Result<Event, Infallible>>>;

pub async fn run(config: ServerConfig, pipeline: Pipeline) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!("zera listening on http://{}", config.listen);
    axum::serve(listener, router(pipeline)).await?;

    Ok(())
}

fn router(pipeline: Pipeline) -> axum::Router {
    let state = Arc::new(AppState { pipeline });

    axum::Router::new()
        .route("/api/search", post(search))
        .route("/api/results", post(results))
        .route("/api/answer", post(answer))
        .with_state(state)
}

/// Full pipeline as one SSE stream: content deltas, search results and
/// related searches as they become available, then `[DONE]`.
async fn search(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QueryRequest>,
) -> EventStream {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let request = PipelineRequest::with_cancel(payload.query, cancel.clone());
            let on_event = |event: RelayEvent| {
                let tx = tx.clone();
                let cancel = cancel.clone();
                async move {
                    // A failed send means the client went away; stop the run.
                    if tx.send(Ok(relay_sse_event(&event))).await.is_err() {
                        cancel.cancel();
                    }
                }
            };

            match state.pipeline.run(&request, on_event).await {
                Ok(_) => {
                    let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
                }
                Err(err) if err.is_cancelled() => {
                    tracing::info!("search stream cancelled");
                }
                // Mid-stream failure: close the stream without the
                // terminator; already-sent deltas stand.
                Err(err) => {
                    tracing::error!(%err, "search pipeline failed");
                }
            }
        }
    });

    sse_response(rx)
}

/// Planning stage only, as a single JSON document.
async fn results(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<PlanResponse>, ApiError> {
    let request = PipelineRequest::new(payload.query);
    let response = state.pipeline.plan_results(&request).await?;
    Ok(Json(response))
}

/// Answering stage for a previously planned search.
async fn answer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AnswerRequest>,
) -> EventStream {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let on_event = |event: RelayEvent| {
                let tx = tx.clone();
                let cancel = cancel.clone();
                async move {
                    if tx.send(Ok(relay_sse_event(&event))).await.is_err() {
                        cancel.cancel();
                    }
                }
            };

            let outcome = state
                .pipeline
                .answer(
                    &payload.original_query,
                    payload.tool_call.as_ref(),
                    &payload.search_results,
                    &cancel,
                    on_event,
                )
                .await;

            match outcome {
                Ok(_) => {
                    let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
                }
                Err(err) if err.is_cancelled() => {
                    tracing::info!("answer stream cancelled");
                }
                Err(err) => {
                    tracing::error!(%err, "answer pipeline failed");
                }
            }
        }
    });

    sse_response(rx)
}

fn relay_sse_event(event: &RelayEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

fn sse_response(rx: mpsc::Receiver<Result<Event, Infallible>>) -> EventStream {
    Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(err = %self.0, "request failed");
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
