//! API request handlers

use super::models::{
    AddDocumentRequest, AddDocumentResponse, CompleteRequest, HealthResponse, ProfileResponse, ReleaseAllResponse,
    RememberRequest, RememberResponse, RemoveDocumentResponse, RouteRequest, SearchRequest,
};
use super::routes::AppState;
use crate::dispatch::RouteDecision;
use crate::engine::TokenCallback;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::lifecycle::ModelStatusReport;
use crate::memory::{DocumentMatch, MemoryStats};
use crate::router::{RoutingContext, RoutingResult};
use crate::vector_store::SearchResult;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use std::convert::Infallible;
use tokio::sync::mpsc;

/// GET /health - Manager health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /profile - Resolved device profile and RAM usage
pub async fn profile(State(state): State<AppState>) -> Json<ProfileResponse> {
    state.lifecycle.init().await;

    let loaded_models = state
        .lifecycle
        .loaded_models()
        .await
        .into_iter()
        .map(|m| m.slug)
        .collect();

    Json(ProfileResponse {
        profile: state.lifecycle.device_profile().await,
        ram_budget_mb: state.lifecycle.ram_budget_mb().await,
        loaded_ram_mb: state.lifecycle.total_loaded_ram_mb().await,
        loaded_models,
    })
}

/// GET /models - Every tracked model
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelStatusReport>> {
    state.lifecycle.init().await;
    Json(state.lifecycle.status_report().await)
}

/// GET /models/{slug} - One model's status
pub async fn get_model(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> OrchestratorResult<Json<ModelStatusReport>> {
    state.lifecycle.init().await;
    let model = state
        .lifecycle
        .get(&slug)
        .await
        .ok_or_else(|| OrchestratorError::NotFound {
            what: format!("model '{slug}'"),
        })?;

    Ok(Json(model.report()))
}

/// POST /models/{slug}/ensure - Load a model if needed and wait for it
pub async fn ensure_model(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> OrchestratorResult<Json<ModelStatusReport>> {
    let model = state.lifecycle.ensure(&slug).await?;
    Ok(Json(model.report()))
}

/// POST /models/{slug}/complete - Run a chat completion, optionally streamed
pub async fn complete(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> OrchestratorResult<Response> {
    let model = state.lifecycle.ensure(&slug).await?;
    let handle = model
        .engine
        .ok_or_else(|| OrchestratorError::engine(format!("{slug} has no engine")))?;

    if !req.stream {
        let completion = handle
            .engine
            .complete(&req.messages, &req.options, None)
            .await?;
        return Ok(Json(completion).into_response());
    }

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(async move {
        let token_tx = tx.clone();
        // Event data may not carry carriage returns
        let on_token: TokenCallback = Box::new(move |token: &str| {
            let _ = token_tx.send(Event::default().event("token").data(token.replace('\r', "")));
        });

        let last = match handle
            .engine
            .complete(&req.messages, &req.options, Some(on_token))
            .await
        {
            Ok(completion) => Event::default()
                .event("done")
                .json_data(&completion)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
            Err(e) => {
                tracing::warn!(slug = %slug, error = %e, "Streaming completion failed");
                Event::default().event("error").data(e.to_string())
            }
        };
        let _ = tx.send(last);
    });

    let events = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Ok(Sse::new(events).into_response())
}

/// DELETE /models/{slug} - Release a ready model
pub async fn release_model(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> OrchestratorResult<StatusCode> {
    if state.lifecycle.release(&slug).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::NotFound {
            what: format!("loaded model '{slug}'"),
        })
    }
}

/// POST /models/release-all - Release every ready model
pub async fn release_all(State(state): State<AppState>) -> Json<ReleaseAllResponse> {
    Json(ReleaseAllResponse {
        released: state.lifecycle.release_all().await,
    })
}

async fn routing_context(state: &AppState, req: &RouteRequest) -> RoutingContext {
    let current_model_slug = req
        .current_model
        .clone()
        .unwrap_or_else(|| state.dispatcher.router().chat_model().to_string());

    let has_document_corpus = match req.has_document_corpus {
        Some(value) => value,
        None => state.memory.has_documents().await,
    };

    RoutingContext {
        current_model_slug,
        has_document_corpus,
    }
}

/// POST /route - Classify a message without loading anything
pub async fn route_message(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> Json<RoutingResult> {
    let context = routing_context(&state, &req).await;
    Json(state.dispatcher.router().route(&req.message, &context))
}

/// POST /dispatch - Classify a message and bring up its target model
pub async fn dispatch_message(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> Json<RouteDecision> {
    let context = routing_context(&state, &req).await;
    Json(
        state
            .dispatcher
            .route_and_load(
                &req.message,
                &context.current_model_slug,
                context.has_document_corpus,
            )
            .await,
    )
}

/// POST /memory/remember - Store a memory
pub async fn remember(
    State(state): State<AppState>,
    Json(req): Json<RememberRequest>,
) -> OrchestratorResult<(StatusCode, Json<RememberResponse>)> {
    let id = state.memory.remember(&req.text, req.metadata).await?;
    Ok((StatusCode::CREATED, Json(RememberResponse { id })))
}

/// POST /memory/recall - Nearest memories to a query
pub async fn recall(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> OrchestratorResult<Json<Vec<SearchResult>>> {
    Ok(Json(state.memory.recall(&req.query, req.top_k).await?))
}

/// DELETE /memory/{id} - Forget one memory
pub async fn forget(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> OrchestratorResult<StatusCode> {
    if state.memory.forget(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::NotFound {
            what: format!("memory '{id}'"),
        })
    }
}

/// GET /memory/stats
pub async fn memory_stats(State(state): State<AppState>) -> Json<MemoryStats> {
    Json(state.memory.stats().await)
}

/// POST /documents - Import a local text file
pub async fn add_document(
    State(state): State<AppState>,
    Json(req): Json<AddDocumentRequest>,
) -> OrchestratorResult<(StatusCode, Json<AddDocumentResponse>)> {
    let chunks = state.memory.add_document(&req.path).await?;
    Ok((
        StatusCode::CREATED,
        Json(AddDocumentResponse {
            path: req.path,
            chunks,
        }),
    ))
}

/// POST /documents/query - Nearest document chunks to a query
pub async fn query_documents(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> OrchestratorResult<Json<Vec<DocumentMatch>>> {
    Ok(Json(
        state.memory.query_documents(&req.query, req.top_k).await?,
    ))
}

/// DELETE /documents/{doc_id} - Remove every chunk of a document
pub async fn remove_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> OrchestratorResult<Json<RemoveDocumentResponse>> {
    let removed = state.memory.remove_document(&doc_id).await;
    if removed == 0 {
        return Err(OrchestratorError::NotFound {
            what: format!("document '{doc_id}'"),
        });
    }
    Ok(Json(RemoveDocumentResponse { doc_id, removed }))
}
