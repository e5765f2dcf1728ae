//! Route-table dispatch for every inbound request

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use taichi_core::RouteTable;
use tower_http::trace::TraceLayer;

use crate::adapter::SubAppAdapter;
use crate::error::ApiError;

#[derive(Clone)]
struct DispatchState {
    routes: RouteTable<SubAppAdapter>,
}

/// Build the gateway router. Every request goes through the route table;
/// requests no pattern matches get a 404.
pub fn create_router(routes: RouteTable<SubAppAdapter>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(DispatchState { routes })
}

async fn dispatch(State(state): State<DispatchState>, request: Request) -> Response {
    let path = request.uri().path().to_owned();
    match state.routes.dispatch(&path) {
        Ok(binding) => {
            tracing::debug!(
                %path,
                pattern = %binding.pattern(),
                app = binding.handler().name(),
                "Dispatching request"
            );
            binding.handler().handle(request).await
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}
