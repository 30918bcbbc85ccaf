use axum::{middleware, routing::get, routing::post, Router};
use std::time::Duration;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{handlers, security::middleware::security_middleware, state::AppState};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 256 * 1024;

pub fn create_router(state: AppState) -> Router {
    // Everything here passes the address limiter
    let guarded = Router::new()
        .route("/posts", get(handlers::list_posts).post(handlers::create_post))
        .route(
            "/posts/:id",
            get(handlers::get_post)
                .put(handlers::update_post)
                .delete(handlers::delete_post),
        )
        .route(
            "/posts/:id/like",
            post(handlers::like_post).delete(handlers::unlike_post),
        )
        .route("/posts/:id/comments/count", get(handlers::get_comment_count))
        .route("/posts/:id/comments", post(handlers::create_comment))
        .route("/comments/:id", axum::routing::delete(handlers::delete_comment))
        .route("/users/:id/posts", get(handlers::get_user_posts))
        .route("/notifications", get(handlers::get_notifications))
        .route("/notifications/:id/read", post(handlers::mark_notification_read))
        .route("/api/cooldown", get(handlers::get_cooldown))
        .layer(middleware::from_fn_with_state(state.clone(), security_middleware));

    Router::new()
        .merge(guarded)
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
