use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::info;

use crate::{
    cache_keys,
    error::AppError,
    invalidation::{self, Mutation},
    models::{
        CommentCount, CooldownResponse, CreateCommentRequest, CreatePostRequest, Notification, PageQuery, Post,
        PostQuery, UpdatePostRequest,
    },
    security::middleware::AuthUser,
    security::moderation::{ModerationVerdict, Submission},
    security::rate_limiter::RateLimitResult,
    security::sanitize::sanitize_field,
    state::AppState,
    store::{NewComment, NewPost},
};

const MAX_TAG_LENGTH: usize = 40;
const MAX_TAGS: usize = 10;

/// Take one slot from the user's content creation window.
fn admit_content(state: &AppState, user_id: &str) -> Result<(), AppError> {
    match state.content_limiter.check_and_record(user_id) {
        RateLimitResult::Allowed { remaining, .. } => {
            info!(user_id, remaining, "Content creation admitted");
            Ok(())
        }
        RateLimitResult::Throttled { retry_after } => Err(AppError::throttled(retry_after)),
        RateLimitResult::Blocked => Err(AppError::Blocked),
    }
}

/// Run moderation and turn a rejection into a client error.
async fn moderate(state: &AppState, submission: Submission) -> Result<Submission, AppError> {
    let ModerationVerdict {
        rejection,
        sanitized_fields,
        submission,
        ..
    } = state.moderation.moderate(submission).await?;

    if let Some(rejection) = rejection {
        return Err(rejection.into());
    }
    if !sanitized_fields.is_empty() {
        info!(fields = ?sanitized_fields, "Sanitized submitted fields");
    }
    Ok(submission)
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    tags.iter()
        .map(|tag| sanitize_field(tag, MAX_TAG_LENGTH).to_lowercase())
        .filter(|tag| !tag.is_empty())
        .take(MAX_TAGS)
        .collect()
}

fn field(submission: &Submission, name: &str) -> String {
    submission.get(name).unwrap_or_default().to_string()
}

pub async fn list_posts(
    State(state): State<AppState>,
    Query(query): Query<PostQuery>,
) -> Result<Json<Vec<Post>>, AppError> {
    let key = cache_keys::posts_list(&cache_keys::filter_hash(&query));
    let store = state.store.clone();
    let posts = state
        .cache
        .get_or_load_as(&key, move || async move { store.list_posts(&query).await })
        .await?;
    Ok(Json(posts))
}

pub async fn create_post(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<Post>), AppError> {
    admit_content(&state, &user_id)?;

    let submission = Submission::new()
        .field("title", request.title)
        .field("description", request.description)
        .link(request.link)
        .attachments(request.attachments);
    let clean = moderate(&state, submission).await?;

    let post = state
        .store
        .create_post(NewPost {
            user_id: user_id.clone(),
            title: field(&clean, "title"),
            description: field(&clean, "description"),
            link: clean.link,
            tags: clean_tags(request.tags),
            attachments: clean.attachments,
        })
        .await?;

    invalidation::apply(
        &state.cache,
        &Mutation::CreatePost {
            post_id: post.id.clone(),
            user_id,
        },
    );
    Ok((StatusCode::CREATED, Json(post)))
}

pub async fn get_post(
    Path(post_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Post>, AppError> {
    let key = cache_keys::post(&post_id);
    let store = state.store.clone();
    let post = state
        .cache
        .get_or_load_as(&key, move || async move { store.get_post(&post_id).await })
        .await?;
    Ok(Json(post))
}

pub async fn update_post(
    Path(post_id): Path<String>,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<UpdatePostRequest>,
) -> Result<Json<Post>, AppError> {
    // An empty link removes it
    let clearing_link = matches!(&request.link, Some(link) if link.trim().is_empty());

    let mut submission = Submission::new().link(request.link);
    if let Some(title) = request.title {
        submission = submission.field("title", title);
    }
    if let Some(description) = request.description {
        submission = submission.field("description", description);
    }
    let clean = moderate(&state, submission).await?;

    let update = UpdatePostRequest {
        title: clean.get("title").map(str::to_string),
        description: clean.get("description").map(str::to_string),
        link: if clearing_link { Some(String::new()) } else { clean.link },
        tags: request.tags.map(clean_tags),
    };
    let post = state.store.update_post(&post_id, &user_id, update).await?;

    invalidation::apply(
        &state.cache,
        &Mutation::UpdatePost {
            post_id: post.id.clone(),
            user_id: post.user_id.clone(),
        },
    );
    Ok(Json(post))
}

pub async fn delete_post(
    Path(post_id): Path<String>,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<StatusCode, AppError> {
    let deleted = state.store.delete_post(&post_id, &user_id).await?;
    invalidation::apply(
        &state.cache,
        &Mutation::DeletePost {
            post_id: deleted.post.id,
            user_id: deleted.post.user_id,
            notified_user_ids: deleted.notified_user_ids,
        },
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn like_post(
    Path(post_id): Path<String>,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Post>, AppError> {
    let post = state.store.like_post(&post_id, &user_id).await?;
    invalidation::apply(&state.cache, &Mutation::LikePost { post_id });
    Ok(Json(post))
}

pub async fn unlike_post(
    Path(post_id): Path<String>,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Post>, AppError> {
    let post = state.store.unlike_post(&post_id, &user_id).await?;
    invalidation::apply(&state.cache, &Mutation::UnlikePost { post_id });
    Ok(Json(post))
}

pub async fn get_comment_count(
    Path(post_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<CommentCount>, AppError> {
    let key = cache_keys::comment_count(&post_id);
    let store = state.store.clone();
    let count = state
        .cache
        .get_or_load_as(&key, move || async move {
            let count = store.comment_count(&post_id).await?;
            Ok::<_, crate::store::StoreError>(CommentCount { post_id, count })
        })
        .await?;
    Ok(Json(count))
}

pub async fn create_comment(
    Path(post_id): Path<String>,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreateCommentRequest>,
) -> Result<impl IntoResponse, AppError> {
    admit_content(&state, &user_id)?;

    let submission = Submission::new().field("content", request.content);
    let clean = moderate(&state, submission).await?;

    let write = state
        .store
        .create_comment(NewComment {
            post_id,
            user_id,
            parent_id: request.parent_id,
            content: field(&clean, "content"),
        })
        .await?;

    invalidation::apply(
        &state.cache,
        &Mutation::CreateComment {
            post_id: write.comment.post_id.clone(),
            post_owner_id: write.post_owner_id,
            parent_comment_owner_id: write.parent_comment_owner_id,
        },
    );
    Ok((StatusCode::CREATED, Json(write.comment)))
}

pub async fn delete_comment(
    Path(comment_id): Path<String>,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<StatusCode, AppError> {
    let write = state.store.delete_comment(&comment_id, &user_id).await?;
    invalidation::apply(
        &state.cache,
        &Mutation::DeleteComment {
            post_id: write.comment.post_id,
            post_owner_id: write.post_owner_id,
            parent_comment_owner_id: write.parent_comment_owner_id,
        },
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_user_posts(
    Path(user_id): Path<String>,
    Query(PageQuery { page }): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Post>>, AppError> {
    let key = cache_keys::user_posts(&user_id, page);
    let store = state.store.clone();
    let posts = state
        .cache
        .get_or_load_as(&key, move || async move { store.user_posts(&user_id, page).await })
        .await?;
    Ok(Json(posts))
}

pub async fn get_notifications(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(PageQuery { page }): Query<PageQuery>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let key = cache_keys::notifications(&user_id, page);
    let store = state.store.clone();
    let items = state
        .cache
        .get_or_load_as(&key, move || async move { store.notifications(&user_id, page).await })
        .await?;
    Ok(Json(items))
}

pub async fn mark_notification_read(
    Path(notification_id): Path<String>,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Notification>, AppError> {
    let notification = state
        .store
        .mark_notification_read(&notification_id, &user_id)
        .await?;
    invalidation::apply(&state.cache, &Mutation::MarkNotificationRead { user_id });
    Ok(Json(notification))
}

/// Remaining content creation budget, without consuming any of it.
pub async fn get_cooldown(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Json<CooldownResponse> {
    let response = match state.content_limiter.status(&user_id) {
        RateLimitResult::Allowed { remaining, .. } => CooldownResponse {
            can_post: true,
            remaining_posts: remaining as u32,
            remaining_seconds: 0,
        },
        RateLimitResult::Throttled { retry_after } => CooldownResponse {
            can_post: false,
            remaining_posts: 0,
            remaining_seconds: retry_after.as_secs(),
        },
        RateLimitResult::Blocked => CooldownResponse {
            can_post: false,
            remaining_posts: 0,
            remaining_seconds: 0,
        },
    };
    Json(response)
}

/// Health check endpoint for load balancer
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "cache_entries": state.cache.len(),
        "tracked_addresses": state.ip_limiter.tracked(),
        "tracked_users": state.content_limiter.tracked(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or(StatusCode::NOT_FOUND)
}
