//! Which cache keys each successful write makes stale.
//!
//! Handlers never invalidate ad hoc; they describe the write as a
//! [`Mutation`] and [`apply`] it before responding.

use crate::cache::TtlCache;
use crate::cache_keys;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// Every key starting with or containing the token
    Prefix(String),
    Exact(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreatePost { post_id: String, user_id: String },
    UpdatePost { post_id: String, user_id: String },
    DeletePost {
        post_id: String,
        user_id: String,
        /// Users whose notifications about the post were removed with it
        notified_user_ids: Vec<String>,
    },
    LikePost { post_id: String },
    UnlikePost { post_id: String },
    CreateComment {
        post_id: String,
        post_owner_id: String,
        parent_comment_owner_id: Option<String>,
    },
    DeleteComment {
        post_id: String,
        post_owner_id: String,
        parent_comment_owner_id: Option<String>,
    },
    MarkNotificationRead { user_id: String },
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::CreatePost { .. } => "create_post",
            Mutation::UpdatePost { .. } => "update_post",
            Mutation::DeletePost { .. } => "delete_post",
            Mutation::LikePost { .. } => "like_post",
            Mutation::UnlikePost { .. } => "unlike_post",
            Mutation::CreateComment { .. } => "create_comment",
            Mutation::DeleteComment { .. } => "delete_comment",
            Mutation::MarkNotificationRead { .. } => "mark_notification_read",
        }
    }

    pub fn invalidation_set(&self) -> Vec<KeyPattern> {
        match self {
            Mutation::CreatePost { post_id, user_id } | Mutation::UpdatePost { post_id, user_id } => {
                post_keys(post_id, user_id)
            }

            // The post's comments and notifications go with it
            Mutation::DeletePost {
                post_id,
                user_id,
                notified_user_ids,
            } => {
                let mut set = post_keys(post_id, user_id);
                set.push(KeyPattern::Exact(cache_keys::comment_count(post_id)));
                let mut notified: Vec<&String> = notified_user_ids.iter().collect();
                notified.sort();
                notified.dedup();
                set.extend(
                    notified
                        .into_iter()
                        .map(|uid| KeyPattern::Prefix(cache_keys::notifications_prefix(uid))),
                );
                set
            }

            // Like counts feed the default sort order and the single post body
            Mutation::LikePost { post_id } | Mutation::UnlikePost { post_id } => vec![
                KeyPattern::Prefix(cache_keys::POSTS_PREFIX.to_string()),
                KeyPattern::Exact(cache_keys::post(post_id)),
            ],

            Mutation::CreateComment {
                post_id,
                post_owner_id,
                parent_comment_owner_id,
            }
            | Mutation::DeleteComment {
                post_id,
                post_owner_id,
                parent_comment_owner_id,
            } => {
                let mut set = vec![
                    KeyPattern::Exact(cache_keys::comment_count(post_id)),
                    KeyPattern::Prefix(cache_keys::notifications_prefix(post_owner_id)),
                ];
                if let Some(parent_owner) = parent_comment_owner_id {
                    if parent_owner != post_owner_id {
                        set.push(KeyPattern::Prefix(cache_keys::notifications_prefix(parent_owner)));
                    }
                }
                set
            }

            Mutation::MarkNotificationRead { user_id } => {
                vec![KeyPattern::Prefix(cache_keys::notifications_prefix(user_id))]
            }
        }
    }
}

fn post_keys(post_id: &str, user_id: &str) -> Vec<KeyPattern> {
    vec![
        KeyPattern::Prefix(cache_keys::POSTS_PREFIX.to_string()),
        KeyPattern::Exact(cache_keys::post(post_id)),
        KeyPattern::Prefix(cache_keys::user_posts_prefix(user_id)),
    ]
}

/// Invalidate everything `mutation` makes stale. Returns the entries removed.
pub fn apply<V>(cache: &TtlCache<V>, mutation: &Mutation) -> usize
where
    V: Clone + Send + Sync + 'static,
{
    let removed: usize = mutation
        .invalidation_set()
        .iter()
        .map(|pattern| match pattern {
            KeyPattern::Prefix(token) => cache.invalidate_by_prefix(token),
            KeyPattern::Exact(key) => cache.delete(key),
        })
        .sum();

    debug!(mutation = mutation.name(), removed, "Applied cache invalidation");
    removed
}
