//! Backing store seen from the request path.
//!
//! The real service talks to a managed database; handlers only need the
//! operations below. [`MemoryStore`] backs the binary and the tests and
//! counts reads and writes so cache behaviour can be observed.

use crate::models::{
    Comment, Notification, NotificationKind, Post, PostQuery, PostSort, UpdatePostRequest, PAGE_SIZE,
};
use crate::security::file_validator::Attachment;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("record belongs to another user")]
    NotOwner,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fields of a post that passed moderation.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub link: Option<String>,
    pub tags: Vec<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone)]
pub struct NewComment {
    pub post_id: String,
    pub user_id: String,
    pub parent_id: Option<String>,
    pub content: String,
}

/// A removed post together with the users whose notifications about it
/// were removed as well.
#[derive(Debug, Clone)]
pub struct PostDelete {
    pub post: Post,
    pub notified_user_ids: Vec<String>,
}

/// A stored comment together with the owners whose notifications changed.
#[derive(Debug, Clone)]
pub struct CommentWrite {
    pub comment: Comment,
    pub post_owner_id: String,
    pub parent_comment_owner_id: Option<String>,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn list_posts(&self, query: &PostQuery) -> StoreResult<Vec<Post>>;
    async fn get_post(&self, post_id: &str) -> StoreResult<Post>;
    async fn create_post(&self, post: NewPost) -> StoreResult<Post>;
    async fn update_post(&self, post_id: &str, user_id: &str, update: UpdatePostRequest) -> StoreResult<Post>;
    async fn delete_post(&self, post_id: &str, user_id: &str) -> StoreResult<PostDelete>;
    async fn like_post(&self, post_id: &str, user_id: &str) -> StoreResult<Post>;
    async fn unlike_post(&self, post_id: &str, user_id: &str) -> StoreResult<Post>;
    async fn user_posts(&self, user_id: &str, page: u32) -> StoreResult<Vec<Post>>;
    async fn comment_count(&self, post_id: &str) -> StoreResult<u64>;
    async fn create_comment(&self, comment: NewComment) -> StoreResult<CommentWrite>;
    async fn delete_comment(&self, comment_id: &str, user_id: &str) -> StoreResult<CommentWrite>;
    async fn notifications(&self, user_id: &str, page: u32) -> StoreResult<Vec<Notification>>;
    async fn mark_notification_read(&self, notification_id: &str, user_id: &str) -> StoreResult<Notification>;
}

#[derive(Default)]
struct Tables {
    posts: HashMap<String, Post>,
    likes: HashSet<(String, String)>,
    comments: HashMap<String, Comment>,
    notifications: HashMap<String, Notification>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read queries served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Write queries served so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

fn paginate<T>(items: Vec<T>, page: u32) -> Vec<T> {
    let skip = (page.max(1) as usize - 1) * PAGE_SIZE;
    items.into_iter().skip(skip).take(PAGE_SIZE).collect()
}

fn newest_first(posts: &mut [Post]) {
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}

fn owned_post<'a>(tables: &'a mut Tables, post_id: &str, user_id: &str) -> StoreResult<&'a mut Post> {
    let post = tables.posts.get_mut(post_id).ok_or(StoreError::NotFound)?;
    if post.user_id != user_id {
        return Err(StoreError::NotOwner);
    }
    Ok(post)
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn list_posts(&self, query: &PostQuery) -> StoreResult<Vec<Post>> {
        self.read();
        let tables = self.tables.read().await;
        let mut posts: Vec<Post> = tables
            .posts
            .values()
            .filter(|p| query.tag.as_ref().map_or(true, |tag| p.tags.contains(tag)))
            .cloned()
            .collect();

        newest_first(&mut posts);
        if query.sort == PostSort::Popular {
            // stable sort keeps recency as the tie-breaker
            posts.sort_by(|a, b| b.like_count.cmp(&a.like_count));
        }
        Ok(paginate(posts, query.page))
    }

    async fn get_post(&self, post_id: &str) -> StoreResult<Post> {
        self.read();
        let tables = self.tables.read().await;
        tables.posts.get(post_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn create_post(&self, post: NewPost) -> StoreResult<Post> {
        self.write();
        let now = Utc::now();
        let post = Post {
            id: Uuid::new_v4().to_string(),
            user_id: post.user_id,
            title: post.title,
            description: post.description,
            link: post.link,
            tags: post.tags,
            attachments: post.attachments,
            like_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.tables.write().await.posts.insert(post.id.clone(), post.clone());
        Ok(post)
    }

    async fn update_post(&self, post_id: &str, user_id: &str, update: UpdatePostRequest) -> StoreResult<Post> {
        self.write();
        let mut tables = self.tables.write().await;
        let post = owned_post(&mut tables, post_id, user_id)?;
        if let Some(title) = update.title {
            post.title = title;
        }
        if let Some(description) = update.description {
            post.description = description;
        }
        if let Some(link) = update.link {
            post.link = Some(link).filter(|l| !l.is_empty());
        }
        if let Some(tags) = update.tags {
            post.tags = tags;
        }
        post.updated_at = Utc::now();
        Ok(post.clone())
    }

    async fn delete_post(&self, post_id: &str, user_id: &str) -> StoreResult<PostDelete> {
        self.write();
        let mut tables = self.tables.write().await;
        owned_post(&mut tables, post_id, user_id)?;
        let post = tables.posts.remove(post_id).ok_or(StoreError::NotFound)?;
        tables.likes.retain(|(p, _)| p != post_id);
        tables.comments.retain(|_, c| c.post_id != post_id);

        let mut notified_user_ids = Vec::new();
        tables.notifications.retain(|_, n| {
            if n.post_id == post_id {
                notified_user_ids.push(n.user_id.clone());
                false
            } else {
                true
            }
        });
        notified_user_ids.sort();
        notified_user_ids.dedup();

        Ok(PostDelete {
            post,
            notified_user_ids,
        })
    }

    async fn like_post(&self, post_id: &str, user_id: &str) -> StoreResult<Post> {
        self.write();
        let mut tables = self.tables.write().await;
        if !tables.posts.contains_key(post_id) {
            return Err(StoreError::NotFound);
        }
        let inserted = tables.likes.insert((post_id.to_string(), user_id.to_string()));
        let post = tables.posts.get_mut(post_id).ok_or(StoreError::NotFound)?;
        if inserted {
            post.like_count += 1;
        }
        Ok(post.clone())
    }

    async fn unlike_post(&self, post_id: &str, user_id: &str) -> StoreResult<Post> {
        self.write();
        let mut tables = self.tables.write().await;
        let removed = tables.likes.remove(&(post_id.to_string(), user_id.to_string()));
        let post = tables.posts.get_mut(post_id).ok_or(StoreError::NotFound)?;
        if removed {
            post.like_count = post.like_count.saturating_sub(1);
        }
        Ok(post.clone())
    }

    async fn user_posts(&self, user_id: &str, page: u32) -> StoreResult<Vec<Post>> {
        self.read();
        let tables = self.tables.read().await;
        let mut posts: Vec<Post> = tables.posts.values().filter(|p| p.user_id == user_id).cloned().collect();
        newest_first(&mut posts);
        Ok(paginate(posts, page))
    }

    async fn comment_count(&self, post_id: &str) -> StoreResult<u64> {
        self.read();
        let tables = self.tables.read().await;
        if !tables.posts.contains_key(post_id) {
            return Err(StoreError::NotFound);
        }
        Ok(tables.comments.values().filter(|c| c.post_id == post_id).count() as u64)
    }

    async fn create_comment(&self, comment: NewComment) -> StoreResult<CommentWrite> {
        self.write();
        let mut tables = self.tables.write().await;
        let post_owner_id = tables
            .posts
            .get(&comment.post_id)
            .map(|p| p.user_id.clone())
            .ok_or(StoreError::NotFound)?;

        let parent_comment_owner_id = match &comment.parent_id {
            Some(parent_id) => Some(
                tables
                    .comments
                    .get(parent_id)
                    .filter(|c| c.post_id == comment.post_id)
                    .map(|c| c.user_id.clone())
                    .ok_or(StoreError::NotFound)?,
            ),
            None => None,
        };

        let now = Utc::now();
        let stored = Comment {
            id: Uuid::new_v4().to_string(),
            post_id: comment.post_id,
            user_id: comment.user_id,
            parent_id: comment.parent_id,
            content: comment.content,
            created_at: now,
        };

        let mut recipients = vec![(post_owner_id.clone(), NotificationKind::Comment)];
        if let Some(parent_owner) = &parent_comment_owner_id {
            if *parent_owner != post_owner_id {
                recipients.push((parent_owner.clone(), NotificationKind::Reply));
            }
        }
        for (recipient, kind) in recipients {
            if recipient == stored.user_id {
                continue;
            }
            let notification = Notification {
                id: Uuid::new_v4().to_string(),
                user_id: recipient,
                kind,
                post_id: stored.post_id.clone(),
                comment_id: stored.id.clone(),
                actor_id: stored.user_id.clone(),
                read: false,
                created_at: now,
            };
            tables.notifications.insert(notification.id.clone(), notification);
        }

        tables.comments.insert(stored.id.clone(), stored.clone());
        Ok(CommentWrite {
            comment: stored,
            post_owner_id,
            parent_comment_owner_id,
        })
    }

    async fn delete_comment(&self, comment_id: &str, user_id: &str) -> StoreResult<CommentWrite> {
        self.write();
        let mut tables = self.tables.write().await;
        let comment = tables.comments.get(comment_id).cloned().ok_or(StoreError::NotFound)?;
        if comment.user_id != user_id {
            return Err(StoreError::NotOwner);
        }

        let post_owner_id = tables
            .posts
            .get(&comment.post_id)
            .map(|p| p.user_id.clone())
            .ok_or(StoreError::NotFound)?;
        let parent_comment_owner_id = comment
            .parent_id
            .as_ref()
            .and_then(|id| tables.comments.get(id))
            .map(|c| c.user_id.clone());

        tables.comments.remove(comment_id);
        tables.notifications.retain(|_, n| n.comment_id != comment_id);
        Ok(CommentWrite {
            comment,
            post_owner_id,
            parent_comment_owner_id,
        })
    }

    async fn notifications(&self, user_id: &str, page: u32) -> StoreResult<Vec<Notification>> {
        self.read();
        let tables = self.tables.read().await;
        let mut items: Vec<Notification> = tables
            .notifications
            .values()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(items, page))
    }

    async fn mark_notification_read(&self, notification_id: &str, user_id: &str) -> StoreResult<Notification> {
        self.write();
        let mut tables = self.tables.write().await;
        let notification = tables
            .notifications
            .get_mut(notification_id)
            .ok_or(StoreError::NotFound)?;
        if notification.user_id != user_id {
            return Err(StoreError::NotOwner);
        }
        notification.read = true;
        Ok(notification.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_post(user: &str, title: &str) -> NewPost {
        NewPost {
            user_id: user.to_string(),
            title: title.to_string(),
            description: "desc".to_string(),
            link: None,
            tags: vec!["art".to_string()],
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let store = MemoryStore::new();
        store.create_post(new_post("u1", "first")).await.unwrap();
        store.create_post(new_post("u2", "second")).await.unwrap();

        let all = store.list_posts(&PostQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.user_posts("u1", 1).await.unwrap().len(), 1);
        assert_eq!(store.writes(), 2);
        assert_eq!(store.reads(), 2);
    }

    #[tokio::test]
    async fn test_only_owner_can_delete() {
        let store = MemoryStore::new();
        let post = store.create_post(new_post("u1", "mine")).await.unwrap();
        assert!(matches!(store.delete_post(&post.id, "u2").await, Err(StoreError::NotOwner)));
        assert!(store.delete_post(&post.id, "u1").await.is_ok());
        assert!(matches!(store.get_post(&post.id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_get_post_returns_what_was_stored() {
        let store = MemoryStore::new();
        let mut post = new_post("u1", "with image");
        post.attachments = vec![Attachment {
            field: crate::security::file_validator::AttachmentField::Images,
            filename: "a.png".to_string(),
            content_type: "image/png".to_string(),
            size: 10,
        }];
        let created = store.create_post(post).await.unwrap();
        assert_eq!(store.get_post(&created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_delete_post_reports_notified_users() {
        let store = MemoryStore::new();
        let post = store.create_post(new_post("owner", "p")).await.unwrap();
        for user in ["alice", "bob"] {
            store
                .create_comment(NewComment {
                    post_id: post.id.clone(),
                    user_id: user.to_string(),
                    parent_id: None,
                    content: "hi".to_string(),
                })
                .await
                .unwrap();
        }

        let deleted = store.delete_post(&post.id, "owner").await.unwrap();
        assert_eq!(deleted.notified_user_ids, vec!["owner".to_string()]);
        assert!(store.notifications("owner", 1).await.unwrap().is_empty());
        assert!(matches!(store.comment_count(&post.id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_likes_are_idempotent_per_user() {
        let store = MemoryStore::new();
        let post = store.create_post(new_post("u1", "p")).await.unwrap();
        store.like_post(&post.id, "u2").await.unwrap();
        let liked = store.like_post(&post.id, "u2").await.unwrap();
        assert_eq!(liked.like_count, 1);
        let unliked = store.unlike_post(&post.id, "u2").await.unwrap();
        assert_eq!(unliked.like_count, 0);
    }

    #[tokio::test]
    async fn test_reply_notifies_post_and_parent_owner() {
        let store = MemoryStore::new();
        let post = store.create_post(new_post("owner", "p")).await.unwrap();
        let parent = store
            .create_comment(NewComment {
                post_id: post.id.clone(),
                user_id: "alice".to_string(),
                parent_id: None,
                content: "nice".to_string(),
            })
            .await
            .unwrap();
        let reply = store
            .create_comment(NewComment {
                post_id: post.id.clone(),
                user_id: "bob".to_string(),
                parent_id: Some(parent.comment.id.clone()),
                content: "agreed".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(reply.post_owner_id, "owner");
        assert_eq!(reply.parent_comment_owner_id.as_deref(), Some("alice"));
        assert_eq!(store.notifications("owner", 1).await.unwrap().len(), 2);
        assert_eq!(store.notifications("alice", 1).await.unwrap().len(), 1);
        assert_eq!(store.comment_count(&post.id).await.unwrap(), 2);
    }
}
