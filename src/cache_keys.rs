//! Cache key naming. Handlers build keys here so the invalidation table and
//! the read paths agree on the exact strings.

use serde::Serialize;
use sha2::{Digest, Sha256};

pub const POSTS_PREFIX: &str = "posts:";

const FILTER_HASH_LEN: usize = 16;

/// `posts:<filterHash>`
pub fn posts_list(filter_hash: &str) -> String {
    format!("{}{}", POSTS_PREFIX, filter_hash)
}

/// `post:<id>`
pub fn post(post_id: &str) -> String {
    format!("post:{}", post_id)
}

/// `user-posts:<userId>:<page>`
pub fn user_posts(user_id: &str, page: u32) -> String {
    format!("{}{}", user_posts_prefix(user_id), page)
}

pub fn user_posts_prefix(user_id: &str) -> String {
    format!("user-posts:{}:", user_id)
}

/// `comment-count:<postId>`
pub fn comment_count(post_id: &str) -> String {
    format!("comment-count:{}", post_id)
}

/// `notifications:<userId>:<page>`
pub fn notifications(user_id: &str, page: u32) -> String {
    format!("{}{}", notifications_prefix(user_id), page)
}

pub fn notifications_prefix(user_id: &str) -> String {
    format!("notifications:{}:", user_id)
}

/// Stable short hash of a list query: SHA-256 over its JSON, hex, 16 chars.
pub fn filter_hash<T: Serialize>(query: &T) -> String {
    // Serializing a plain struct cannot fail; fall back to an empty body anyway
    let canonical = serde_json::to_vec(query).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    let mut hash = hex::encode(digest);
    hash.truncate(FILTER_HASH_LEN);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Query<'a> {
        sort: &'a str,
        tag: Option<&'a str>,
        page: u32,
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(post("42"), "post:42");
        assert_eq!(user_posts("u1", 2), "user-posts:u1:2");
        assert_eq!(comment_count("42"), "comment-count:42");
        assert_eq!(notifications("u1", 1), "notifications:u1:1");
        assert!(posts_list("abcd").starts_with(POSTS_PREFIX));
    }

    #[test]
    fn test_filter_hash_is_stable_and_distinct() {
        let a = filter_hash(&Query { sort: "recent", tag: None, page: 1 });
        let b = filter_hash(&Query { sort: "recent", tag: None, page: 1 });
        let c = filter_hash(&Query { sort: "popular", tag: None, page: 1 });
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_user_prefixes_do_not_overlap() {
        // "user-posts:7:" must not match another user's keys
        assert!(!user_posts("17", 1).contains(&user_posts_prefix("7")));
        assert!(!notifications("17", 1).contains(&notifications_prefix("7")));
    }
}
