//! 竞态追踪：conversationId -> 最新 RaceToken
//!
//! 同一会话的多条消息可以并发处理，但只有最后登记的那次运行允许投递结果。
//! 登记与检查都是单键原子操作（DashMap 分片锁），不跨 await 持锁。
//! TokenGuard 在任何退出路径（成功 / 超时 / 错误 / 被取代）上释放自己的条目，
//! 只删除仍指向自己的条目，不会误删更新的令牌。

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

/// 每条入站消息一个的不透明令牌
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RaceToken(Uuid);

impl RaceToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RaceToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RaceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct RaceTracker {
    latest: DashMap<String, RaceToken>,
}

impl RaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 将 token 设为会话的当前令牌；之前的令牌立即过期
    pub fn register(&self, conversation_id: &str, token: RaceToken) {
        if let Some(previous) = self.latest.insert(conversation_id.to_string(), token) {
            tracing::debug!(
                conversation_id,
                superseded = %previous,
                current = %token,
                "Race token replaced"
            );
        }
    }

    /// token 是否仍是会话的当前令牌（条目不存在视为已过期）
    pub fn is_current(&self, conversation_id: &str, token: RaceToken) -> bool {
        self.latest
            .get(conversation_id)
            .map(|entry| *entry.value() == token)
            .unwrap_or(false)
    }

    /// 仅当条目仍指向 token 时删除；返回是否删除
    pub fn release(&self, conversation_id: &str, token: RaceToken) -> bool {
        self.latest
            .remove_if(conversation_id, |_, current| *current == token)
            .is_some()
    }

    /// 登记并返回一个在 Drop 时自动释放的守卫
    pub fn acquire(self: &Arc<Self>, conversation_id: &str) -> TokenGuard {
        let token = RaceToken::new();
        self.register(conversation_id, token);
        TokenGuard {
            tracker: Arc::clone(self),
            conversation_id: conversation_id.to_string(),
            token,
        }
    }

    /// 当前登记的会话数
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// 一次运行持有的令牌；Drop 时释放条目（若未被取代）
#[derive(Debug)]
pub struct TokenGuard {
    tracker: Arc<RaceTracker>,
    conversation_id: String,
    token: RaceToken,
}

impl TokenGuard {
    pub fn token(&self) -> RaceToken {
        self.token
    }

    pub fn is_current(&self) -> bool {
        self.tracker.is_current(&self.conversation_id, self.token)
    }
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.conversation_id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_token_supersedes_older() {
        let tracker = RaceTracker::new();
        let a = RaceToken::new();
        let b = RaceToken::new();
        tracker.register("room", a);
        assert!(tracker.is_current("room", a));
        tracker.register("room", b);
        assert!(!tracker.is_current("room", a));
        assert!(tracker.is_current("room", b));
    }

    #[test]
    fn test_release_only_removes_own_token() {
        let tracker = RaceTracker::new();
        let a = RaceToken::new();
        let b = RaceToken::new();
        tracker.register("room", a);
        tracker.register("room", b);
        assert!(!tracker.release("room", a));
        assert!(tracker.is_current("room", b));
        assert!(tracker.release("room", b));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_conversations_are_independent() {
        let tracker = RaceTracker::new();
        let a = RaceToken::new();
        let b = RaceToken::new();
        tracker.register("r1", a);
        tracker.register("r2", b);
        assert!(tracker.is_current("r1", a));
        assert!(tracker.is_current("r2", b));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let tracker = Arc::new(RaceTracker::new());
        {
            let first = tracker.acquire("room");
            let second = tracker.acquire("room");
            assert!(!first.is_current());
            assert!(second.is_current());
            drop(second);
            assert!(tracker.is_empty());
            // first 已被取代，Drop 时不应影响其他条目
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_missing_entry_is_not_current() {
        let tracker = RaceTracker::new();
        assert!(!tracker.is_current("room", RaceToken::new()));
    }
}
