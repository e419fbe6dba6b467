use std::collections::HashSet;
use tokio::sync::RwLock;

/// Source-address admission filter. Reads dominate writes (an admin reload
/// is rare), so a single `RwLock` over the set is enough — no need for
/// `dashmap`'s sharding here.
#[derive(Default)]
pub struct Blacklist {
    blocked: RwLock<HashSet<String>>,
}

impl Blacklist {
    pub fn new(entries: impl IntoIterator<Item = String>) -> Self {
        Self {
            blocked: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Returns `true` if `src` is allowed through.
    pub async fn accept(&self, src: &str) -> bool {
        !self.blocked.read().await.contains(src)
    }

    pub async fn block(&self, src: String) {
        self.blocked.write().await.insert(src);
    }

    pub async fn unblock(&self, src: &str) -> bool {
        self.blocked.write().await.remove(src)
    }

    pub async fn replace(&self, entries: impl IntoIterator<Item = String>) {
        *self.blocked.write().await = entries.into_iter().collect();
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.blocked.read().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accepts_unknown_source() {
        let bl = Blacklist::new(vec!["10.0.0.5".to_string()]);
        assert!(bl.accept("10.0.0.6").await);
    }

    #[tokio::test]
    async fn test_rejects_blocked_source() {
        let bl = Blacklist::new(vec!["10.0.0.5".to_string()]);
        assert!(!bl.accept("10.0.0.5").await);
    }

    #[tokio::test]
    async fn test_block_then_unblock() {
        let bl = Blacklist::new(Vec::new());
        assert!(bl.accept("1.2.3.4").await);
        bl.block("1.2.3.4".to_string()).await;
        assert!(!bl.accept("1.2.3.4").await);
        assert!(bl.unblock("1.2.3.4").await);
        assert!(bl.accept("1.2.3.4").await);
    }

    #[tokio::test]
    async fn test_replace_swaps_whole_set() {
        let bl = Blacklist::new(vec!["1.1.1.1".to_string()]);
        bl.replace(vec!["2.2.2.2".to_string()]).await;
        assert!(bl.accept("1.1.1.1").await);
        assert!(!bl.accept("2.2.2.2").await);
    }
}
