//! Durable tree snapshots (SQLite).
//!
//! One row per conversation tree, keyed by root id, holding the tree's
//! JSON snapshot. Snapshots are best-effort durability, not a write-ahead
//! log: a crash between a state transition and its snapshot loses at most
//! that transition.

use crate::tree::MessageTree;
use sqlx::{Row as _, SqlitePool};

/// Collaborator contract for tree persistence.
#[async_trait::async_trait]
pub trait TreeStore: Send + Sync {
    /// Persist (upsert) a tree snapshot under its root id.
    async fn save(&self, root_id: &str, tree: &MessageTree) -> anyhow::Result<()>;

    /// Load one snapshot. Used on explicit lookups, not the hot path.
    async fn load(&self, root_id: &str) -> anyhow::Result<Option<MessageTree>>;

    /// Load every snapshot. Used once at startup for recovery.
    async fn load_all(&self) -> anyhow::Result<Vec<MessageTree>>;
}

/// SQLite-backed tree store.
#[derive(Clone)]
pub struct SqliteTreeStore {
    pool: SqlitePool,
}

impl SqliteTreeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TreeStore for SqliteTreeStore {
    async fn save(&self, root_id: &str, tree: &MessageTree) -> anyhow::Result<()> {
        let snapshot = serde_json::to_string(tree)?;
        sqlx::query(
            "INSERT INTO message_trees (root_id, snapshot, updated_at) \
             VALUES (?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT(root_id) DO UPDATE SET \
                snapshot = excluded.snapshot, \
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(root_id)
        .bind(&snapshot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, root_id: &str) -> anyhow::Result<Option<MessageTree>> {
        let row = sqlx::query("SELECT snapshot FROM message_trees WHERE root_id = ?")
            .bind(root_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let snapshot: String = row.try_get("snapshot")?;
                Ok(Some(serde_json::from_str(&snapshot)?))
            }
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> anyhow::Result<Vec<MessageTree>> {
        let rows = sqlx::query("SELECT root_id, snapshot FROM message_trees ORDER BY root_id")
            .fetch_all(&self.pool)
            .await?;

        let mut trees = Vec::with_capacity(rows.len());
        for row in rows {
            let root_id: String = row.try_get("root_id")?;
            let snapshot: String = row.try_get("snapshot")?;
            match serde_json::from_str::<MessageTree>(&snapshot) {
                Ok(tree) => trees.push(tree),
                Err(error) => {
                    // A single undecodable row must not block recovery of
                    // the rest of the forest.
                    tracing::warn!(%error, root_id = %root_id, "skipping undecodable tree snapshot");
                }
            }
        }
        Ok(trees)
    }
}

#[cfg(test)]
mod tests {
    use super::{SqliteTreeStore, TreeStore};
    use crate::IncomingMessage;
    use crate::db::Db;
    use crate::tree::{MessageNode, MessageState, MessageTree};

    fn incoming(message_id: &str) -> IncomingMessage {
        IncomingMessage {
            text: "hello".to_string(),
            chat_id: "chat-1".to_string(),
            user_id: "user-1".to_string(),
            message_id: message_id.to_string(),
            reply_to_message_id: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn sample_tree() -> MessageTree {
        let mut root = MessageNode::new_root(&incoming("m1"));
        root.state = MessageState::Completed;
        root.completed_at = Some(chrono::Utc::now());
        root.session_id = Some("s1".to_string());
        let mut tree = MessageTree::new(root);
        let child = MessageNode::new_child(&tree.nodes["m1"], &incoming("m2"));
        tree.nodes.get_mut("m1").expect("root").children_ids.push("m2".to_string());
        tree.nodes.insert("m2".to_string(), child);
        tree
    }

    #[tokio::test]
    async fn save_then_load_round_trips_the_tree() {
        let db = Db::connect_in_memory().await.expect("db");
        let store = SqliteTreeStore::new(db.sqlite.clone());
        let tree = sample_tree();

        store.save(&tree.root_id, &tree).await.expect("save");
        let loaded = store.load("m1").await.expect("load").expect("present");

        loaded.validate().expect("loaded tree validates");
        assert_eq!(loaded.root_id, "m1");
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(
            loaded.get_node("m1").expect("root").session_id.as_deref(),
            Some("s1")
        );
        assert_eq!(
            loaded.get_node("m2").expect("child").parent_id.as_deref(),
            Some("m1")
        );
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let db = Db::connect_in_memory().await.expect("db");
        let store = SqliteTreeStore::new(db.sqlite.clone());
        let mut tree = sample_tree();

        store.save(&tree.root_id, &tree).await.expect("first save");
        tree.nodes.get_mut("m2").expect("child").state = MessageState::InProgress;
        store.save(&tree.root_id, &tree).await.expect("second save");

        let loaded = store.load("m1").await.expect("load").expect("present");
        assert_eq!(
            loaded.get_node("m2").expect("child").state,
            MessageState::InProgress
        );
        assert_eq!(store.load_all().await.expect("load_all").len(), 1);
    }

    #[tokio::test]
    async fn load_all_skips_undecodable_rows() {
        let db = Db::connect_in_memory().await.expect("db");
        let store = SqliteTreeStore::new(db.sqlite.clone());
        let tree = sample_tree();
        store.save(&tree.root_id, &tree).await.expect("save");

        sqlx::query("INSERT INTO message_trees (root_id, snapshot) VALUES ('bad', 'not json')")
            .execute(&db.sqlite)
            .await
            .expect("insert garbage");

        let trees = store.load_all().await.expect("load_all");
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].root_id, "m1");
    }

    #[tokio::test]
    async fn load_missing_root_returns_none() {
        let db = Db::connect_in_memory().await.expect("db");
        let store = SqliteTreeStore::new(db.sqlite.clone());
        assert!(store.load("absent").await.expect("load").is_none());
    }
}
