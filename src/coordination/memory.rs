//! In-Process Coordination Ensemble
//!
//! A single-process stand-in for a coordination service. It keeps the node
//! tree, sessions and watch tables behind one lock and follows the same
//! rules a ZooKeeper server does: sequential names come from the parent's
//! child version, ephemeral nodes die with their session, and every watch
//! fires at most once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::{
    parent_path, register_watcher, validate_path, Acl, Connector, Coordinator, CreateMode,
    EventType, SessionState, Stat, WatchedEvent, Watcher,
};
use crate::error::{Error, Result};

/// A stored node
#[derive(Debug, Clone)]
struct ZNode {
    data: Vec<u8>,
    stat: Stat,
}

/// A connected session
#[derive(Debug)]
struct SessionEntry {
    default_watcher: Watcher,
    timeout: Duration,
}

/// Shared tree state
#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, ZNode>,
    sessions: HashMap<i64, SessionEntry>,
    next_session: i64,
    zxid: i64,
    data_watches: HashMap<String, Vec<Watcher>>,
    exist_watches: HashMap<String, Vec<Watcher>>,
    child_watches: HashMap<String, Vec<Watcher>>,
    /// Watches owned by each session, dropped when the session ends
    owners: HashMap<i64, Vec<Watcher>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            ZNode {
                data: Vec::new(),
                stat: Stat::default(),
            },
        );
        Self {
            nodes,
            next_session: 0x100,
            ..Default::default()
        }
    }

    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn check_session(&self, session_id: i64) -> Result<()> {
        if self.sessions.contains_key(&session_id) {
            Ok(())
        } else {
            Err(Error::SessionExpired)
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.len() > prefix.len() && !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    /// Take and notify every watcher in `table` for `path`
    fn fire(
        table: &mut HashMap<String, Vec<Watcher>>,
        path: &str,
        event_type: EventType,
        delivered: &mut Vec<Watcher>,
    ) {
        if let Some(watchers) = table.remove(path) {
            for watcher in watchers {
                if !delivered.iter().any(|w| w.same(&watcher)) {
                    watcher.notify(WatchedEvent::node(event_type, path));
                    delivered.push(watcher);
                }
            }
        }
    }

    fn trigger_data(&mut self, path: &str, event_type: EventType) {
        let mut delivered = Vec::new();
        Self::fire(&mut self.data_watches, path, event_type, &mut delivered);
        Self::fire(&mut self.exist_watches, path, event_type, &mut delivered);
        if event_type == EventType::NodeDeleted {
            Self::fire(&mut self.child_watches, path, event_type, &mut delivered);
        }
    }

    fn trigger_children(&mut self, path: &str) {
        let mut delivered = Vec::new();
        Self::fire(
            &mut self.child_watches,
            path,
            EventType::NodeChildrenChanged,
            &mut delivered,
        );
    }

    fn create(
        &mut self,
        session_id: i64,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        self.check_session(session_id)?;
        validate_path(path, mode.is_sequential())?;
        if path == "/" {
            return Err(Error::NodeExists(path.to_string()));
        }

        let parent = parent_path(path).to_string();
        let parent_node = self
            .nodes
            .get(&parent)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if parent_node.stat.ephemeral_owner != 0 {
            return Err(Error::NoChildrenForEphemerals(path.to_string()));
        }

        let path = if mode.is_sequential() {
            format!("{}{:010}", path, parent_node.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&path) {
            return Err(Error::NodeExists(path));
        }

        let zxid = self.next_zxid();
        let now = chrono::Utc::now().timestamp_millis();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            ctime: now,
            mtime: now,
            pzxid: zxid,
            ephemeral_owner: if mode.is_ephemeral() { session_id } else { 0 },
            data_length: data.len() as i32,
            ..Default::default()
        };
        self.nodes.insert(
            path.clone(),
            ZNode {
                data: data.to_vec(),
                stat,
            },
        );
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.stat.cversion += 1;
            parent_node.stat.num_children += 1;
            parent_node.stat.pzxid = zxid;
        }

        self.trigger_data(&path, EventType::NodeCreated);
        self.trigger_children(&parent);
        Ok(path)
    }

    fn delete(&mut self, path: &str, version: Option<i32>) -> Result<()> {
        validate_path(path, false)?;
        if path == "/" {
            return Err(Error::Coordination {
                path: path.to_string(),
                code: -8,
            });
        }
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if node.stat.version != expected {
                return Err(Error::BadVersion(path.to_string()));
            }
        }
        if node.stat.num_children > 0 {
            return Err(Error::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        let zxid = self.next_zxid();
        let parent = parent_path(path).to_string();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.stat.cversion += 1;
            parent_node.stat.num_children -= 1;
            parent_node.stat.pzxid = zxid;
        }

        self.trigger_data(path, EventType::NodeDeleted);
        self.trigger_children(&parent);
        Ok(())
    }

    fn exists(&mut self, session_id: i64, path: &str, watch: Option<Watcher>) -> Result<Option<Stat>> {
        self.check_session(session_id)?;
        validate_path(path, false)?;
        let stat = self.nodes.get(path).map(|n| n.stat);
        if let Some(watcher) = watch {
            let table = if stat.is_some() {
                &mut self.data_watches
            } else {
                &mut self.exist_watches
            };
            register_watcher(table.entry(path.to_string()).or_default(), watcher.clone());
            register_watcher(self.owners.entry(session_id).or_default(), watcher);
        }
        Ok(stat)
    }

    fn get_children(
        &mut self,
        session_id: i64,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Vec<String>> {
        self.check_session(session_id)?;
        validate_path(path, false)?;
        if !self.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        if let Some(watcher) = watch {
            register_watcher(
                self.child_watches.entry(path.to_string()).or_default(),
                watcher.clone(),
            );
            register_watcher(self.owners.entry(session_id).or_default(), watcher);
        }
        let mut children = self.children_of(path);
        // The service makes no ordering promise; neither do we
        children.shuffle(&mut rand::thread_rng());
        Ok(children)
    }

    fn set_data(&mut self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat> {
        validate_path(path, false)?;
        let zxid = self.next_zxid();
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if node.stat.version != expected {
                return Err(Error::BadVersion(path.to_string()));
            }
        }
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = chrono::Utc::now().timestamp_millis();
        node.stat.data_length = data.len() as i32;
        let stat = node.stat;

        self.trigger_data(path, EventType::NodeDataChanged);
        Ok(stat)
    }

    /// End a session: drop its watches, remove its ephemerals, tell it why
    fn end_session(&mut self, session_id: i64, state: SessionState) -> Result<()> {
        let entry = self
            .sessions
            .remove(&session_id)
            .ok_or(Error::SessionExpired)?;

        if let Some(owned) = self.owners.remove(&session_id) {
            for table in [
                &mut self.data_watches,
                &mut self.exist_watches,
                &mut self.child_watches,
            ] {
                for watchers in table.values_mut() {
                    watchers.retain(|w| !owned.iter().any(|o| o.same(w)));
                }
                table.retain(|_, watchers| !watchers.is_empty());
            }
        }

        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == session_id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            self.delete(&path, None)?;
        }

        entry.default_watcher.notify(WatchedEvent::session(state));
        tracing::debug!(
            "Session 0x{:x} ended ({}), timeout was {:?}",
            session_id,
            state,
            entry.timeout
        );
        Ok(())
    }
}

/// An in-process coordination service shared by any number of sessions
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// Create an ensemble holding only the `/` node
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        // A poisoned tree is still structurally valid
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a session synchronously
    pub fn open_session(&self, timeout: Duration, watcher: Watcher) -> MemorySession {
        let mut tree = self.lock();
        let id = tree.next_session;
        tree.next_session += 1;
        tree.sessions.insert(
            id,
            SessionEntry {
                default_watcher: watcher.clone(),
                timeout,
            },
        );
        watcher.notify(WatchedEvent::session(SessionState::SyncConnected));
        MemorySession {
            id,
            ensemble: self.clone(),
        }
    }

    /// Expire a session as the server would after a missed timeout
    pub fn expire_session(&self, session_id: i64) -> Result<()> {
        self.lock().end_session(session_id, SessionState::Expired)
    }

    /// Drop and restore a session's connection. The session, its nodes and
    /// its watches all survive; only the state changes are delivered.
    pub fn interrupt(&self, session_id: i64) -> Result<()> {
        let tree = self.lock();
        let entry = tree.sessions.get(&session_id).ok_or(Error::SessionExpired)?;
        for state in [SessionState::Disconnected, SessionState::SyncConnected] {
            entry.default_watcher.notify(WatchedEvent::session(state));
        }
        Ok(())
    }

    /// Delete a node regardless of who owns it
    pub fn delete(&self, path: &str) -> Result<()> {
        self.lock().delete(path, None)
    }

    /// Sorted child names of `path`
    pub fn children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.lock();
        if !tree.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        Ok(tree.children_of(path))
    }

    /// Payload and metadata of `path`
    pub fn data(&self, path: &str) -> Option<(Vec<u8>, Stat)> {
        self.lock().nodes.get(path).map(|n| (n.data.clone(), n.stat))
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of watches currently registered on `path` across all tables
    pub fn watch_count(&self, path: &str) -> usize {
        let tree = self.lock();
        [&tree.data_watches, &tree.exist_watches, &tree.child_watches]
            .iter()
            .map(|table| table.get(path).map_or(0, Vec::len))
            .sum()
    }
}

#[async_trait]
impl Connector for MemoryEnsemble {
    type Session = MemorySession;

    fn address(&self) -> String {
        "in-process ensemble".to_string()
    }

    async fn connect(&self, timeout: Duration, watcher: Watcher) -> Result<MemorySession> {
        Ok(self.open_session(timeout, watcher))
    }
}

/// A session on a [`MemoryEnsemble`]
#[derive(Debug, Clone)]
pub struct MemorySession {
    id: i64,
    ensemble: MemoryEnsemble,
}

#[async_trait]
impl Coordinator for MemorySession {
    fn session_id(&self) -> i64 {
        self.id
    }

    async fn create(&self, path: &str, data: &[u8], _acl: &[Acl], mode: CreateMode) -> Result<String> {
        self.ensemble.lock().create(self.id, path, data, mode)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        let mut tree = self.ensemble.lock();
        tree.check_session(self.id)?;
        tree.delete(path, version)
    }

    async fn exists(&self, path: &str, watch: Option<Watcher>) -> Result<Option<Stat>> {
        self.ensemble.lock().exists(self.id, path, watch)
    }

    async fn get_children(&self, path: &str, watch: Option<Watcher>) -> Result<Vec<String>> {
        self.ensemble.lock().get_children(self.id, path, watch)
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat> {
        let mut tree = self.ensemble.lock();
        tree.check_session(self.id)?;
        tree.set_data(path, data, version)
    }

    async fn close(&self) -> Result<()> {
        self.ensemble.lock().end_session(self.id, SessionState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(ensemble: &MemoryEnsemble) -> (MemorySession, tokio::sync::mpsc::UnboundedReceiver<WatchedEvent>) {
        let (watcher, mut rx) = Watcher::channel();
        let session = ensemble.open_session(Duration::from_secs(5), watcher);
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::session(SessionState::SyncConnected)
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_sequential_names_are_padded_and_increasing() {
        let ensemble = MemoryEnsemble::new();
        let (s, _rx) = session(&ensemble);
        s.create("/e", b"", &Acl::open_unsafe(), CreateMode::Persistent).await.unwrap();

        let a = s.create("/e/n-", b"", &[], CreateMode::EphemeralSequential).await.unwrap();
        let b = s.create("/e/n-", b"", &[], CreateMode::EphemeralSequential).await.unwrap();
        assert_eq!(a, "/e/n-0000000000");
        assert_eq!(b, "/e/n-0000000001");
        assert!(a < b);
    }

    #[tokio::test]
    async fn test_create_errors() {
        let ensemble = MemoryEnsemble::new();
        let (s, _rx) = session(&ensemble);

        let missing_parent = s.create("/nope/child", b"", &[], CreateMode::Persistent).await;
        assert!(matches!(missing_parent, Err(Error::NoNode(_))));

        s.create("/e", b"x", &[], CreateMode::Persistent).await.unwrap();
        let duplicate = s.create("/e", b"y", &[], CreateMode::Persistent).await;
        assert!(matches!(duplicate, Err(Error::NodeExists(_))));

        let eph = s.create("/e/eph", b"", &[], CreateMode::Ephemeral).await.unwrap();
        let under_eph = s.create(&format!("{eph}/x"), b"", &[], CreateMode::Persistent).await;
        assert!(matches!(under_eph, Err(Error::NoChildrenForEphemerals(_))));
    }

    #[tokio::test]
    async fn test_ephemerals_removed_on_close() {
        let ensemble = MemoryEnsemble::new();
        let (owner, _owner_rx) = session(&ensemble);
        let (observer, mut rx) = session(&ensemble);

        owner.create("/e", b"", &[], CreateMode::Persistent).await.unwrap();
        let node = owner.create("/e/n-", b"", &[], CreateMode::EphemeralSequential).await.unwrap();

        let (w, mut wrx) = Watcher::channel();
        assert!(observer.exists(&node, Some(w)).await.unwrap().is_some());

        owner.close().await.unwrap();
        assert!(ensemble.data(&node).is_none());
        assert!(ensemble.data("/e").is_some());
        assert_eq!(wrx.try_recv().unwrap(), WatchedEvent::node(EventType::NodeDeleted, node.clone()));
        assert!(rx.try_recv().is_err());

        let after = owner.get_children("/e", None).await;
        assert!(matches!(after, Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn test_watches_fire_once() {
        let ensemble = MemoryEnsemble::new();
        let (s, _rx) = session(&ensemble);
        let (w, mut wrx) = Watcher::channel();

        s.create("/e", b"", &[], CreateMode::Persistent).await.unwrap();
        s.get_children("/e", Some(w.clone())).await.unwrap();
        s.get_children("/e", Some(w.clone())).await.unwrap();

        s.create("/e/a", b"", &[], CreateMode::Persistent).await.unwrap();
        s.create("/e/b", b"", &[], CreateMode::Persistent).await.unwrap();

        assert_eq!(
            wrx.try_recv().unwrap(),
            WatchedEvent::node(EventType::NodeChildrenChanged, "/e")
        );
        assert!(wrx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exists_watch_on_missing_node_fires_on_create() {
        let ensemble = MemoryEnsemble::new();
        let (s, _rx) = session(&ensemble);
        let (w, mut wrx) = Watcher::channel();

        assert!(s.exists("/later", Some(w)).await.unwrap().is_none());
        s.create("/later", b"", &[], CreateMode::Persistent).await.unwrap();
        assert_eq!(
            wrx.try_recv().unwrap(),
            WatchedEvent::node(EventType::NodeCreated, "/later")
        );
    }

    #[tokio::test]
    async fn test_set_data_versions() {
        let ensemble = MemoryEnsemble::new();
        let (s, _rx) = session(&ensemble);
        s.create("/e", b"a", &[], CreateMode::Persistent).await.unwrap();

        let stat = s.set_data("/e", b"b", None).await.unwrap();
        assert_eq!(stat.version, 1);
        assert!(matches!(s.set_data("/e", b"c", Some(0)).await, Err(Error::BadVersion(_))));
        s.set_data("/e", b"c", Some(1)).await.unwrap();
        assert_eq!(ensemble.data("/e").unwrap().0, b"c".to_vec());
    }

    #[tokio::test]
    async fn test_expire_session_notifies_default_watcher() {
        let ensemble = MemoryEnsemble::new();
        let (s, mut rx) = session(&ensemble);
        s.create("/eph", b"", &[], CreateMode::Ephemeral).await.unwrap();

        ensemble.expire_session(s.session_id()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WatchedEvent::session(SessionState::Expired));
        assert!(ensemble.data("/eph").is_none());
        assert_eq!(ensemble.session_count(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_keeps_session() {
        let ensemble = MemoryEnsemble::new();
        let (s, mut rx) = session(&ensemble);
        s.create("/eph", b"", &[], CreateMode::Ephemeral).await.unwrap();
        s.exists("/eph", Some(Watcher::channel().0)).await.unwrap();

        ensemble.interrupt(s.session_id()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WatchedEvent::session(SessionState::Disconnected));
        assert_eq!(rx.try_recv().unwrap(), WatchedEvent::session(SessionState::SyncConnected));
        assert!(ensemble.data("/eph").is_some());
        assert_eq!(ensemble.watch_count("/eph"), 1);

        ensemble.expire_session(s.session_id()).unwrap();
        assert!(matches!(ensemble.interrupt(s.session_id()), Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn test_children_sorted_by_admin_view() {
        let ensemble = MemoryEnsemble::new();
        let (s, _rx) = session(&ensemble);
        s.create("/e", b"", &[], CreateMode::Persistent).await.unwrap();
        s.create("/e/b", b"", &[], CreateMode::Persistent).await.unwrap();
        s.create("/e/a", b"", &[], CreateMode::Persistent).await.unwrap();
        s.create("/e/a/deep", b"", &[], CreateMode::Persistent).await.unwrap();
        s.create("/ee", b"", &[], CreateMode::Persistent).await.unwrap();

        assert_eq!(ensemble.children("/e").unwrap(), vec!["a", "b"]);
        let mut listed = s.get_children("/e", None).await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["a", "b"]);
        assert!(matches!(s.delete("/e/a", None).await, Err(Error::NotEmpty(_))));
    }
}
