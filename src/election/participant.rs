//! Election Participant
//!
//! Joins the election group on a coordination session and keeps its rank
//! current. Every notification lands in one queue drained by one worker
//! task, so rank resolutions for a participant never overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::rank::{self, Rank, Ranking};
use super::status::{ElectionStatus, ParticipantState, WatchBinding};
use crate::config::{ElectConfig, ElectionConfig};
use crate::coordination::{
    Acl, Connector, Coordinator, CreateMode, EventType, SessionState, WatchedEvent, Watcher,
};
use crate::error::{Error, ErrorKind, Recovery, Result};

/// What caused a rank resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// First pass after registration
    Startup,
    /// The leader's watch on the root's children fired
    MembershipChanged,
    /// The candidate we followed is gone
    PredecessorDeleted(String),
    /// Our own node was deleted out from under us
    NodeLost,
    /// Our node vanished and we registered a new one
    Reregistered,
    /// A previous attempt failed
    Retry,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Startup => write!(f, "startup"),
            Trigger::MembershipChanged => write!(f, "membership change"),
            Trigger::PredecessorDeleted(path) => write!(f, "deletion of {}", path),
            Trigger::NodeLost => write!(f, "loss of own node"),
            Trigger::Reregistered => write!(f, "re-registration"),
            Trigger::Retry => write!(f, "retry"),
        }
    }
}

/// How the worker treats one notification
#[derive(Debug)]
enum Reaction {
    Ignore,
    /// The watched predecessor only changed its payload; watch it again
    Rearm(String),
    /// Membership changed while following; only our own node matters
    CheckMembership,
    Resolve(Trigger),
    Stop(Result<()>),
}

/// A member of the election group
pub struct ElectionParticipant<C: Coordinator> {
    session: Arc<C>,
    config: ElectionConfig,
    backoff: (Duration, Duration),
    address: String,
    node_path: String,
    /// Tag last written to our node
    marked: Option<String>,
    watcher: Watcher,
    status: watch::Sender<ElectionStatus>,
    stopping: Arc<AtomicBool>,
}

impl<C: Coordinator + 'static> ElectionParticipant<C> {
    /// Join the election.
    ///
    /// Returns once the first rank resolution has settled this participant
    /// as leader or follower. From then on a background task reacts to
    /// notifications until the session ends.
    pub async fn start<K>(connector: &K, config: &ElectConfig) -> Result<ParticipantHandle<C>>
    where
        K: Connector<Session = C>,
    {
        config.validate()?;

        let (watcher, mut events) = Watcher::channel();
        let (status_tx, status_rx) = watch::channel(ElectionStatus::default());

        let session = bootstrap(connector, config.session_timeout(), watcher.clone(), &mut events).await?;
        let session = Arc::new(session);
        let stopping = Arc::new(AtomicBool::new(false));

        let mut participant = ElectionParticipant {
            session: session.clone(),
            config: config.election.clone(),
            backoff: config.retry_backoff(),
            address: connector.address(),
            node_path: String::new(),
            marked: None,
            watcher,
            status: status_tx,
            stopping: stopping.clone(),
        };

        let joined = async {
            participant.register().await?;
            participant.settle(Trigger::Startup).await
        }
        .await;

        if let Err(e) = joined {
            tracing::error!("Failed to join election under {}: {}", participant.config.root, e);
            participant.terminate();
            let _ = session.close().await;
            return Err(e);
        }

        let worker = tokio::spawn(participant.run(events));

        Ok(ParticipantHandle {
            session,
            status: status_rx,
            stopping,
            worker,
        })
    }

    /// Create every missing node on the way to the election root
    async fn ensure_root(&self) -> Result<()> {
        let root = &self.config.root;
        if self.session.exists(root, None).await?.is_some() {
            return Ok(());
        }

        let mut path = String::new();
        for segment in root.split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            path.push_str(segment);

            let payload: &[u8] = if path == *root {
                self.config.root_payload.as_bytes()
            } else {
                &[]
            };
            if path != *root && self.session.exists(&path, None).await?.is_some() {
                continue;
            }

            match self
                .session
                .create(&path, payload, &Acl::open_unsafe(), CreateMode::Persistent)
                .await
            {
                Ok(_) => tracing::info!("Created election node {}", path),
                // Another participant got there first
                Err(Error::NodeExists(_)) => {
                    tracing::debug!("Election node {} already exists", path)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Ensure the root and create our ephemeral sequential candidate node
    async fn register(&mut self) -> Result<()> {
        self.status.send_modify(|s| {
            s.transition(ParticipantState::Registering);
            s.watching = None;
        });

        let created = async {
            self.ensure_root().await?;
            self.session
                .create(
                    &self.config.candidate_prefix(),
                    &[],
                    &Acl::open_unsafe(),
                    CreateMode::EphemeralSequential,
                )
                .await
        }
        .await;

        let path = created.map_err(|e| match e.kind() {
            ErrorKind::Connection => e,
            _ => Error::Registration(format!("{} under {}", e, self.config.root)),
        })?;

        tracing::info!("Registered candidate {}", path);
        self.node_path = path.clone();
        self.marked = None;
        self.status.send_modify(|s| s.node_path = Some(path));
        Ok(())
    }

    /// One rank resolution: list, sort, locate, mark, and bind one watch
    async fn resolve(&mut self, trigger: &Trigger) -> Result<()> {
        let root = self.config.root.clone();

        loop {
            let children = match self.session.get_children(&root, Some(self.watcher.clone())).await {
                Ok(children) => children,
                Err(Error::NoNode(_)) => return Err(Error::SelfNodeMissing(self.node_path.clone())),
                Err(e) => return Err(e),
            };

            let ranking = rank::rank(&self.config, children, &self.node_path)?;

            let binding = match &ranking.rank {
                Rank::Leader => {
                    self.mark(true).await?;
                    WatchBinding::GroupMembership { root: root.clone() }
                }
                Rank::Follower { predecessor } => {
                    self.mark(false).await?;
                    if self
                        .session
                        .exists(predecessor, Some(self.watcher.clone()))
                        .await?
                        .is_none()
                    {
                        // Gone between listing and watching; nothing would ever fire
                        tracing::debug!("Predecessor {} vanished, listing again", predecessor);
                        continue;
                    }
                    WatchBinding::Predecessor {
                        path: predecessor.clone(),
                    }
                }
            };

            self.publish(trigger, &ranking, binding);
            return Ok(());
        }
    }

    /// Write our status tag; the payload is informational only.
    ///
    /// Every write fires the successor's watch on our node, so the tag is
    /// written only when it changes.
    async fn mark(&mut self, leader: bool) -> Result<()> {
        let payload = if leader {
            &self.config.leader_payload
        } else {
            &self.config.follower_payload
        };
        if self.marked.as_ref() == Some(payload) {
            return Ok(());
        }

        match self.session.set_data(&self.node_path, payload.as_bytes(), None).await {
            Ok(_) => {
                self.marked = Some(payload.clone());
                Ok(())
            }
            Err(Error::NoNode(_)) => Err(Error::SelfNodeMissing(self.node_path.clone())),
            Err(e) => Err(e),
        }
    }

    fn publish(&self, trigger: &Trigger, ranking: &Ranking, binding: WatchBinding) {
        let state = match ranking.rank {
            Rank::Leader => ParticipantState::Leader,
            Rank::Follower { .. } => ParticipantState::Follower,
        };

        let mut changed = false;
        self.status.send_modify(|s| {
            changed = s.transition(state);
            s.leader = Some(ranking.leader.clone());
            s.watching = Some(binding.clone());
            s.resolutions += 1;
        });

        match (&ranking.rank, changed) {
            (Rank::Leader, true) => tracing::info!(
                "Leader: {} ({} candidates, after {})",
                self.node_path,
                ranking.group_size,
                trigger
            ),
            (Rank::Follower { predecessor }, true) => tracing::info!(
                "Follower: {} following {} (position {}, after {})",
                self.node_path,
                predecessor,
                ranking.position,
                trigger
            ),
            (_, false) => tracing::debug!(
                "Rank unchanged for {}: {}, watching {}",
                self.node_path,
                state,
                binding.target()
            ),
        }
    }

    /// Resolve until settled, applying the recovery policy to failures
    async fn settle(&mut self, trigger: Trigger) -> Result<()> {
        let mut trigger = trigger;
        let mut attempt: u32 = 0;

        loop {
            let error = match self.resolve(&trigger).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            match error.recovery() {
                Recovery::Fatal => return Err(error),
                Recovery::Reregister => {
                    tracing::warn!("{}; registering a new candidate", error);
                    self.register().await?;
                    trigger = Trigger::Reregistered;
                }
                Recovery::Retry => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.retry_delay(attempt);
                    tracing::warn!(
                        "Rank resolution after {} failed: {} (retrying in {:?})",
                        trigger,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    trigger = Trigger::Retry;
                }
            }
        }
    }

    /// Exponential backoff with jitter
    fn retry_delay(&self, attempt: u32) -> Duration {
        let (min, max) = self.backoff;
        let ceiling = min
            .saturating_mul(1u32 << attempt.min(16).saturating_sub(1))
            .min(max);
        if ceiling <= min {
            return min;
        }
        let ms = rand::thread_rng().gen_range(min.as_millis()..=ceiling.as_millis());
        Duration::from_millis(ms as u64)
    }

    /// Put the one-shot watch back on an unchanged predecessor.
    /// Returns false if the predecessor is already gone.
    async fn rearm(&self, predecessor: &str) -> Result<bool> {
        let stat = self
            .session
            .exists(predecessor, Some(self.watcher.clone()))
            .await?;
        if stat.is_some() {
            tracing::debug!("Watching {} again after a payload change", predecessor);
        }
        Ok(stat.is_some())
    }

    /// Check that our node still exists and watch it for deletion.
    /// Returns false if it is gone.
    async fn confirm_registered(&self) -> Result<bool> {
        let stat = self
            .session
            .exists(&self.node_path, Some(self.watcher.clone()))
            .await?;
        Ok(stat.is_some())
    }

    /// Decide what a notification means for us
    fn react(&self, event: &WatchedEvent) -> Reaction {
        if event.event_type == EventType::None {
            return match event.state {
                SessionState::SyncConnected | SessionState::ConnectedReadOnly => {
                    tracing::debug!("Session for {} connected ({})", self.node_path, event.state);
                    Reaction::Ignore
                }
                // The client reattaches the session; our node and watches survive
                SessionState::Disconnected => {
                    tracing::warn!(
                        "Lost connection to {}; waiting for the session to resume",
                        self.address
                    );
                    Reaction::Ignore
                }
                SessionState::Closed => Reaction::Stop(Ok(())),
                SessionState::Expired => Reaction::Stop(Err(Error::SessionExpired)),
                SessionState::AuthFailed => Reaction::Stop(Err(Error::AuthFailed)),
            };
        }

        let Some(path) = event.path.as_deref() else {
            return Reaction::Ignore;
        };
        let status = self.status.borrow();

        match event.event_type {
            EventType::NodeChildrenChanged | EventType::NodeDeleted if path == self.config.root => {
                match status.state {
                    ParticipantState::Leader => Reaction::Resolve(Trigger::MembershipChanged),
                    ParticipantState::Follower => Reaction::CheckMembership,
                    _ => {
                        tracing::debug!("Ignoring change under {} while {}", path, status.state);
                        Reaction::Ignore
                    }
                }
            }
            EventType::NodeDeleted if path == self.node_path => {
                Reaction::Resolve(Trigger::NodeLost)
            }
            EventType::NodeDeleted => match &status.watching {
                Some(WatchBinding::Predecessor { path: watched }) if watched == path => {
                    Reaction::Resolve(Trigger::PredecessorDeleted(path.to_string()))
                }
                _ => {
                    tracing::debug!("Ignoring stale deletion of {}", path);
                    Reaction::Ignore
                }
            },
            EventType::NodeDataChanged | EventType::NodeCreated => match &status.watching {
                Some(WatchBinding::Predecessor { path: watched }) if watched == path => {
                    Reaction::Rearm(path.to_string())
                }
                _ => Reaction::Ignore,
            },
            other => {
                tracing::debug!("Ignoring {:?} on {}", other, path);
                Reaction::Ignore
            }
        }
    }

    /// Worker loop: one notification at a time
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<WatchedEvent>) -> Result<()> {
        let outcome = loop {
            let Some(event) = events.recv().await else {
                break Ok(());
            };

            let trigger = match self.react(&event) {
                Reaction::Ignore => continue,
                Reaction::Stop(result) => break result,
                Reaction::Resolve(trigger) => trigger,
                Reaction::Rearm(path) => match self.rearm(&path).await {
                    Ok(true) => continue,
                    Ok(false) => Trigger::PredecessorDeleted(path),
                    Err(e) => {
                        tracing::warn!("Re-watching {} failed: {}", path, e);
                        Trigger::Retry
                    }
                },
                Reaction::CheckMembership => match self.confirm_registered().await {
                    Ok(true) => continue,
                    Ok(false) => Trigger::NodeLost,
                    Err(e) => {
                        tracing::warn!("Checking {} failed: {}", self.node_path, e);
                        Trigger::Retry
                    }
                },
            };

            tracing::info!("Re-election for {} after {}", self.node_path, trigger);
            if let Err(e) = self.settle(trigger).await {
                break Err(e);
            }
        };

        self.terminate();

        match outcome {
            Err(_) if self.stopping.load(Ordering::SeqCst) => Ok(()),
            Err(e) => {
                tracing::error!("Election for {} stopped: {}", self.node_path, e);
                let _ = self.session.close().await;
                Err(e)
            }
            Ok(()) => {
                tracing::info!("Session for {} ended", self.node_path);
                Ok(())
            }
        }
    }

    fn terminate(&self) {
        self.status.send_modify(|s| {
            s.transition(ParticipantState::Terminated);
            s.watching = None;
        });
    }
}

/// Open a session and wait until the service reports it live
async fn bootstrap<K: Connector>(
    connector: &K,
    timeout: Duration,
    watcher: Watcher,
    events: &mut mpsc::UnboundedReceiver<WatchedEvent>,
) -> Result<K::Session> {
    let deadline = tokio::time::Instant::now() + timeout;
    let address = connector.address();

    let session = match tokio::time::timeout_at(deadline, connector.connect(timeout, watcher)).await {
        Ok(session) => session?,
        Err(_) => return Err(Error::ConnectionTimeout(address)),
    };

    let live = tokio::time::timeout_at(deadline, async {
        while let Some(event) = events.recv().await {
            if event.event_type != EventType::None {
                continue;
            }
            match event.state {
                SessionState::SyncConnected | SessionState::ConnectedReadOnly => return Ok(()),
                SessionState::Expired => return Err(Error::SessionExpired),
                SessionState::AuthFailed => return Err(Error::AuthFailed),
                SessionState::Closed => return Err(Error::SessionClosed),
                SessionState::Disconnected => {}
            }
        }
        Err(Error::SessionClosed)
    })
    .await;

    match live {
        Ok(Ok(())) => {
            tracing::info!(
                "Session 0x{:x} live on {}",
                session.session_id(),
                address
            );
            Ok(session)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            let _ = session.close().await;
            Err(Error::ConnectionTimeout(address))
        }
    }
}

/// Embedder's view of a running participant
pub struct ParticipantHandle<C: Coordinator> {
    session: Arc<C>,
    status: watch::Receiver<ElectionStatus>,
    stopping: Arc<AtomicBool>,
    worker: JoinHandle<Result<()>>,
}

impl<C: Coordinator> ParticipantHandle<C> {
    /// Latest status snapshot
    pub fn status(&self) -> ElectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().is_leader()
    }

    /// Our candidate node path
    pub fn node_path(&self) -> Option<String> {
        self.status.borrow().node_path.clone()
    }

    pub fn session_id(&self) -> i64 {
        self.session.session_id()
    }

    /// Follow status changes
    pub fn subscribe(&self) -> watch::Receiver<ElectionStatus> {
        self.status.clone()
    }

    /// Wait until the participant stops on its own
    pub async fn wait(self) -> Result<()> {
        self.worker
            .await
            .map_err(|e| Error::Internal(format!("election worker failed: {}", e)))?
    }

    /// Leave the election by closing the session
    pub async fn shutdown(self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.session.close().await {
            tracing::debug!("Closing session: {}", e);
        }
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{MemoryEnsemble, MemorySession, Stat};
    use std::sync::atomic::AtomicUsize;

    fn config() -> ElectConfig {
        let mut config = ElectConfig::default();
        config.election.retry_backoff_min_ms = 10;
        config.election.retry_backoff_max_ms = 50;
        config
    }

    async fn join(ensemble: &MemoryEnsemble) -> ParticipantHandle<MemorySession> {
        ElectionParticipant::start(ensemble, &config()).await.unwrap()
    }

    async fn reach<C: Coordinator, F>(handle: &ParticipantHandle<C>, done: F) -> ElectionStatus
    where
        F: Fn(&ElectionStatus) -> bool,
    {
        let mut rx = handle.subscribe();
        let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| done(s)))
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed")
            .clone();
        status
    }

    /// Let queued notifications drain
    async fn quiesce() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn path<C: Coordinator>(handle: &ParticipantHandle<C>) -> String {
        handle.node_path().unwrap()
    }

    fn watching(handle: &ParticipantHandle<MemorySession>) -> Option<WatchBinding> {
        handle.status().watching
    }

    fn predecessor(path: &str) -> Option<WatchBinding> {
        Some(WatchBinding::Predecessor {
            path: path.to_string(),
        })
    }

    #[tokio::test]
    async fn test_three_participants_chain() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let p3 = join(&ensemble).await;

        assert_eq!(path(&p1), "/ELECTION/NODE-0000000000");
        assert_eq!(path(&p2), "/ELECTION/NODE-0000000001");
        assert_eq!(path(&p3), "/ELECTION/NODE-0000000002");

        assert!(p1.is_leader());
        assert_eq!(
            watching(&p1),
            Some(WatchBinding::GroupMembership {
                root: "/ELECTION".into()
            })
        );
        assert_eq!(p2.status().state, ParticipantState::Follower);
        assert_eq!(watching(&p2), predecessor(&path(&p1)));
        assert_eq!(p3.status().state, ParticipantState::Follower);
        assert_eq!(watching(&p3), predecessor(&path(&p2)));
        assert_eq!(p3.status().leader, Some(path(&p1)));
    }

    #[tokio::test]
    async fn test_leader_failover() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let p3 = join(&ensemble).await;
        quiesce().await;
        let p3_before = p3.status();

        ensemble.expire_session(p1.session_id()).unwrap();

        let promoted = reach(&p2, |s| s.is_leader()).await;
        assert_eq!(promoted.leader, Some(path(&p2)));
        assert_eq!(
            promoted.watching,
            Some(WatchBinding::GroupMembership {
                root: "/ELECTION".into()
            })
        );

        quiesce().await;
        let p3_after = p3.status();
        assert_eq!(p3_after.state, ParticipantState::Follower);
        assert_eq!(p3_after.watching, predecessor(&path(&p2)));
        assert_eq!(p3_after.resolutions, p3_before.resolutions);

        assert!(matches!(p1.wait().await, Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn test_middle_removal_rebinds_successor() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let p3 = join(&ensemble).await;
        quiesce().await;

        let leader_before = p1.status().resolutions;

        ensemble.delete(&path(&p2)).unwrap();

        let rebound = reach(&p3, |s| s.watching == predecessor("/ELECTION/NODE-0000000000")).await;
        assert_eq!(rebound.state, ParticipantState::Follower);
        assert_eq!(rebound.resolutions, 2);

        // The leader re-runs on the membership change and stays leader
        let leader = reach(&p1, |s| s.resolutions > leader_before).await;
        assert_eq!(leader.state, ParticipantState::Leader);
        quiesce().await;
        assert!(p1.is_leader());
        assert_eq!(p1.node_path().as_deref(), Some("/ELECTION/NODE-0000000000"));
        assert_eq!(
            ensemble.children("/ELECTION").unwrap(),
            vec!["NODE-0000000000", "NODE-0000000002"]
        );
    }

    #[tokio::test]
    async fn test_removal_wakes_only_the_successor() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let p3 = join(&ensemble).await;
        let p4 = join(&ensemble).await;
        quiesce().await;
        let p2_before = p2.status().resolutions;

        ensemble.delete(&path(&p3)).unwrap();

        let rebound = reach(&p4, |s| s.watching == predecessor(&path(&p2))).await;
        assert_eq!(rebound.resolutions, 2);

        quiesce().await;
        assert_eq!(p2.status().resolutions, p2_before);
        assert_eq!(watching(&p2), predecessor(&path(&p1)));
        assert!(p1.is_leader());
    }

    #[tokio::test]
    async fn test_unchanged_tags_are_not_rewritten() {
        let ensemble = MemoryEnsemble::new();
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(join(&ensemble).await);
        }
        quiesce().await;

        let (observer, mut events) = Watcher::channel();
        let session = ensemble.open_session(Duration::from_secs(5), observer.clone());
        let _ = events.recv().await;
        for watched in [path(&handles[0]), path(&handles[3])] {
            assert!(session.exists(&watched, Some(observer.clone())).await.unwrap().is_some());
        }
        let p2_before = handles[1].status().resolutions;
        let p5_before = handles[4].status().resolutions;
        let leader_before = handles[0].status().resolutions;

        ensemble.delete(&path(&handles[2])).unwrap();
        reach(&handles[3], |s| s.watching == predecessor(&path(&handles[1]))).await;
        reach(&handles[0], |s| s.resolutions > leader_before).await;
        quiesce().await;

        assert!(events.try_recv().is_err());
        assert_eq!(handles[1].status().resolutions, p2_before);
        assert_eq!(handles[4].status().resolutions, p5_before);
        assert_eq!(ensemble.data(&path(&handles[0])).unwrap().1.version, 1);
        assert_eq!(ensemble.data(&path(&handles[3])).unwrap().1.version, 1);
    }

    #[tokio::test]
    async fn test_predecessor_tag_change_rearms_watch() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let p3 = join(&ensemble).await;
        quiesce().await;
        let p3_before = p3.status().resolutions;

        // Promotion rewrites p2's tag, which fires p3's watch on p2
        ensemble.expire_session(p1.session_id()).unwrap();
        reach(&p2, |s| s.is_leader()).await;
        quiesce().await;

        assert_eq!(ensemble.data(&path(&p2)).unwrap().0, b"LEADER".to_vec());
        assert_eq!(p3.status().resolutions, p3_before);
        assert_eq!(watching(&p3), predecessor(&path(&p2)));
        assert!(ensemble.watch_count(&path(&p2)) >= 1);

        ensemble.delete(&path(&p2)).unwrap();
        let promoted = reach(&p3, |s| s.is_leader()).await;
        assert_eq!(promoted.resolutions, p3_before + 1);
    }

    #[tokio::test]
    async fn test_deleted_follower_node_registers_again() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        quiesce().await;
        let first = path(&p2);

        // Seen through the membership watch
        ensemble.delete(&first).unwrap();
        let status = reach(&p2, |s| {
            s.state == ParticipantState::Follower && s.node_path.as_deref() != Some(first.as_str())
        })
        .await;
        // The deletion bumped the child version, so the suffix skips one
        assert_eq!(status.node_path.as_deref(), Some("/ELECTION/NODE-0000000003"));
        assert_eq!(status.watching, predecessor(&path(&p1)));

        // Seen through the watch on our own node
        let p3 = join(&ensemble).await;
        quiesce().await;
        let second = path(&p2);
        ensemble.delete(&second).unwrap();
        let status = reach(&p2, |s| {
            s.state == ParticipantState::Follower && s.node_path.as_deref() != Some(second.as_str())
        })
        .await;
        assert_eq!(status.watching, predecessor(&path(&p3)));

        quiesce().await;
        assert!(p1.is_leader());
        assert_eq!(ensemble.children("/ELECTION").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_connection_blip_keeps_rank() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        quiesce().await;
        let before = p2.status();

        ensemble.interrupt(p2.session_id()).unwrap();
        quiesce().await;

        let after = p2.status();
        assert_eq!(after.state, ParticipantState::Follower);
        assert_eq!(after.resolutions, before.resolutions);
        assert_eq!(after.watching, predecessor(&path(&p1)));

        ensemble.expire_session(p1.session_id()).unwrap();
        reach(&p2, |s| s.is_leader()).await;
    }

    #[tokio::test]
    async fn test_exactly_one_leader() {
        let ensemble = MemoryEnsemble::new();
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(join(&ensemble).await);
        }
        assert_eq!(handles.iter().filter(|h| h.is_leader()).count(), 1);

        let first = handles.remove(0);
        ensemble.expire_session(first.session_id()).unwrap();
        reach(&handles[0], |s| s.is_leader()).await;
        quiesce().await;

        assert_eq!(handles.iter().filter(|h| h.is_leader()).count(), 1);
        let lowest = ensemble.children("/ELECTION").unwrap()[0].clone();
        assert_eq!(handles[0].node_path(), Some(format!("/ELECTION/{}", lowest)));
    }

    #[tokio::test]
    async fn test_rerun_reaches_same_conclusion() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let before = p1.status();
        assert_eq!(before.resolutions, 1);

        // A joiner fires the leader's membership watch
        let _p2 = join(&ensemble).await;
        let after = reach(&p1, |s| s.resolutions >= 2).await;

        assert_eq!(after.state, before.state);
        assert_eq!(after.leader, before.leader);
        assert_eq!(after.watching, before.watching);
        assert_eq!(after.changed_at, before.changed_at);
        assert_eq!(ensemble.watch_count("/ELECTION"), 2);
    }

    #[tokio::test]
    async fn test_deleted_leader_node_registers_again() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let old = path(&p1);

        ensemble.delete(&old).unwrap();

        let status = reach(&p1, |s| {
            s.state == ParticipantState::Follower && s.node_path.as_deref() != Some(old.as_str())
        })
        .await;
        assert_eq!(status.watching, predecessor(&path(&p2)));
        reach(&p2, |s| s.is_leader()).await;
        assert_eq!(ensemble.children("/ELECTION").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_session_expiry_terminates() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let mut rx = p1.subscribe();
        let node = path(&p1);

        ensemble.expire_session(p1.session_id()).unwrap();

        assert!(matches!(p1.wait().await, Err(Error::SessionExpired)));
        assert_eq!(rx.borrow_and_update().state, ParticipantState::Terminated);
        assert!(ensemble.data(&node).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_group() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let node = path(&p1);

        p1.shutdown().await.unwrap();

        assert!(ensemble.data(&node).is_none());
        reach(&p2, |s| s.is_leader()).await;
        assert_eq!(ensemble.session_count(), 1);
    }

    #[tokio::test]
    async fn test_status_payloads() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let config = config();

        assert_eq!(ensemble.data(&path(&p1)).unwrap().0, b"LEADER".to_vec());
        assert_eq!(ensemble.data(&path(&p2)).unwrap().0, b"FOLLOWER".to_vec());
        assert_eq!(
            ensemble.data("/ELECTION").unwrap().0,
            config.election.root_payload.as_bytes().to_vec()
        );
        assert_eq!(ensemble.data("/ELECTION").unwrap().1.ephemeral_owner, 0);
        assert_ne!(ensemble.data(&path(&p1)).unwrap().1.ephemeral_owner, 0);
    }

    #[tokio::test]
    async fn test_nested_root_is_created() {
        let ensemble = MemoryEnsemble::new();
        let mut config = config();
        config.election.root = "/services/db/ELECTION".into();

        let p1 = ElectionParticipant::start(&ensemble, &config).await.unwrap();
        assert!(p1.is_leader());
        assert_eq!(ensemble.data("/services").unwrap().0, Vec::<u8>::new());
        assert_eq!(ensemble.data("/services/db").unwrap().0, Vec::<u8>::new());
        assert_eq!(
            p1.node_path().as_deref(),
            Some("/services/db/ELECTION/NODE-0000000000")
        );
    }

    #[tokio::test]
    async fn test_concurrent_joiners_share_root() {
        let ensemble = MemoryEnsemble::new();
        let (a, b) = tokio::join!(join(&ensemble), join(&ensemble));

        assert_eq!([a.is_leader(), b.is_leader()].iter().filter(|l| **l).count(), 1);
        assert_eq!(ensemble.children("/").unwrap(), vec!["ELECTION"]);
        assert_eq!(ensemble.children("/ELECTION").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_registration_failure_is_fatal() {
        let ensemble = MemoryEnsemble::new();
        let (w, _rx) = Watcher::channel();
        let squatter = ensemble.open_session(Duration::from_secs(5), w);
        squatter
            .create("/ELECTION", b"", &Acl::open_unsafe(), CreateMode::Ephemeral)
            .await
            .unwrap();

        let result = ElectionParticipant::start(&ensemble, &config()).await;
        assert!(matches!(result, Err(Error::Registration(_))));
        assert_eq!(ensemble.session_count(), 1);
    }

    /// Opens sessions whose liveness notice goes nowhere
    struct Silent(MemoryEnsemble);

    #[async_trait::async_trait]
    impl Connector for Silent {
        type Session = MemorySession;

        fn address(&self) -> String {
            "silent".to_string()
        }

        async fn connect(&self, timeout: Duration, _watcher: Watcher) -> Result<MemorySession> {
            let (elsewhere, _rx) = Watcher::channel();
            Ok(self.0.open_session(timeout, elsewhere))
        }
    }

    #[tokio::test]
    async fn test_liveness_wait_times_out() {
        let ensemble = MemoryEnsemble::new();
        let mut config = config();
        config.session.timeout_ms = 50;

        let result = ElectionParticipant::start(&Silent(ensemble.clone()), &config).await;
        assert!(matches!(result, Err(Error::ConnectionTimeout(a)) if a == "silent"));
        assert_eq!(ensemble.session_count(), 0);
    }

    /// Failures to inject into sessions opened through [`Flaky`]
    #[derive(Default)]
    struct Faults {
        set_data: AtomicUsize,
        exists: AtomicUsize,
        /// Deleted just before the next `exists` on it
        vanish: std::sync::Mutex<Option<String>>,
    }

    impl Faults {
        fn trip(counter: &AtomicUsize) -> Result<()> {
            let tripped = counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if tripped {
                Err(Error::Coordination {
                    path: "injected".into(),
                    code: -7,
                })
            } else {
                Ok(())
            }
        }
    }

    #[derive(Clone)]
    struct Flaky {
        ensemble: MemoryEnsemble,
        faults: Arc<Faults>,
    }

    impl Flaky {
        fn new(ensemble: &MemoryEnsemble) -> Self {
            Self {
                ensemble: ensemble.clone(),
                faults: Arc::new(Faults::default()),
            }
        }
    }

    struct FlakySession {
        inner: MemorySession,
        ensemble: MemoryEnsemble,
        faults: Arc<Faults>,
    }

    #[async_trait::async_trait]
    impl Connector for Flaky {
        type Session = FlakySession;

        fn address(&self) -> String {
            "flaky".to_string()
        }

        async fn connect(&self, timeout: Duration, watcher: Watcher) -> Result<FlakySession> {
            Ok(FlakySession {
                inner: self.ensemble.open_session(timeout, watcher),
                ensemble: self.ensemble.clone(),
                faults: self.faults.clone(),
            })
        }
    }

    #[async_trait::async_trait]
    impl Coordinator for FlakySession {
        fn session_id(&self) -> i64 {
            self.inner.session_id()
        }

        async fn create(&self, path: &str, data: &[u8], acl: &[Acl], mode: CreateMode) -> Result<String> {
            self.inner.create(path, data, acl, mode).await
        }

        async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
            self.inner.delete(path, version).await
        }

        async fn exists(&self, path: &str, watch: Option<Watcher>) -> Result<Option<Stat>> {
            Faults::trip(&self.faults.exists)?;
            let vanish = {
                let mut target = self.faults.vanish.lock().unwrap();
                if target.as_deref() == Some(path) {
                    target.take()
                } else {
                    None
                }
            };
            if let Some(path) = vanish {
                self.ensemble.delete(&path)?;
            }
            self.inner.exists(path, watch).await
        }

        async fn get_children(&self, path: &str, watch: Option<Watcher>) -> Result<Vec<String>> {
            self.inner.get_children(path, watch).await
        }

        async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat> {
            Faults::trip(&self.faults.set_data)?;
            self.inner.set_data(path, data, version).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_failed_resolution_is_retried() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let flaky = Flaky::new(&ensemble);
        flaky.faults.set_data.store(1, Ordering::SeqCst);

        let started = tokio::time::Instant::now();
        let p2 = ElectionParticipant::start(&flaky, &config()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(flaky.faults.set_data.load(Ordering::SeqCst), 0);
        let status = p2.status();
        assert_eq!(status.state, ParticipantState::Follower);
        assert_eq!(status.watching, predecessor(&path(&p1)));
        assert_eq!(status.resolutions, 1);
        assert_eq!(ensemble.data(&path(&p2)).unwrap().0, b"FOLLOWER".to_vec());
    }

    #[tokio::test]
    async fn test_failed_rewatch_is_retried() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let flaky = Flaky::new(&ensemble);
        let p3 = ElectionParticipant::start(&flaky, &config()).await.unwrap();
        quiesce().await;

        flaky.faults.exists.store(1, Ordering::SeqCst);
        ensemble.delete(&path(&p2)).unwrap();

        let rebound = reach(&p3, |s| s.watching == predecessor(&path(&p1))).await;
        assert_eq!(rebound.state, ParticipantState::Follower);
        assert_eq!(rebound.resolutions, 2);
        assert_eq!(flaky.faults.exists.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_predecessor_gone_before_watch_lists_again() {
        let ensemble = MemoryEnsemble::new();
        let p1 = join(&ensemble).await;
        let p2 = join(&ensemble).await;
        let gone = path(&p2);
        let flaky = Flaky::new(&ensemble);
        *flaky.faults.vanish.lock().unwrap() = Some(gone.clone());

        let p3 = ElectionParticipant::start(&flaky, &config()).await.unwrap();

        let status = p3.status();
        assert_eq!(status.state, ParticipantState::Follower);
        assert_eq!(status.watching, predecessor(&path(&p1)));
        assert_eq!(status.resolutions, 1);
        assert!(ensemble.data(&gone).is_none());

        quiesce().await;
        assert_eq!(p3.status().resolutions, 1);
        assert!(p1.is_leader());
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(Trigger::Startup.to_string(), "startup");
        assert_eq!(
            Trigger::PredecessorDeleted("/ELECTION/NODE-0000000003".into()).to_string(),
            "deletion of /ELECTION/NODE-0000000003"
        );
        assert_eq!(Trigger::NodeLost.to_string(), "loss of own node");
    }
}
