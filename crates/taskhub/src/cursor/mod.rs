pub mod connector;
pub mod ssh;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use self::connector::{CursorConnector, DispatchOutcome};
use self::ssh::SshContextCache;
use taskhub_models::*;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub queue_max_size: usize,
    pub reconnect_interval: std::time::Duration,
    pub heartbeat_interval: std::time::Duration,
    pub poll_interval: std::time::Duration,
    /// Backoff between retries: delay = retry_backoff * retry_count.
    pub retry_backoff: std::time::Duration,
    /// How long terminal commands stay queryable before pruning.
    pub terminal_grace: std::time::Duration,
    pub default_timeout_seconds: u64,
    pub default_max_retries: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_max_size: 100,
            reconnect_interval: std::time::Duration::from_secs(5),
            heartbeat_interval: std::time::Duration::from_secs(15),
            poll_interval: std::time::Duration::from_millis(500),
            retry_backoff: std::time::Duration::from_secs(2),
            terminal_grace: std::time::Duration::from_secs(300),
            default_timeout_seconds: 120,
            default_max_retries: 3,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> ServiceResult<()> {
        if self.queue_max_size == 0 {
            return Err(ServiceError::Configuration(
                "queue_max_size must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(ServiceError::Configuration(
                "heartbeat_interval and poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct BridgeState {
    connector_state: ConnectorState,
    last_heartbeat: Option<DateTime<Utc>>,
    queue: VecDeque<CursorCommand>,
    active: HashMap<String, CursorCommand>,
    // terminal commands kept for status queries until the grace period ends
    terminal: HashMap<String, (CursorCommand, DateTime<Utc>)>,
}

/// The command queue toward the external Cursor connector agent: bounded
/// FIFO, one processing loop, wall-clock timeout sweeps, retry with linear
/// backoff, plus connection and heartbeat loops. All queue state lives
/// behind one mutex; dispatch awaits happen outside it.
pub struct CursorBridge {
    inner: Mutex<BridgeState>,
    pub ssh: SshContextCache,
    connector: Arc<dyn CursorConnector>,
    config: BridgeConfig,
    shutdown: watch::Sender<bool>,
    status_tx: broadcast::Sender<ConnectorState>,
}

impl CursorBridge {
    pub fn new(connector: Arc<dyn CursorConnector>, config: BridgeConfig) -> ServiceResult<Arc<Self>> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let (status_tx, _) = broadcast::channel(64);
        Ok(Arc::new(Self {
            inner: Mutex::new(BridgeState {
                connector_state: ConnectorState::Disconnected,
                last_heartbeat: None,
                queue: VecDeque::new(),
                active: HashMap::new(),
                terminal: HashMap::new(),
            }),
            ssh: SshContextCache::new(),
            connector,
            config,
            shutdown,
            status_tx,
        }))
    }

    /// Spawn the connection, heartbeat, and processing loops.
    pub fn start(self: &Arc<Self>) {
        let bridge = self.clone();
        tokio::spawn(async move { bridge.connection_loop().await });
        let bridge = self.clone();
        tokio::spawn(async move { bridge.heartbeat_loop().await });
        let bridge = self.clone();
        tokio::spawn(async move { bridge.processing_loop().await });
    }

    /// Signal all loops to exit, cancel queued and active commands, and
    /// clear state.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        let now = Utc::now();
        {
            let mut state = self.inner.lock().unwrap();
            for mut cmd in state.queue.drain(..).collect::<Vec<_>>() {
                cmd.status = CommandStatus::Cancelled;
                cmd.completed_at = Some(now);
                cmd.error_message = Some("bridge stopped".to_string());
                state.terminal.insert(cmd.id.clone(), (cmd, now));
            }
            let active: Vec<CursorCommand> = state.active.drain().map(|(_, c)| c).collect();
            for mut cmd in active {
                cmd.status = CommandStatus::Cancelled;
                cmd.completed_at = Some(now);
                cmd.error_message = Some("bridge stopped".to_string());
                state.terminal.insert(cmd.id.clone(), (cmd, now));
            }
            state.connector_state = ConnectorState::Disconnected;
            state.last_heartbeat = None;
        }
        let _ = self.status_tx.send(ConnectorState::Disconnected);
        tracing::info!("cursor bridge stopped");
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectorState> {
        self.status_tx.subscribe()
    }

    pub fn connector_state(&self) -> ConnectorState {
        self.inner.lock().unwrap().connector_state
    }

    // --- Submission & queries ---

    pub fn submit(&self, input: &SubmitCommand) -> ServiceResult<CursorCommand> {
        let command_type = CommandType::from_str(&input.command_type).ok_or_else(|| {
            ServiceError::Validation(format!("invalid command_type '{}'", input.command_type))
        })?;
        if input.content.is_empty() {
            return Err(ServiceError::Validation("content is required".to_string()));
        }
        // Context is copied by value; later cache changes don't affect
        // this command.
        let ssh_context = match &input.ssh_context_id {
            Some(id) => Some(self.ssh.get(id).ok_or_else(|| {
                ServiceError::NotFound(format!("ssh context {}", id))
            })?),
            None => None,
        };

        let cmd = CursorCommand {
            id: Uuid::new_v4().to_string(),
            task_id: input.task_id.clone(),
            command_type,
            content: input.content.clone(),
            metadata: input.metadata.clone(),
            status: CommandStatus::Queued,
            response: None,
            error_message: None,
            retry_count: 0,
            max_retries: input.max_retries.unwrap_or(self.config.default_max_retries),
            timeout_seconds: input
                .timeout_seconds
                .unwrap_or(self.config.default_timeout_seconds),
            ssh_context,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
        };

        let mut state = self.inner.lock().unwrap();
        if state.queue.len() >= self.config.queue_max_size {
            return Err(ServiceError::ExternalService(format!(
                "command queue at capacity ({})",
                self.config.queue_max_size
            )));
        }
        state.queue.push_back(cmd.clone());
        tracing::debug!(command_id = %cmd.id, task_id = %cmd.task_id, "command queued");
        Ok(cmd)
    }

    pub fn active_command_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().active.keys().cloned().collect()
    }

    pub fn get_command(&self, id: &str) -> Option<CursorCommand> {
        let state = self.inner.lock().unwrap();
        if let Some(cmd) = state.active.get(id) {
            return Some(cmd.clone());
        }
        if let Some((cmd, _)) = state.terminal.get(id) {
            return Some(cmd.clone());
        }
        state.queue.iter().find(|c| c.id == id).cloned()
    }

    /// Remove a queued command, or mark an active one cancelled. Returns
    /// false for unknown (or already terminal) ids, so a double cancel is
    /// observably idempotent.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(pos) = state.queue.iter().position(|c| c.id == id) {
            if let Some(mut cmd) = state.queue.remove(pos) {
                cmd.status = CommandStatus::Cancelled;
                cmd.completed_at = Some(now);
                state.terminal.insert(cmd.id.clone(), (cmd, now));
                return true;
            }
        }
        if let Some(mut cmd) = state.active.remove(id) {
            // Any dispatch result still in flight is discarded on arrival.
            cmd.status = CommandStatus::Cancelled;
            cmd.completed_at = Some(now);
            state.terminal.insert(cmd.id.clone(), (cmd, now));
            return true;
        }
        false
    }

    /// Cancel every command belonging to a task (used when the task is
    /// hard-deleted). Returns how many were cancelled.
    pub fn cancel_for_task(&self, task_id: &str) -> usize {
        let ids: Vec<String> = {
            let state = self.inner.lock().unwrap();
            state
                .queue
                .iter()
                .chain(state.active.values())
                .filter(|c| c.task_id == task_id)
                .map(|c| c.id.clone())
                .collect()
        };
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Asynchronous completion/failure report from the connector agent,
    /// keyed by command id.
    pub fn submit_result(&self, id: &str, result: &CommandResult) -> ServiceResult<CursorCommand> {
        let mut state = self.inner.lock().unwrap();
        let Some(mut cmd) = state.active.remove(id) else {
            return Err(ServiceError::NotFound(format!("active command {}", id)));
        };
        let now = Utc::now();
        if result.success {
            cmd.status = CommandStatus::Completed;
            cmd.response = result.response.clone();
            cmd.completed_at = Some(now);
            tracing::info!(command_id = %cmd.id, "command completed");
            state.terminal.insert(cmd.id.clone(), (cmd.clone(), now));
            Ok(cmd)
        } else {
            cmd.status = CommandStatus::Failed;
            cmd.error_message = result
                .error_message
                .clone()
                .or(Some("command failed".to_string()));
            cmd.completed_at = Some(now);
            let cmd = Self::retry_or_retire(&mut state, cmd, &self.config, now);
            Ok(cmd)
        }
    }

    pub fn health(&self) -> QueueHealth {
        let now = Utc::now();
        let state = self.inner.lock().unwrap();
        let expired = state.active.values().filter(|c| c.is_expired(now)).count();
        let heartbeat_fresh = state.last_heartbeat.map_or(false, |hb| {
            (now - hb).to_std().map_or(false, |age| {
                age < self.config.heartbeat_interval * 2
            })
        });
        QueueHealth {
            connector_status: state.connector_state,
            queue_depth: state.queue.len(),
            active_commands: state.active.len(),
            expired_commands: expired,
            ssh_context_count: self.ssh.count(),
            last_heartbeat: state.last_heartbeat,
            healthy: state.connector_state.is_reachable() && heartbeat_fresh,
        }
    }

    // --- Internals ---

    fn set_state(&self, new_state: ConnectorState) {
        let changed = {
            let mut state = self.inner.lock().unwrap();
            if state.connector_state == new_state {
                false
            } else {
                state.connector_state = new_state;
                true
            }
        };
        if changed {
            tracing::info!(state = new_state.as_str(), "connector state changed");
            let _ = self.status_tx.send(new_state);
        }
    }

    /// Either re-enqueue with backoff or park in the terminal map.
    /// Caller has already set the terminal-failure status and timestamps.
    fn retry_or_retire(
        state: &mut BridgeState,
        mut cmd: CursorCommand,
        config: &BridgeConfig,
        now: DateTime<Utc>,
    ) -> CursorCommand {
        if cmd.can_retry() {
            cmd.retry_count += 1;
            cmd.status = CommandStatus::Queued;
            cmd.started_at = None;
            cmd.completed_at = None;
            let backoff = config.retry_backoff * cmd.retry_count;
            cmd.next_attempt_at =
                Some(now + chrono::Duration::from_std(backoff).unwrap_or_default());
            tracing::warn!(
                command_id = %cmd.id,
                retry = cmd.retry_count,
                "command failed, re-enqueued with backoff"
            );
            state.queue.push_back(cmd.clone());
        } else {
            tracing::warn!(
                command_id = %cmd.id,
                status = cmd.status.as_str(),
                "command reached terminal state"
            );
            state.terminal.insert(cmd.id.clone(), (cmd.clone(), now));
        }
        cmd
    }

    /// Force-fail every active command past its wall-clock deadline,
    /// independent of whether its dispatch call ever returns.
    fn sweep_expired(&self) {
        let now = Utc::now();
        let mut state = self.inner.lock().unwrap();
        let expired: Vec<String> = state
            .active
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| c.id.clone())
            .collect();
        for id in expired {
            if let Some(mut cmd) = state.active.remove(&id) {
                cmd.status = CommandStatus::Timeout;
                cmd.completed_at = Some(now);
                cmd.error_message = Some(format!(
                    "timed out after {} seconds",
                    cmd.timeout_seconds
                ));
                Self::retry_or_retire(&mut state, cmd, &self.config, now);
            }
        }
    }

    fn prune_terminal(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.terminal_grace).unwrap_or_default();
        let mut state = self.inner.lock().unwrap();
        state.terminal.retain(|_, (_, finished)| *finished >= cutoff);
    }

    /// Pop the next due command while the connector is reachable.
    fn take_next(&self) -> Option<CursorCommand> {
        let now = Utc::now();
        let mut state = self.inner.lock().unwrap();
        if !state.connector_state.is_reachable() {
            return None;
        }
        let due = state
            .queue
            .front()
            .map(|c| c.next_attempt_at.map_or(true, |t| t <= now))
            .unwrap_or(false);
        if !due {
            return None;
        }
        let mut cmd = state.queue.pop_front()?;
        cmd.status = CommandStatus::Processing;
        cmd.started_at = Some(now);
        state.active.insert(cmd.id.clone(), cmd.clone());
        Some(cmd)
    }

    async fn processing_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!("command processing loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.sweep_expired();
            self.prune_terminal();

            if let Some(cmd) = self.take_next() {
                self.set_state(ConnectorState::Processing);
                let outcome = self.connector.dispatch(&cmd).await;
                self.apply_dispatch_outcome(&cmd.id, outcome);
                if self.connector_state() == ConnectorState::Processing {
                    self.set_state(ConnectorState::Connected);
                }
                continue; // drain the queue before sleeping again
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("command processing loop exited");
    }

    fn apply_dispatch_outcome(&self, id: &str, outcome: Result<DispatchOutcome, String>) {
        let now = Utc::now();
        let mut state = self.inner.lock().unwrap();
        // Cancelled (or timed out) while the dispatch was in flight:
        // the late result is discarded.
        let Some(mut cmd) = state.active.remove(id) else {
            return;
        };
        match outcome {
            Ok(DispatchOutcome::Completed(response)) => {
                cmd.status = CommandStatus::Completed;
                cmd.response = Some(response);
                cmd.completed_at = Some(now);
                state.terminal.insert(cmd.id.clone(), (cmd, now));
            }
            Ok(DispatchOutcome::Accepted) => {
                // Result arrives via submit_result or the timeout sweep.
                state.active.insert(cmd.id.clone(), cmd);
            }
            Err(e) => {
                cmd.status = CommandStatus::Failed;
                cmd.error_message = Some(e);
                cmd.completed_at = Some(now);
                Self::retry_or_retire(&mut state, cmd, &self.config, now);
            }
        }
    }

    async fn connection_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!("connector reconnect loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if !self.connector_state().is_reachable() {
                self.set_state(ConnectorState::Connecting);
                match self.connector.probe().await {
                    Ok(()) => {
                        self.inner.lock().unwrap().last_heartbeat = Some(Utc::now());
                        self.set_state(ConnectorState::Connected);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "connector unreachable");
                        self.set_state(ConnectorState::Error);
                        self.set_state(ConnectorState::Disconnected);
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("connector reconnect loop exited");
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.connector_state().is_reachable() {
                match self.connector.probe().await {
                    Ok(()) => {
                        self.inner.lock().unwrap().last_heartbeat = Some(Utc::now());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "heartbeat failed, marking disconnected");
                        self.set_state(ConnectorState::Disconnected);
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum MockBehavior {
        Complete,
        Accept,
        Fail,
    }

    struct MockConnector {
        reachable: AtomicBool,
        behavior: Mutex<MockBehavior>,
        dispatched: AtomicUsize,
    }

    impl MockConnector {
        fn new(behavior: MockBehavior) -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(true),
                behavior: Mutex::new(behavior),
                dispatched: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CursorConnector for MockConnector {
        async fn probe(&self) -> Result<(), String> {
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("unreachable".to_string())
            }
        }

        async fn dispatch(&self, _command: &CursorCommand) -> Result<DispatchOutcome, String> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            match *self.behavior.lock().unwrap() {
                MockBehavior::Complete => Ok(DispatchOutcome::Completed("done".to_string())),
                MockBehavior::Accept => Ok(DispatchOutcome::Accepted),
                MockBehavior::Fail => Err("boom".to_string()),
            }
        }
    }

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            queue_max_size: 3,
            reconnect_interval: std::time::Duration::from_millis(10),
            heartbeat_interval: std::time::Duration::from_millis(20),
            poll_interval: std::time::Duration::from_millis(5),
            retry_backoff: std::time::Duration::from_millis(1),
            terminal_grace: std::time::Duration::from_secs(60),
            default_timeout_seconds: 30,
            default_max_retries: 2,
        }
    }

    fn prompt(task_id: &str) -> SubmitCommand {
        SubmitCommand {
            task_id: task_id.to_string(),
            command_type: "prompt".to_string(),
            content: "write tests".to_string(),
            metadata: None,
            timeout_seconds: None,
            max_retries: None,
            ssh_context_id: None,
        }
    }

    #[tokio::test]
    async fn zero_capacity_is_a_configuration_error() {
        let connector = MockConnector::new(MockBehavior::Complete);
        let mut cfg = fast_config();
        cfg.queue_max_size = 0;
        assert!(matches!(
            CursorBridge::new(connector, cfg),
            Err(ServiceError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn queue_bound_is_enforced() {
        let bridge =
            CursorBridge::new(MockConnector::new(MockBehavior::Complete), fast_config()).unwrap();
        for _ in 0..3 {
            bridge.submit(&prompt("t1")).unwrap();
        }
        let err = bridge.submit(&prompt("t1")).unwrap_err();
        assert!(matches!(err, ServiceError::ExternalService(_)));
        assert_eq!(bridge.health().queue_depth, 3);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let bridge =
            CursorBridge::new(MockConnector::new(MockBehavior::Complete), fast_config()).unwrap();
        let cmd = bridge.submit(&prompt("t1")).unwrap();
        assert!(bridge.cancel(&cmd.id));
        assert!(!bridge.cancel(&cmd.id));
        assert_eq!(
            bridge.get_command(&cmd.id).unwrap().status,
            CommandStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn processing_loop_completes_commands() {
        let connector = MockConnector::new(MockBehavior::Complete);
        let bridge = CursorBridge::new(connector.clone(), fast_config()).unwrap();
        bridge.start();
        let cmd = bridge.submit(&prompt("t1")).unwrap();

        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Some(c) = bridge.get_command(&cmd.id) {
                if c.status == CommandStatus::Completed {
                    assert_eq!(c.response.as_deref(), Some("done"));
                    bridge.stop();
                    return;
                }
            }
        }
        panic!("command never completed");
    }

    #[tokio::test]
    async fn failed_dispatch_retries_then_retires() {
        let connector = MockConnector::new(MockBehavior::Fail);
        let bridge = CursorBridge::new(connector.clone(), fast_config()).unwrap();
        bridge.start();
        let mut submit = prompt("t1");
        submit.max_retries = Some(1);
        let cmd = bridge.submit(&submit).unwrap();

        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Some(c) = bridge.get_command(&cmd.id) {
                if c.status == CommandStatus::Failed && !c.can_retry() {
                    assert_eq!(c.retry_count, 1);
                    // retry preserved the payload
                    assert_eq!(c.task_id, "t1");
                    assert_eq!(c.command_type, CommandType::Prompt);
                    assert_eq!(c.content, "write tests");
                    assert!(connector.dispatched.load(Ordering::SeqCst) >= 2);
                    bridge.stop();
                    return;
                }
            }
        }
        panic!("command never reached terminal failure");
    }

    #[tokio::test]
    async fn expired_command_times_out_and_requeues() {
        let bridge =
            CursorBridge::new(MockConnector::new(MockBehavior::Accept), fast_config()).unwrap();
        let mut submit = prompt("t1");
        submit.timeout_seconds = Some(1);
        submit.max_retries = Some(1);
        let cmd = bridge.submit(&submit).unwrap();

        // Simulate the processing loop having dispatched it, backdated past
        // its deadline.
        {
            let mut state = bridge.inner.lock().unwrap();
            let mut c = state.queue.pop_front().unwrap();
            c.status = CommandStatus::Processing;
            c.started_at = Some(Utc::now() - chrono::Duration::seconds(5));
            state.active.insert(c.id.clone(), c);
        }

        bridge.sweep_expired();
        let c = bridge.get_command(&cmd.id).unwrap();
        assert_eq!(c.status, CommandStatus::Queued);
        assert_eq!(c.retry_count, 1);
        assert!(c.started_at.is_none());
        assert!(c.completed_at.is_none());

        // Second expiry exhausts the retry budget.
        {
            let mut state = bridge.inner.lock().unwrap();
            let mut c = state.queue.pop_front().unwrap();
            c.status = CommandStatus::Processing;
            c.started_at = Some(Utc::now() - chrono::Duration::seconds(5));
            state.active.insert(c.id.clone(), c);
        }
        bridge.sweep_expired();
        let c = bridge.get_command(&cmd.id).unwrap();
        assert_eq!(c.status, CommandStatus::Timeout);
        assert!(!c.can_retry());
    }

    #[tokio::test]
    async fn submit_result_completes_active_command() {
        let bridge =
            CursorBridge::new(MockConnector::new(MockBehavior::Accept), fast_config()).unwrap();
        let cmd = bridge.submit(&prompt("t1")).unwrap();
        {
            let mut state = bridge.inner.lock().unwrap();
            let mut c = state.queue.pop_front().unwrap();
            c.status = CommandStatus::Processing;
            c.started_at = Some(Utc::now());
            state.active.insert(c.id.clone(), c);
        }

        let done = bridge
            .submit_result(
                &cmd.id,
                &CommandResult {
                    success: true,
                    response: Some("patched".to_string()),
                    error_message: None,
                },
            )
            .unwrap();
        assert_eq!(done.status, CommandStatus::Completed);
        assert_eq!(done.response.as_deref(), Some("patched"));

        // Unknown/duplicate result report
        assert!(matches!(
            bridge.submit_result(
                &cmd.id,
                &CommandResult {
                    success: true,
                    response: None,
                    error_message: None
                }
            ),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_cancels_everything() {
        let connector = MockConnector::new(MockBehavior::Accept);
        let bridge = CursorBridge::new(connector, fast_config()).unwrap();
        let queued = bridge.submit(&prompt("t1")).unwrap();
        let active = bridge.submit(&prompt("t2")).unwrap();
        {
            let mut state = bridge.inner.lock().unwrap();
            let pos = state.queue.iter().position(|c| c.id == active.id).unwrap();
            let mut c = state.queue.remove(pos).unwrap();
            c.status = CommandStatus::Processing;
            c.started_at = Some(Utc::now());
            state.active.insert(c.id.clone(), c);
        }

        bridge.stop();
        assert_eq!(
            bridge.get_command(&queued.id).unwrap().status,
            CommandStatus::Cancelled
        );
        assert_eq!(
            bridge.get_command(&active.id).unwrap().status,
            CommandStatus::Cancelled
        );
        let health = bridge.health();
        assert_eq!(health.queue_depth, 0);
        assert_eq!(health.active_commands, 0);
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn connection_loop_reports_status_changes() {
        let connector = MockConnector::new(MockBehavior::Complete);
        let bridge = CursorBridge::new(connector.clone(), fast_config()).unwrap();
        let mut status_rx = bridge.subscribe_status();
        bridge.start();

        // connecting → connected
        let mut saw_connected = false;
        for _ in 0..10 {
            match tokio::time::timeout(std::time::Duration::from_millis(200), status_rx.recv())
                .await
            {
                Ok(Ok(ConnectorState::Connected)) => {
                    saw_connected = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_connected);
        assert!(bridge.health().healthy);

        // heartbeat failure drops the link
        connector.reachable.store(false, Ordering::SeqCst);
        let mut saw_disconnected = false;
        for _ in 0..20 {
            match tokio::time::timeout(std::time::Duration::from_millis(200), status_rx.recv())
                .await
            {
                Ok(Ok(ConnectorState::Disconnected)) => {
                    saw_disconnected = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_disconnected);
        bridge.stop();
    }

    #[tokio::test]
    async fn command_with_ssh_context_copies_by_value() {
        let bridge =
            CursorBridge::new(MockConnector::new(MockBehavior::Complete), fast_config()).unwrap();
        bridge
            .ssh
            .add(
                "dev",
                &RegisterSshContext {
                    host: "dev.example.com".to_string(),
                    port: None,
                    username: "dev".to_string(),
                    key_path: None,
                    working_directory: None,
                    environment: None,
                    connection_timeout: None,
                },
            )
            .unwrap();

        let mut submit = prompt("t1");
        submit.ssh_context_id = Some("dev".to_string());
        let cmd = bridge.submit(&submit).unwrap();
        assert_eq!(cmd.ssh_context.as_ref().unwrap().host, "dev.example.com");

        // removing the cache entry leaves the command's copy intact
        bridge.ssh.remove("dev");
        let still = bridge.get_command(&cmd.id).unwrap();
        assert_eq!(still.ssh_context.unwrap().host, "dev.example.com");
    }
}
