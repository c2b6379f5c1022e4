use crate::config::AgentConfig;
use crate::connection::{ConnStatus, RelayConnection};
use crate::dispatch::{Dispatcher, SubscriptionId};
use crate::error::AgentError;
use ed25519_dalek::SigningKey;
use fleet_common::codec::{Envelope, RelayRequest, SignedEnvelope};
use fleet_common::identity;
use fleet_common::message::{Command, Request, Response, TERMINAL_PRIME};
use fleet_common::types::{action, Job, JobStatus, NetworkInfo, RelayConfig, Robot, RobotStatus};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// The robot and job an interactive terminal is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSession {
    /// PeerId of the robot running the job.
    pub robot_peer_id: String,
    /// Job whose terminal is attached.
    pub job_id: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("agent lock poisoned, using recovered state");
            poisoned.into_inner()
        }
    }
}

/// Operator-side agent: one identity, one relay connection, and the
/// job-control protocol on top of it.
pub struct Agent {
    connection: Arc<RelayConnection>,
    dispatcher: Arc<Dispatcher>,
    signing_key: SigningKey,
    peer_id: String,
    owner_key: String,
    session: Mutex<Option<TerminalSession>>,
    receiving_epoch: AtomicU64,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Agent {
    /// Creates a disconnected agent using `signing_key` as its identity.
    pub fn new(config: &AgentConfig, signing_key: SigningKey) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection =
            RelayConnection::new(config.relay.clone(), config.reconnect.clone(), inbound_tx);
        let dispatcher = Dispatcher::new(connection.clone(), config.request.timeout());
        let peer_id = identity::peer_id(&signing_key.verifying_key().to_bytes());

        Self {
            connection,
            dispatcher,
            signing_key,
            peer_id,
            owner_key: config.owner_key.clone(),
            session: Mutex::new(None),
            receiving_epoch: AtomicU64::new(0),
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Creates an agent from the configured Base64 secret key.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidKey`] if `secret_key` is empty or cannot
    /// be imported.
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        if config.secret_key.trim().is_empty() {
            return Err(AgentError::InvalidKey("secret_key is not set".into()));
        }
        let signing_key = identity::keypair_from_secret(&config.secret_key)
            .map_err(|e| AgentError::InvalidKey(e.to_string()))?;
        Ok(Self::new(config, signing_key))
    }

    /// This agent's PeerId.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The underlying connection manager.
    pub fn connection(&self) -> &Arc<RelayConnection> {
        &self.connection
    }

    /// The message bus.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Connection status.
    pub fn status(&self) -> ConnStatus {
        self.connection.status()
    }

    /// Opens the relay connection in the background. Idempotent.
    pub fn connect(&self) {
        if let Some(mut inbound) = lock(&self.inbound_rx).take() {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                while let Some(chunk) = inbound.recv().await {
                    dispatcher.dispatch_chunk(&chunk);
                }
                debug!("inbound pump stopped");
            });
        }
        self.connection.connect();
    }

    /// Closes the connection, cancels reconnection and clears the terminal
    /// session.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        *lock(&self.session) = None;
    }

    /// Waits until the socket is open.
    ///
    /// # Errors
    ///
    /// See [`RelayConnection::wait_connected`].
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), AgentError> {
        self.connection.wait_connected(timeout).await
    }

    /// Registers a callback for every inbound message.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(callback)
    }

    /// Removes a subscription registered with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Asks the relay to forward messages addressed to this agent.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::NotConnected`] or [`AgentError::Timeout`].
    pub async fn start_receiving(&self) -> Result<Value, AgentError> {
        let request =
            RelayRequest::new(action::SUBSCRIBE_MESSAGES).with_action_param(&self.peer_id);
        self.dispatcher.send_request(&request).await
    }

    async fn ensure_receiving(&self) -> Result<(), AgentError> {
        let epoch = self.connection.epoch();
        if epoch != 0 && self.receiving_epoch.load(Ordering::Acquire) == epoch {
            return Ok(());
        }
        self.start_receiving().await?;
        self.receiving_epoch.store(epoch, Ordering::Release);
        debug!(epoch, "subscribed to relay messages");
        Ok(())
    }

    /// Signs `envelope` and hands it to the relay for delivery, returning
    /// the relay's reply.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Codec`] if the envelope cannot be serialized,
    /// otherwise as [`Dispatcher::send_request`].
    pub async fn send_signed_message<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
    ) -> Result<Value, AgentError> {
        let signed = SignedEnvelope::seal(envelope, &self.signing_key)?;
        let request = RelayRequest::new(action::SEND_SIGNED_MESSAGE).with_signed_message(signed);
        self.dispatcher.send_request(&request).await
    }

    async fn send_command(&self, command: Command, to: &str) -> Result<Value, AgentError> {
        let envelope = Envelope::new(command, self.peer_id.as_str(), Some(to.to_string()));
        self.send_signed_message(&envelope).await
    }

    /// Fetches the fleet configuration. Falls back to an empty
    /// configuration on any failure.
    pub async fn get_config(&self) -> RelayConfig {
        let request = RelayRequest::new(action::CONFIG).with_action_param(&self.owner_key);
        let reply = match self.dispatcher.send_request(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "config request failed");
                return RelayConfig::default();
            }
        };
        if is_rejection(&reply) {
            warn!("relay rejected config request");
            return RelayConfig::default();
        }
        serde_json::from_value(reply).unwrap_or_else(|e| {
            warn!(error = %e, "malformed config reply");
            RelayConfig::default()
        })
    }

    /// Fetches the relay's view of peer connectivity. Falls back to an empty
    /// map on any failure; malformed entries are skipped.
    pub async fn get_network_info(&self) -> NetworkInfo {
        let request = RelayRequest::new(action::NETWORK_INFO).with_action_param(&self.owner_key);
        let reply = match self.dispatcher.send_request(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "network info request failed");
                return NetworkInfo::new();
            }
        };
        if is_rejection(&reply) {
            warn!("relay rejected network info request");
            return NetworkInfo::new();
        }
        let Value::Object(entries) = reply else {
            warn!("network info reply is not an object");
            return NetworkInfo::new();
        };
        entries
            .into_iter()
            .filter_map(|(peer, entry)| match serde_json::from_value(entry) {
                Ok(info) => Some((peer, info)),
                Err(e) => {
                    debug!(peer = %peer, error = %e, "skipping network info entry");
                    None
                }
            })
            .collect()
    }

    /// Lists configured robots, marking each `Online` when the relay
    /// reports it online and `Unknown` otherwise.
    pub async fn get_robots(&self) -> Vec<Robot> {
        let config = self.get_config().await;
        let network = self.get_network_info().await;
        config
            .robots
            .into_iter()
            .map(|mut robot| {
                let online = network
                    .get(&robot.robot_peer_id)
                    .is_some_and(|peer| peer.is_online);
                robot.status = Some(if online {
                    RobotStatus::Online
                } else {
                    RobotStatus::Unknown
                });
                robot
            })
            .collect()
    }

    /// Asks `robot` to start a job. Does not wait for the robot to
    /// acknowledge.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Serialize`] if `args` cannot be serialized,
    /// otherwise as [`send_signed_message`](Self::send_signed_message).
    pub async fn start_job(
        &self,
        robot: &str,
        job_id: &str,
        job_type: &str,
        args: &Value,
    ) -> Result<(), AgentError> {
        let command = Command::start_job(robot, job_id, job_type, args)?;
        self.send_command(command, robot).await?;
        info!(robot = %robot, job_id = %job_id, job_type = %job_type, "start job sent");
        Ok(())
    }

    /// Starts a job under a fresh UUID and returns the job record as
    /// issued.
    ///
    /// # Errors
    ///
    /// As [`start_job`](Self::start_job).
    pub async fn launch_job(
        &self,
        robot: &str,
        job_type: &str,
        args: &Value,
    ) -> Result<Job, AgentError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        self.start_job(robot, &job_id, job_type, args).await?;
        Ok(Job {
            id: job_id,
            kind: job_type.to_string(),
            status: JobStatus::Pending,
            timestamp: identity::unix_now().to_string(),
            robot_peer_id: robot.to_string(),
            args: Some(args.clone()),
        })
    }

    /// Lists the jobs on `robot`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Timeout`] if the robot does not answer within
    /// the request timeout.
    pub async fn get_jobs(&self, robot: &str) -> Result<Vec<Job>, AgentError> {
        let request = Command::MessageRequest(Request::ListJobs);
        let mut jobs = self
            .await_robot_reply(robot, request, |response| match response {
                Response::ListJobs(jobs) => Some(jobs),
                _ => None,
            })
            .await?;
        for job in &mut jobs {
            job.robot_peer_id = robot.to_string();
        }
        Ok(jobs)
    }

    /// Fetches details of one job on `robot`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Timeout`] if the robot does not answer within
    /// the request timeout.
    pub async fn get_job_info(&self, robot: &str, job_id: &str) -> Result<Value, AgentError> {
        let request = Command::MessageRequest(Request::JobInfo {
            job_id: job_id.to_string(),
        });
        self.await_robot_reply(robot, request, |response| match response {
            Response::JobInfo(info) => Some(info),
            _ => None,
        })
        .await
    }

    /// Sends `command` to `robot` and waits for the first message from
    /// `robot` that `extract` accepts.
    async fn await_robot_reply<R, F>(
        &self,
        robot: &str,
        command: Command,
        extract: F,
    ) -> Result<R, AgentError>
    where
        R: Send + 'static,
        F: Fn(Response) -> Option<R> + Send + Sync + 'static,
    {
        let (tx, mut rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let from = robot.to_string();
        let _guard = self.dispatcher.subscribe_scoped(move |message| {
            let Some(value) = Response::from_peer(message, &from).and_then(&extract) else {
                return Ok(());
            };
            if let Some(tx) = lock(&slot).take() {
                let _ = tx.send(value);
            }
            Ok(())
        });

        let timeout = self.dispatcher.request_timeout();
        let flow = async {
            self.ensure_receiving().await?;
            let send = self.send_command(command, robot);
            tokio::pin!(send);
            let mut sent = false;
            loop {
                tokio::select! {
                    res = &mut send, if !sent => {
                        res?;
                        sent = true;
                    }
                    reply = &mut rx => return reply.map_err(|_| AgentError::NotConnected),
                }
            }
        };
        tokio::time::timeout(timeout, flow)
            .await
            .map_err(|_| AgentError::Timeout(timeout))?
    }

    /// Attaches to a job's terminal: records the session, asks the robot to
    /// open a tunnel back to this agent, then primes the shell.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::NotConnected`] or [`AgentError::Timeout`].
    pub async fn start_terminal_session(
        &self,
        robot: &str,
        job_id: &str,
    ) -> Result<(), AgentError> {
        self.ensure_receiving().await?;
        *lock(&self.session) = Some(TerminalSession {
            robot_peer_id: robot.to_string(),
            job_id: job_id.to_string(),
        });

        let tunnel = Command::StartTunnelReq {
            job_id: job_id.to_string(),
            peer_id: self.peer_id.clone(),
        };
        self.send_command(tunnel, robot).await?;
        info!(robot = %robot, job_id = %job_id, "terminal tunnel requested");

        self.send_terminal_command(TERMINAL_PRIME).await
    }

    /// Sends terminal input to the current session's job.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::SessionNotInitialized`] without a session.
    pub async fn send_terminal_command(&self, input: &str) -> Result<(), AgentError> {
        let Some(session) = self.terminal_session() else {
            return Err(AgentError::SessionNotInitialized);
        };
        let command = Command::terminal_input(&session.job_id, input);
        self.send_command(command, &session.robot_peer_id).await?;
        Ok(())
    }

    /// The current terminal session, if any.
    pub fn terminal_session(&self) -> Option<TerminalSession> {
        lock(&self.session).clone()
    }
}

fn is_rejection(reply: &Value) -> bool {
    reply.get("ok").and_then(Value::as_bool) == Some(false)
}
