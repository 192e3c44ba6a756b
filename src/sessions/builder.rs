use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::error::MeshError;
use crate::network::messages::JoinRequest;
use crate::network::peer::Peer;
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::sessions::p2p_session::{P2PSession, Role};
use crate::telemetry::ViolationObserver;
use crate::Network;

/// Longest username the wire format can carry.
const MAX_USERNAME_LEN: usize = u8::MAX as usize;

/// Admission predicate consulted by the host for every join request that passed the version and
/// name checks. Receives the requested username, the client tag and the remote address; returning
/// `false` drops the connection without a reply.
#[cfg(feature = "sync-send")]
pub type Admission = Box<dyn FnMut(&str, &str, SocketAddr) -> bool + Send + Sync>;

/// Admission predicate consulted by the host for every join request that passed the version and
/// name checks. Receives the requested username, the client tag and the remote address; returning
/// `false` drops the connection without a reply.
#[cfg(not(feature = "sync-send"))]
pub type Admission = Box<dyn FnMut(&str, &str, SocketAddr) -> bool>;

/// The [`SessionBuilder`] builds a [`P2PSession`], either hosting or joining.
///
/// # Examples
///
/// ```
/// use lockstep_mesh::{MemoryNetwork, ProtocolConfig, SessionBuilder, SyncConfig};
///
/// # fn main() -> Result<(), lockstep_mesh::MeshError> {
/// let network = MemoryNetwork::new();
/// let host = SessionBuilder::new("host")
///     .with_protocol_config(ProtocolConfig::lan())
///     .with_sync_config(SyncConfig::tolerant())
///     .start_hosting(network.clone(), 7777)?;
/// assert!(host.is_host());
///
/// let joiner = SessionBuilder::new("alice").connect(network, host.local_addr())?;
/// assert!(!joiner.is_host());
/// # Ok(())
/// # }
/// ```
#[must_use = "SessionBuilder must be consumed by start_hosting() or connect()"]
pub struct SessionBuilder {
    username: String,
    protocol_config: ProtocolConfig,
    sync_config: SyncConfig,
    admission: Option<Admission>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            username,
            protocol_config,
            sync_config,
            admission,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("username", username)
            .field("protocol_config", protocol_config)
            .field("sync_config", sync_config)
            .field("has_admission", &admission.is_some())
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Starts a builder for the participant called `username`.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            protocol_config: ProtocolConfig::default(),
            sync_config: SyncConfig::default(),
            admission: None,
            violation_observer: None,
        }
    }

    /// Sets the wire protocol parameters.
    pub fn with_protocol_config(mut self, config: ProtocolConfig) -> Self {
        self.protocol_config = config;
        self
    }

    /// Sets the lockstep parameters.
    pub fn with_sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    /// Installs the host's admission predicate. Without one, every well-formed join request with
    /// a free name is admitted.
    ///
    /// # Examples
    ///
    /// ```
    /// use lockstep_mesh::SessionBuilder;
    /// use std::net::SocketAddr;
    ///
    /// let builder = SessionBuilder::new("host")
    ///     .with_admission(Box::new(|name: &str, _tag: &str, _addr: SocketAddr| name != "mallory"));
    /// # drop(builder);
    /// ```
    pub fn with_admission(mut self, admission: Admission) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// By default violations are only logged through `tracing`. An observer lets tests and tools
    /// collect them as well.
    ///
    /// # Examples
    ///
    /// ```
    /// use lockstep_mesh::telemetry::CollectingObserver;
    /// use lockstep_mesh::SessionBuilder;
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::new("host").with_violation_observer(observer.clone());
    /// # drop(builder);
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    fn validate(&self) -> Result<(), MeshError> {
        if self.username.is_empty() {
            return Err(MeshError::InvalidRequest {
                info: "username must not be empty".to_owned(),
            });
        }
        if self.username.len() > MAX_USERNAME_LEN {
            return Err(MeshError::InvalidRequest {
                info: format!(
                    "username is {} bytes long, at most {} fit on the wire",
                    self.username.len(),
                    MAX_USERNAME_LEN
                ),
            });
        }
        self.protocol_config.validate()?;
        self.sync_config.validate()
    }

    /// Starts hosting on `port` (0 picks an ephemeral port).
    ///
    /// # Errors
    ///
    /// [`MeshError::InvalidRequest`] for an invalid username or configuration, or whatever the
    /// network returns when binding fails.
    pub fn start_hosting<N>(self, mut network: N, port: u16) -> Result<P2PSession, MeshError>
    where
        N: Network + 'static,
    {
        self.validate()?;
        let listener = network.listen(port)?;
        info!(
            username = %self.username,
            addr = %listener.local_addr(),
            "hosting session"
        );
        Ok(P2PSession::new(
            self.username,
            Role::Host,
            Box::new(network),
            listener,
            self.protocol_config,
            self.sync_config,
            self.admission,
            self.violation_observer,
        ))
    }

    /// Joins the session hosted at `host_addr`.
    ///
    /// Opens a listener on an ephemeral port for direct connections from other participants,
    /// connects to the host and sends the join request. Admission is reported later through
    /// [`SessionEvent::JoinedGame`](crate::SessionEvent::JoinedGame) or
    /// [`SessionEvent::ConnectionRejected`](crate::SessionEvent::ConnectionRejected). A rejected
    /// join is not retried.
    ///
    /// # Errors
    ///
    /// [`MeshError::InvalidRequest`] for an invalid username or configuration, or the network's
    /// error when listening or connecting fails.
    pub fn connect<N>(self, mut network: N, host_addr: SocketAddr) -> Result<P2PSession, MeshError>
    where
        N: Network + 'static,
    {
        self.validate()?;
        let listener = network.listen(0)?;
        let connection = network.connect(host_addr)?;
        let request = JoinRequest {
            protocol_version: self.protocol_config.protocol_version,
            callback_port: listener.local_addr().port(),
            username: self.username.clone(),
            client_tag: self.protocol_config.client_tag.clone(),
        };
        info!(
            username = %self.username,
            host = %host_addr,
            callback_port = request.callback_port,
            "joining session"
        );

        let max_frame_size = self.protocol_config.max_frame_size;
        let mut session = P2PSession::new(
            self.username,
            Role::Joiner,
            Box::new(network),
            listener,
            self.protocol_config,
            self.sync_config,
            None,
            self.violation_observer,
        );
        let host = session.register_host(|handle| {
            Peer::dialed(handle, connection, host_addr, max_frame_size)
        })?;
        host.send_payload(&request)?;
        Ok(session)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;

    #[test]
    fn empty_username_is_rejected() {
        let err = SessionBuilder::new("")
            .start_hosting(MemoryNetwork::new(), 0)
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest { .. }));
    }

    #[test]
    fn oversized_username_is_rejected() {
        let err = SessionBuilder::new("x".repeat(256))
            .start_hosting(MemoryNetwork::new(), 0)
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest { .. }));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ProtocolConfig {
            max_frame_size: 0,
            ..ProtocolConfig::default()
        };
        let err = SessionBuilder::new("host")
            .with_protocol_config(config)
            .start_hosting(MemoryNetwork::new(), 0)
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest { .. }));
    }

    #[test]
    fn connect_without_host_fails() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 5999));
        let err = SessionBuilder::new("alice")
            .connect(MemoryNetwork::new(), addr)
            .unwrap_err();
        assert!(matches!(err, MeshError::TransportError { .. }));
    }

    #[test]
    fn hosting_binds_the_requested_port() {
        let network = MemoryNetwork::new();
        let host = SessionBuilder::new("host")
            .start_hosting(network.clone(), 7100)
            .unwrap();
        assert_eq!(host.local_addr().port(), 7100);
        assert!(network.is_listening(7100));
        assert!(SessionBuilder::new("other")
            .start_hosting(network, 7100)
            .is_err());
    }

    #[test]
    fn debug_hides_closures() {
        let builder = SessionBuilder::new("host")
            .with_admission(Box::new(|_name: &str, _tag: &str, _addr: SocketAddr| true));
        let text = format!("{builder:?}");
        assert!(text.contains("has_admission: true"));
    }
}
