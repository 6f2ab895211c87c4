//! Client and session configuration.

use std::time::Duration;

use crate::{
    message::DEFAULT_ADAPTER_SET,
    reconnect::BackoffConfig,
    types::{Credentials, ServerAddress, Ttl},
};

/// Configuration shared by every session of a [`TlcpClient`](crate::TlcpClient).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    // Server
    /// Endpoint sessions are created on.
    pub server_address: ServerAddress,
    /// Adapter set requested on session creation.
    pub adapter_set: String,
    /// Optional user and password.
    pub credentials: Option<Credentials>,

    // Stream timing
    /// Keep-alive interval requested from the server (None = server default).
    pub keep_alive: Option<Duration>,
    /// Grace period added to the keep-alive before a stream is deemed stale.
    pub keep_alive_extra: Duration,
    /// Idle time after which the client sends a heartbeat (None = never).
    pub inactivity: Option<Duration>,

    // Session
    /// Create the session on a polling connection and bind it on the control link.
    pub force_control_link: bool,
    /// Time-to-live of the session while it has no bound stream.
    pub create_session_ttl: Ttl,
    /// Whether the server sends `SYNC` notifications.
    pub send_sync: bool,
    /// Timeout for connecting and for the server's first reply.
    pub connect_timeout: Duration,

    // Reconnection settings
    /// Initial delay before first reconnection attempt.
    pub reconnect_initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for reconnection delays.
    pub reconnect_backoff_factor: f64,
    /// Random jitter factor (0.0-1.0) for reconnection delays.
    pub reconnect_jitter: f64,

    // Channels
    /// Capacity of the event channel of subscriptions with end-of-snapshot.
    pub subscription_buffer_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: ServerAddress::new("localhost", 80, false),
            adapter_set: DEFAULT_ADAPTER_SET.to_string(),
            credentials: None,
            keep_alive: None,
            keep_alive_extra: Duration::from_secs(3),
            inactivity: None,
            force_control_link: false,
            create_session_ttl: Ttl::Unknown,
            send_sync: false,
            connect_timeout: Duration::from_secs(10),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_backoff_factor: 2.0,
            reconnect_jitter: 0.1,
            subscription_buffer_capacity: 8,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration for the given server.
    pub fn new(server_address: ServerAddress) -> Self {
        Self {
            server_address,
            ..Default::default()
        }
    }

    /// Set the adapter set.
    #[must_use]
    pub fn adapter_set(mut self, adapter_set: impl Into<String>) -> Self {
        self.adapter_set = adapter_set.into();
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the keep-alive interval.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Set the keep-alive grace period.
    #[must_use]
    pub fn keep_alive_extra(mut self, extra: Duration) -> Self {
        self.keep_alive_extra = extra;
        self
    }

    /// Set the inactivity interval.
    #[must_use]
    pub fn inactivity(mut self, inactivity: Duration) -> Self {
        self.inactivity = Some(inactivity);
        self
    }

    /// Set whether to bind every session on its control link.
    #[must_use]
    pub fn force_control_link(mut self, force: bool) -> Self {
        self.force_control_link = force;
        self
    }

    /// Set the session time-to-live.
    #[must_use]
    pub fn create_session_ttl(mut self, ttl: Ttl) -> Self {
        self.create_session_ttl = ttl;
        self
    }

    /// Set whether the server sends `SYNC` notifications.
    #[must_use]
    pub fn send_sync(mut self, send_sync: bool) -> Self {
        self.send_sync = send_sync;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnection initial delay.
    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the reconnection jitter.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the buffer capacity of end-of-snapshot subscriptions.
    #[must_use]
    pub fn subscription_buffer_capacity(mut self, capacity: usize) -> Self {
        self.subscription_buffer_capacity = capacity;
        self
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
        }
    }

    /// Deadline for stream traffic: keep-alive plus the grace period.
    pub(crate) fn stalled_timeout(&self, server_keep_alive: Option<Duration>) -> Option<Duration> {
        server_keep_alive
            .or(self.keep_alive)
            .map(|keep_alive| keep_alive + self.keep_alive_extra)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_address.host.is_empty() {
            return Err("Server host cannot be empty".to_string());
        }
        if self.adapter_set.is_empty() {
            return Err("Adapter set name cannot be empty".to_string());
        }
        if self.keep_alive.is_some_and(|keep_alive| keep_alive.is_zero()) {
            return Err("Keep-alive must be > 0".to_string());
        }
        if self.inactivity.is_some_and(|inactivity| inactivity.is_zero()) {
            return Err("Inactivity must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        self.backoff().validate()?;
        if self.subscription_buffer_capacity == 0 {
            return Err("Subscription buffer capacity must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new(ServerAddress::new("push.example.com", 443, true))
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.adapter_set, "DEFAULT");
        assert!(config.credentials.is_none());
        assert!(config.keep_alive.is_none());
        assert_eq!(config.keep_alive_extra, Duration::from_secs(3));
        assert!(!config.force_control_link);
        assert!(!config.send_sync);
        assert_eq!(config.create_session_ttl, Ttl::Unknown);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.subscription_buffer_capacity, 8);
    }

    #[test]
    fn test_builder_pattern() {
        let config = config()
            .adapter_set("DEMO")
            .credentials(Credentials::new("user", "secret"))
            .keep_alive(Duration::from_secs(5))
            .inactivity(Duration::from_secs(10))
            .force_control_link(true)
            .create_session_ttl(Ttl::Unlimited);

        assert_eq!(config.server_address.host, "push.example.com");
        assert_eq!(config.adapter_set, "DEMO");
        assert_eq!(config.keep_alive, Some(Duration::from_secs(5)));
        assert_eq!(config.inactivity, Some(Duration::from_secs(10)));
        assert!(config.force_control_link);
        assert_eq!(config.create_session_ttl, Ttl::Unlimited);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_adapter_set() {
        let result = config().adapter_set("").validate();
        assert_eq!(result.unwrap_err(), "Adapter set name cannot be empty");
    }

    #[test]
    fn test_validation_zero_keep_alive() {
        let result = config().keep_alive(Duration::ZERO).validate();
        assert_eq!(result.unwrap_err(), "Keep-alive must be > 0");
    }

    #[test]
    fn test_validation_invalid_backoff() {
        let result = config().reconnect_backoff_factor(0.5).validate();
        assert_eq!(result.unwrap_err(), "Backoff factor must be >= 1.0");
    }

    #[test]
    fn test_stalled_timeout_prefers_server_keep_alive() {
        let config = config().keep_alive(Duration::from_secs(5));
        assert_eq!(
            config.stalled_timeout(Some(Duration::from_secs(2))),
            Some(Duration::from_secs(5))
        );
        assert_eq!(config.stalled_timeout(None), Some(Duration::from_secs(8)));
        assert_eq!(ClientConfig::default().stalled_timeout(None), None);
    }
}
