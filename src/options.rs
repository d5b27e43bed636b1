use super::{Error, ObjectKind, Result};
use std::env;
use std::time::Duration;

const DEFAULT_SSH_COMMAND: &str = "ssh";

/// Knobs for a single pack scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Chunks the producer may run ahead of the reader (default: 1).
    pub channel_capacity: usize,
    /// Object kinds whose payload reaches the reader (default: commit, blob).
    pub kinds: Vec<ObjectKind>,
    /// User-Agent sent with HTTP requests.
    pub user_agent: String,
    /// Program spawned for ssh endpoints.
    pub ssh_command: String,
    /// TCP connect timeout for HTTP endpoints.
    pub connect_timeout: Option<Duration>,
    /// Honour HTTP(S)_PROXY and friends.
    pub system_proxy: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 1,
            kinds: vec![ObjectKind::Commit, ObjectKind::Blob],
            user_agent: format!("git-pack-scanner/{}", env!("CARGO_PKG_VERSION")),
            ssh_command: DEFAULT_SSH_COMMAND.to_string(),
            connect_timeout: None,
            system_proxy: true,
        }
    }
}

impl ScanOptions {
    /// Defaults, with the ssh program taken from `GIT_SSH` when it is set.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(command) = env::var("GIT_SSH") {
            if !command.trim().is_empty() {
                options.ssh_command = command;
            }
        }
        options
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn kinds(mut self, kinds: &[ObjectKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn ssh_command(mut self, command: impl Into<String>) -> Self {
        self.ssh_command = command.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn system_proxy(mut self, enabled: bool) -> Self {
        self.system_proxy = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(Error::InvalidRequest(
                "channel capacity must be at least 1".into(),
            ));
        }
        if self.kinds.is_empty() {
            return Err(Error::InvalidRequest(
                "at least one object kind must be selected".into(),
            ));
        }
        if self.ssh_command.trim().is_empty() {
            return Err(Error::InvalidRequest("ssh command must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_defaults_to_strict_backpressure() {
        let options = ScanOptions::default();
        assert_eq!(options.channel_capacity, 1);
        assert_eq!(options.kinds, vec![ObjectKind::Commit, ObjectKind::Blob]);
        assert_eq!(options.ssh_command, "ssh");
        assert!(options.user_agent.starts_with("git-pack-scanner/"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn it_rejects_invalid_options() {
        let err = ScanOptions::default().channel_capacity(0).validate();
        assert!(matches!(err, Err(Error::InvalidRequest(_))));

        let err = ScanOptions::default().kinds(&[]).validate();
        assert!(matches!(err, Err(Error::InvalidRequest(_))));

        let err = ScanOptions::default().ssh_command(" ").validate();
        assert!(matches!(err, Err(Error::InvalidRequest(_))));
    }
}
