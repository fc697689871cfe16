//! Mount-time connection setup.

use crate::client::RemoteClient;
use crate::error::{RemoteError, RemoteResult};
use crate::memory::MemoryRemote;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// How the server certificate is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Verify the server certificate against the system roots.
    #[default]
    Verify,
    /// Accept any server certificate.
    TrustAll,
}

/// User credentials for the remote service.
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to reach the remote service.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server address, `scheme://host[:port]`.
    pub server_url: String,
    pub trust_policy: TrustPolicy,
    pub credentials: Credentials,
    /// Ask the client to deduplicate writes before sending them.
    pub dedupe: bool,
}

impl ConnectOptions {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            trust_policy: TrustPolicy::Verify,
            credentials: Credentials::default(),
            dedupe: false,
        }
    }

    #[must_use]
    pub fn trust_policy(mut self, policy: TrustPolicy) -> Self {
        self.trust_policy = policy;
        self
    }

    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    /// Splits the server url into `(scheme, rest)`.
    pub fn scheme(&self) -> RemoteResult<(&str, &str)> {
        self.server_url
            .split_once("://")
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| RemoteError::InvalidUrl(self.server_url.clone()))
    }
}

/// Establishes the shared connection to the remote service.
///
/// `mem://<name>` yields a fresh in-process [`MemoryRemote`]. Other schemes
/// are reported as [`RemoteError::UnsupportedScheme`]; a network client plugs
/// in here.
pub async fn connect(options: &ConnectOptions) -> RemoteResult<Arc<dyn RemoteClient>> {
    let (scheme, rest) = options.scheme()?;
    debug!(
        scheme,
        trust = ?options.trust_policy,
        dedupe = options.dedupe,
        user = %options.credentials.user,
        "Connecting to remote service"
    );
    match scheme {
        "mem" => {
            info!(volume = rest, "Using in-memory remote");
            Ok(Arc::new(MemoryRemote::with_name(rest)))
        }
        other => Err(RemoteError::UnsupportedScheme(other.to_string())),
    }
}
