//! Ties the realtime session to the authentication state.
//!
//! The auth layer publishes the current credential on a `watch` channel:
//! `Some` after login or session restore, `None` after logout or expiry.
//! [`bind_credentials`] turns those changes into registry `connect` and
//! `disconnect` calls.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::credential::Credential;
use crate::registry::ConnectionRegistry;

/// Running credential binding. Dropping it stops following the channel and
/// disconnects the registry.
#[must_use = "dropping the binding disconnects immediately"]
pub struct CredentialBinding {
    registry: Arc<ConnectionRegistry>,
    task: JoinHandle<()>,
}

impl CredentialBinding {
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

impl Drop for CredentialBinding {
    fn drop(&mut self) {
        self.task.abort();
        self.registry.disconnect();
    }
}

/// Follow `credentials`, connecting when a credential is present and
/// disconnecting when it goes away.
///
/// A new credential while a session is already active does not replace the
/// session; logout (`None`) followed by login does.
pub fn bind_credentials(
    registry: Arc<ConnectionRegistry>,
    mut credentials: watch::Receiver<Option<Credential>>,
) -> CredentialBinding {
    let task = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move {
            loop {
                let current = credentials.borrow_and_update().clone();
                match current {
                    Some(credential) => {
                        tracing::debug!("Credential available, connecting realtime session");
                        registry.connect(credential);
                    }
                    None => {
                        tracing::debug!("No credential, disconnecting realtime session");
                        registry.disconnect();
                    }
                }

                if credentials.changed().await.is_err() {
                    tracing::debug!("Credential source closed");
                    break;
                }
            }
        }
    });

    CredentialBinding { registry, task }
}
