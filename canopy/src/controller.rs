use std::sync::Arc;

use anyhow::Result;
use canopy_core::{BatchWriter, ChangeSubscriber, EventBus, Reader, RemoteStore};
use tracing::{debug, info};

use crate::config::{
    ConnectionConfig, ControllerOptions, MemoryLoginStore, SavedLogin, SavedLoginStore,
};
use crate::module_action::ModuleAction;
use crate::session::{IdentityProvider, Session, UserState};

/// Everything a connected client works with. All parts share one event bus.
pub struct Controllers {
    pub reader: Reader,
    pub writer: BatchWriter,
    pub watcher: ChangeSubscriber,
    pub module_action: ModuleAction,
    pub session: Session,
    pub events: EventBus,
    pub saved_login_key: String,
    saved_logins: Arc<dyn SavedLoginStore>,
}

pub struct Controller;

impl Controller {
    /// Wires every controller to `store` and `identity`. Saved logins are kept
    /// in memory unless [`Controllers::with_saved_logins`] says otherwise.
    pub fn connect(
        config: &ConnectionConfig,
        store: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        options: ControllerOptions,
    ) -> Controllers {
        let events = EventBus::new();
        info!(project = %config.project_id, "connecting controllers");
        Controllers {
            reader: Reader::new(store.clone()),
            writer: BatchWriter::new(store.clone()).with_events(events.clone()),
            watcher: ChangeSubscriber::new(store).with_events(events.clone()),
            module_action: ModuleAction::new(config.functions_url.clone(), Some(identity.clone())),
            session: Session::new(identity).with_events(events.clone()),
            events,
            saved_login_key: options.saved_login_key,
            saved_logins: Arc::new(MemoryLoginStore::new()),
        }
    }
}

impl Controllers {
    pub fn with_saved_logins(mut self, saved_logins: Arc<dyn SavedLoginStore>) -> Self {
        self.saved_logins = saved_logins;
        self
    }

    /// Stores the current user's login under the saved-login key, or clears
    /// the key when nobody with an email is signed in.
    pub async fn remember_login(&self, org_token: &str) -> Result<Option<SavedLogin>> {
        match self.session.saved_login(org_token).await {
            Some(login) => {
                self.saved_logins.set(&self.saved_login_key, &login).await?;
                debug!(key = %self.saved_login_key, "login remembered");
                Ok(Some(login))
            }
            None => {
                self.saved_logins.remove(&self.saved_login_key).await?;
                Ok(None)
            }
        }
    }

    pub async fn saved_login(&self) -> Result<Option<SavedLogin>> {
        self.saved_logins.get(&self.saved_login_key).await
    }

    /// Signs in again with the remembered credential. `None` when nothing is
    /// remembered or it no longer matches the provider's user.
    pub async fn restore_login(&self) -> Result<Option<UserState>> {
        let Some(login) = self.saved_login().await? else {
            return Ok(None);
        };
        Ok(self.session.sign_in_with_credential(&login.credential).await)
    }

    /// Signs out and forgets the saved login.
    pub async fn sign_out(&self) -> Result<()> {
        self.session.sign_out().await?;
        self.saved_logins.remove(&self.saved_login_key).await
    }
}
