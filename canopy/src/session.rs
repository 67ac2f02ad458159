//! Signed-in user tracking.
//!
//! The identity provider reports auth-state changes whenever it likes; callers
//! that ask for the user before the first report are parked in a
//! [`PendingResult`] and released together once it arrives.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use canopy_core::{Event, EventBus, PendingResult, RegisterError};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SavedLogin;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub uid: String,
    pub email: Option<String>,
}

impl UserState {
    pub fn credential(&self) -> Option<Credential> {
        self.email.clone().map(|email| Credential::Email { email })
    }
}

/// Proof of identity offered at sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    Email { email: String },
    IdToken { token: String },
}

impl Credential {
    /// The email this credential speaks for, if any.
    pub fn email(&self) -> Option<String> {
        match self {
            Credential::Email { email } => Some(email.clone()),
            Credential::IdToken { token } => read_claims(token).ok().and_then(|c| c.email),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// Reads ID token claims without checking the signature. The backend verifies
/// the token on every request; we only need to know who it names.
fn read_claims(token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Option<UserState>;
    async fn id_token(&self, force_refresh: bool) -> Result<String>;
    async fn sign_out(&self) -> Result<()>;
}

/// Identity backed by a fixed ID token.
pub struct StaticIdentity {
    token: String,
    user: Mutex<Option<UserState>>,
}

impl StaticIdentity {
    pub fn from_id_token(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let claims = read_claims(&token)?;
        Ok(Self {
            token,
            user: Mutex::new(Some(UserState {
                uid: claims.sub,
                email: claims.email,
            })),
        })
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<UserState> {
        self.user.lock().clone()
    }

    async fn id_token(&self, _force_refresh: bool) -> Result<String> {
        if self.user.lock().is_none() {
            return Err(anyhow!("no signed-in user"));
        }
        Ok(self.token.clone())
    }

    async fn sign_out(&self) -> Result<()> {
        self.user.lock().take();
        Ok(())
    }
}

pub struct Session {
    identity: Arc<dyn IdentityProvider>,
    user: PendingResult<Option<UserState>>,
    events: Option<EventBus>,
}

impl Session {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identity,
            user: PendingResult::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    /// Feeds one auth-state change. A signed-in user only counts once a fresh
    /// ID token could be obtained for it.
    pub async fn observe_user(&self, user: Option<UserState>) {
        let user = match user {
            None => None,
            Some(user) => match self.identity.id_token(true).await {
                Ok(_) => Some(user),
                Err(e) => {
                    warn!(uid = %user.uid, error = %e, "id token refresh failed");
                    self.user.reject(e.to_string());
                    return;
                }
            },
        };
        let label = user.as_ref().map(|u| u.email.clone().unwrap_or_else(|| u.uid.clone()));
        if self.user.resolve(user) {
            debug!(user = ?label, "auth state changed");
            self.publish(Event::SessionChanged { user: label });
        }
    }

    pub fn observe_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "auth error");
        self.user.reject(message);
    }

    /// Asks the provider for its current user and feeds the answer in.
    pub async fn refresh(&self) {
        let user = self.identity.current_user().await;
        self.observe_user(user).await;
    }

    /// Waits for the first auth-state report and returns the user it named.
    pub async fn resolve_user(&self) -> Result<Option<UserState>> {
        self.user.wait().await.map_err(|e| match e {
            RegisterError::Closed => anyhow!("auth state observer has been closed"),
            RegisterError::Rejected(message) => anyhow!(message),
        })
    }

    /// Returns the provider's current user when `credential` names the same
    /// email, `None` otherwise.
    pub async fn sign_in_with_credential(&self, credential: &Credential) -> Option<UserState> {
        let user = self.identity.current_user().await?;
        let email = credential.email()?;
        if user.email.as_deref() != Some(email.as_str()) {
            debug!("credential does not match the current user");
            return None;
        }
        info!(uid = %user.uid, "signed in");
        Some(user)
    }

    /// What to remember so the next run can sign in again.
    pub async fn saved_login(&self, org_token: &str) -> Option<SavedLogin> {
        let credential = self.identity.current_user().await?.credential()?;
        Some(SavedLogin {
            org_token: org_token.to_string(),
            credential,
        })
    }

    /// Stops tracking auth state and signs out of the provider. Callers still
    /// parked in [`Session::resolve_user`] fail.
    pub async fn sign_out(&self) -> Result<()> {
        self.user.close();
        self.identity.sign_out().await?;
        info!("signed out");
        self.publish(Event::SessionChanged { user: None });
        Ok(())
    }

    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}
