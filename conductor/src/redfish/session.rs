//! Session lifecycle for a device client

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

use redfish_models::SessionCreateRequest;
use secrecy::ExposeSecret;

use crate::errors::ProtocolError;
use crate::redfish::client::{resolve_location, RedfishClient, AUTH_TOKEN_HEADER, SESSIONS_PATH};

const SESSION_DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// An authenticated session on a device
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub location: Option<Url>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(token: String, location: Option<Url>, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(30));
        Self {
            token,
            location,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    /// Whether the session expires within `margin` from now
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + margin >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub(crate) enum SessionState {
    #[default]
    None,
    Active(Session),
    /// The device has no session service; use basic auth from now on
    BasicFallback,
}

/// Credentials attached to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Auth {
    Token(String),
    Basic,
}

/// Observable authentication mode of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Unauthenticated,
    Session,
    Basic,
}

enum SessionOutcome {
    Created(Session),
    Unsupported(u16),
}

impl RedfishClient {
    /// Current authentication mode
    pub async fn auth_mode(&self) -> AuthMode {
        match &*self.session.lock().await {
            SessionState::None => AuthMode::Unauthenticated,
            SessionState::Active(_) => AuthMode::Session,
            SessionState::BasicFallback => AuthMode::Basic,
        }
    }

    /// Return usable credentials, creating or renewing the session if needed.
    ///
    /// The session mutex is held across creation so concurrent callers wait
    /// for a single create call.
    pub(crate) async fn ensure_session(&self, deadline: Instant) -> Result<Auth, ProtocolError> {
        let mut state = self.session.lock().await;

        match &*state {
            SessionState::BasicFallback => return Ok(Auth::Basic),
            SessionState::Active(session)
                if !session.expires_within(self.options.session_renew_margin) =>
            {
                return Ok(Auth::Token(session.token.clone()));
            }
            _ => {}
        }

        match self.create_session(deadline).await {
            Ok(SessionOutcome::Created(session)) => {
                let token = session.token.clone();
                if let SessionState::Active(old) = std::mem::replace(&mut *state, SessionState::Active(session)) {
                    self.spawn_session_delete(old);
                }
                Ok(Auth::Token(token))
            }
            Ok(SessionOutcome::Unsupported(status)) => {
                info!(
                    "Session service unavailable on {} (HTTP {}), using basic auth",
                    self.base_url, status
                );
                *state = SessionState::BasicFallback;
                Ok(Auth::Basic)
            }
            Err(e) => match &*state {
                // renewal inside the margin failed but the old token still works
                SessionState::Active(session) if session.expires_at > Utc::now() => {
                    warn!("Session renewal on {} failed: {}", self.base_url, e);
                    Ok(Auth::Token(session.token.clone()))
                }
                _ => Err(e),
            },
        }
    }

    async fn create_session(&self, deadline: Instant) -> Result<SessionOutcome, ProtocolError> {
        let url = self.url(SESSIONS_PATH)?;
        let body = SessionCreateRequest {
            user_name: self.credentials.username.clone(),
            password: self.credentials.password.expose_secret().to_string(),
        };
        let request = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .json(&body);

        let response = self.send(request, deadline).await?;
        match response.status {
            200..=299 => {
                let token = response.auth_token.clone().ok_or_else(|| {
                    ProtocolError::MalformedResponse(format!(
                        "Session response from {} has no {} header",
                        self.base_url, AUTH_TOKEN_HEADER
                    ))
                })?;
                let location = resolve_location(&self.base_url, response.location.as_deref())?;
                debug!("Created session on {}", self.base_url);
                Ok(SessionOutcome::Created(Session::new(
                    token,
                    location,
                    self.options.session_ttl,
                )))
            }
            404 | 501 => Ok(SessionOutcome::Unsupported(response.status)),
            401 | 403 => Err(ProtocolError::Authentication(format!(
                "Session creation on {} rejected: {}",
                self.base_url,
                response.body_text()
            ))),
            status => Err(ProtocolError::from_status(status, response.body_text())),
        }
    }

    /// Drop the session if it still carries `token`
    pub(crate) async fn invalidate_session(&self, token: &str) {
        let mut state = self.session.lock().await;
        let matches = matches!(&*state, SessionState::Active(session) if session.token == token);
        if matches {
            if let SessionState::Active(old) = std::mem::take(&mut *state) {
                self.spawn_session_delete(old);
            }
        }
    }

    /// Drop any active session; basic-auth fallback is kept
    pub(crate) async fn discard_session(&self) {
        let mut state = self.session.lock().await;
        if matches!(&*state, SessionState::Active(_)) {
            if let SessionState::Active(old) = std::mem::take(&mut *state) {
                self.spawn_session_delete(old);
            }
        }
    }

    fn spawn_session_delete(&self, session: Session) {
        let Some(location) = session.location else {
            return;
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            let result = http
                .delete(location.clone())
                .header(AUTH_TOKEN_HEADER, session.token)
                .timeout(SESSION_DELETE_TIMEOUT)
                .send()
                .await;
            if let Err(e) = result {
                debug!("Failed to delete session {}: {}", location, e);
            }
        });
    }

    /// Delete the session on the device. Never fails.
    pub async fn close(&self) {
        let previous = {
            let mut state = self.session.lock().await;
            match &*state {
                SessionState::Active(_) => std::mem::take(&mut *state),
                _ => SessionState::None,
            }
        };

        let SessionState::Active(session) = previous else {
            return;
        };
        let Some(location) = session.location else {
            return;
        };

        let delete = self
            .http
            .delete(location.clone())
            .header(AUTH_TOKEN_HEADER, session.token)
            .send();
        match timeout(SESSION_DELETE_TIMEOUT, delete).await {
            Ok(Ok(response)) => debug!("Closed session {} (HTTP {})", location, response.status()),
            Ok(Err(e)) => warn!("Failed to close session {}: {}", location, e),
            Err(_) => warn!("Timed out closing session {}", location),
        }
    }
}
