//! Password sessions against a PDS.
//!
//! A [`Session`] moves between three states: unauthenticated, authenticated,
//! and expired. Callers never handle tokens directly; they hand a request
//! builder to [`Session::send`], which attaches the access token and renews the
//! session once if the service rejects it.

use atrium_api::types::string::Did;
use reqwest::{RequestBuilder, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{config::Credentials, error::ApiError};

/// Build the url of an XRPC method on `service`.
pub(crate) fn xrpc_url(service: &url::Url, nsid: &str) -> String {
    format!("{}/xrpc/{nsid}", service.as_str().trim_end_matches('/'))
}

/// Decode an XRPC response, turning error statuses into [`ApiError`]s.
pub(crate) async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, ApiError> {
    let status = res.status();
    if status.is_success() {
        return res.json::<T>().await.map_err(Into::into);
    }

    let body = res.text().await.unwrap_or_default();
    Err(ApiError::from_response(status, &body))
}

#[derive(Serialize)]
struct CreateSessionInput<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionTokens {
    access_jwt: String,
    refresh_jwt: String,
    did: Did,
    handle: String,
}

enum SessionState {
    Unauthenticated,
    Authenticated(SessionTokens),
    Expired(SessionTokens),
}

/// An authenticated account on a PDS.
pub struct Session {
    client: reqwest::Client,
    credentials: Credentials,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(client: reqwest::Client, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
            state: Mutex::new(SessionState::Unauthenticated),
        }
    }

    /// The PDS this session talks to.
    pub fn service(&self) -> &url::Url {
        &self.credentials.service
    }

    /// Create a fresh session from the account password.
    pub async fn login(&self) -> Result<Did, ApiError> {
        let mut state = self.state.lock().await;
        let tokens = self.create_session().await?;
        let did = tokens.did.clone();
        *state = SessionState::Authenticated(tokens);
        Ok(did)
    }

    /// Renew the session, falling back to a fresh login if the refresh token is
    /// rejected or missing.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        let refresh_jwt = match *state {
            SessionState::Authenticated(ref t) | SessionState::Expired(ref t) => {
                Some(t.refresh_jwt.clone())
            }
            SessionState::Unauthenticated => None,
        };

        let tokens = match refresh_jwt {
            Some(jwt) => match self.refresh_session(&jwt).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!("session refresh failed, logging in again: {e}");
                    self.create_session().await?
                }
            },
            None => self.create_session().await?,
        };

        *state = SessionState::Authenticated(tokens);
        Ok(())
    }

    /// Return a usable access token, logging in or refreshing as needed.
    pub async fn ensure_valid(&self) -> Result<String, ApiError> {
        {
            let state = self.state.lock().await;
            if let SessionState::Authenticated(ref t) = *state {
                return Ok(t.access_jwt.clone());
            }
        }

        self.refresh().await?;
        match *self.state.lock().await {
            SessionState::Authenticated(ref t) => Ok(t.access_jwt.clone()),
            _ => Err(ApiError::Unauthenticated(
                "session unavailable after refresh".to_owned(),
            )),
        }
    }

    async fn mark_expired(&self) {
        let mut state = self.state.lock().await;
        if let SessionState::Authenticated(ref t) = *state {
            *state = SessionState::Expired(t.clone());
        }
    }

    /// Send an authenticated request built by `build`, renewing the session and
    /// retrying once if it has expired.
    pub async fn send<T, F>(&self, build: F) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.ensure_valid().await?;
        let res = decode(
            build(&self.client)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .await?,
        )
        .await;

        match res {
            Err(e) if e.is_session_expired() => {
                debug!("session expired, refreshing: {e}");
                self.mark_expired().await;
                let token = self.ensure_valid().await?;
                decode(
                    build(&self.client)
                        .header(header::AUTHORIZATION, format!("Bearer {token}"))
                        .send()
                        .await?,
                )
                .await
            }
            res => res,
        }
    }

    async fn create_session(&self) -> Result<SessionTokens, ApiError> {
        let res = self
            .client
            .post(xrpc_url(self.service(), "com.atproto.server.createSession"))
            .json(&CreateSessionInput {
                identifier: &self.credentials.identifier,
                password: &self.credentials.password,
            })
            .send()
            .await?;

        let tokens: SessionTokens = decode(res).await?;
        info!("logged in as {} ({})", tokens.handle, tokens.did.as_str());
        Ok(tokens)
    }

    async fn refresh_session(&self, refresh_jwt: &str) -> Result<SessionTokens, ApiError> {
        let res = self
            .client
            .post(xrpc_url(self.service(), "com.atproto.server.refreshSession"))
            .header(header::AUTHORIZATION, format!("Bearer {refresh_jwt}"))
            .send()
            .await?;

        let tokens = decode(res).await?;
        debug!("session refreshed");
        Ok(tokens)
    }
}
