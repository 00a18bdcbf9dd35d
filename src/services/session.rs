//! Authenticated calls with a single refresh-and-retry on failure.
//!
//! Policy for every call:
//! 1. call with the current access token
//! 2. on a non-200 answer refresh once; a failed refresh aborts
//! 3. persist the new token set, then retry exactly once
//!
//! Transport and decoding failures are returned as they are, since a new
//! token cannot fix them.
//!
//! Persisting before the retry means a crash can never leave the store
//! holding a refresh token the provider has already rotated away.

use crate::auth::{AuthError, StoreError, TokenEndpoint, TokenSet, TokenStore};
use crate::client::{ApiError, DeviceApi};
use crate::models::honeywell::{ChangeableValues, DeviceId, Location, LocationId};
use log::{debug, info, warn};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum RetryError {
    /// The call failed for a reason other than its HTTP status. No refresh.
    NotRetried(ApiError),
    /// The call failed and so did the token refresh. The call was not retried.
    RefreshFailed { initial: ApiError, refresh: AuthError },
    /// The refresh worked but the retried call failed again.
    RetryFailed { initial: ApiError, retry: ApiError },
    /// The refreshed tokens could not be stored. The call was not retried.
    Persist { initial: ApiError, source: StoreError },
}

impl Display for RetryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::NotRetried(e) => write!(f, "{}", e),
            RetryError::RefreshFailed { initial, refresh } => {
                write!(f, "{} (token refresh failed: {})", initial, refresh)
            }
            RetryError::RetryFailed { initial, retry } => {
                write!(f, "{} (still failing after token refresh: {})", initial, retry)
            }
            RetryError::Persist { initial, source } => {
                write!(f, "{} (storing refreshed tokens failed: {})", initial, source)
            }
        }
    }
}

impl std::error::Error for RetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::NotRetried(e) => Some(e),
            RetryError::RefreshFailed { refresh, .. } => Some(refresh),
            RetryError::RetryFailed { retry, .. } => Some(retry),
            RetryError::Persist { source, .. } => Some(source),
        }
    }
}

pub struct AuthenticatedSession<'a> {
    api: &'a dyn DeviceApi,
    endpoint: &'a dyn TokenEndpoint,
    store: &'a dyn TokenStore,
    tokens: RefCell<TokenSet>,
    refreshes: Cell<u32>,
}

impl<'a> AuthenticatedSession<'a> {
    pub fn new(
        api: &'a dyn DeviceApi,
        endpoint: &'a dyn TokenEndpoint,
        store: &'a dyn TokenStore,
        tokens: TokenSet,
    ) -> Self {
        AuthenticatedSession {
            api,
            endpoint,
            store,
            tokens: RefCell::new(tokens),
            refreshes: Cell::new(0),
        }
    }

    /// Token set currently in use (the refreshed one after a refresh).
    pub fn tokens(&self) -> TokenSet {
        self.tokens.borrow().clone()
    }

    /// How many refreshes this session performed.
    pub fn refresh_count(&self) -> u32 {
        self.refreshes.get()
    }

    pub fn fetch_locations(&self) -> Result<Vec<Location>, RetryError> {
        self.call("fetch locations", |api, token| api.fetch_locations(token))
    }

    pub fn push_device_settings(
        &self,
        location_id: LocationId,
        device_id: &DeviceId,
        values: &ChangeableValues,
    ) -> Result<Value, RetryError> {
        self.call("push device settings", |api, token| {
            api.push_device_settings(token, location_id, device_id, values)
        })
    }

    /// Run `op` under the refresh-and-retry-once policy.
    pub fn call<R>(
        &self,
        what: &str,
        op: impl Fn(&dyn DeviceApi, &str) -> Result<R, ApiError>,
    ) -> Result<R, RetryError> {
        let access = self.tokens.borrow().access_token.clone();
        let initial = match op(self.api, &access) {
            Ok(r) => return Ok(r),
            Err(e @ ApiError::Http { .. }) => e,
            Err(e) => return Err(RetryError::NotRetried(e)),
        };
        warn!("{} failed: {}; refreshing access token", what, initial);

        let refresh_token = self.tokens.borrow().refresh_token.clone();
        let refreshed = match self.endpoint.refresh(&refresh_token) {
            Ok(t) => t,
            Err(refresh) => return Err(RetryError::RefreshFailed { initial, refresh }),
        };
        self.refreshes.set(self.refreshes.get() + 1);
        if let Err(source) = self.store.save(&refreshed) {
            return Err(RetryError::Persist { initial, source });
        }
        info!("Access token refreshed and stored");
        debug!("New access token expires at {:?}", refreshed.expiration_time);

        let access = refreshed.access_token.clone();
        *self.tokens.borrow_mut() = refreshed;
        op(self.api, &access).map_err(|retry| RetryError::RetryFailed { initial, retry })
    }
}
