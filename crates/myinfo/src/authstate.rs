use myinfo_common::store::StoreError;
use tokio::sync::RwLock;

use crate::state::{AuthState, AuthorizationError, AuthorizationResponse, TokenResponse};
use crate::storage::MyInfoStorage;

/// Owns the single in-memory [`AuthState`], loading it from storage on first
/// use and writing it back on every change.
pub struct AuthStateManager<S> {
    storage: S,
    current: RwLock<Option<AuthState>>,
}

impl<S: MyInfoStorage> AuthStateManager<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            current: RwLock::new(None),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Snapshot of the current state.
    pub async fn current(&self) -> Result<AuthState, StoreError> {
        if let Some(state) = self.current.read().await.as_ref() {
            return Ok(state.clone());
        }
        let mut guard = self.current.write().await;
        // another task may have loaded it while we waited for the lock
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }
        let state = self.storage.read_state().await?;
        *guard = Some(state.clone());
        Ok(state)
    }

    pub async fn replace(&self, state: AuthState) -> Result<AuthState, StoreError> {
        let mut guard = self.current.write().await;
        self.storage.write_state(Some(&state)).await?;
        *guard = Some(state.clone());
        Ok(state)
    }

    pub async fn update_after_authorization(
        &self,
        outcome: Result<AuthorizationResponse, AuthorizationError>,
    ) -> Result<AuthState, StoreError> {
        self.modify(|state| state.update_after_authorization(outcome))
            .await
    }

    pub async fn update_after_token_response(
        &self,
        outcome: Result<TokenResponse, AuthorizationError>,
    ) -> Result<AuthState, StoreError> {
        self.modify(|state| state.update_after_token_response(outcome))
            .await
    }

    /// Discard tokens and errors, keeping the service configuration.
    pub async fn logout(&self) -> Result<AuthState, StoreError> {
        self.modify(|state| *state = state.cleared()).await
    }

    async fn modify(&self, f: impl FnOnce(&mut AuthState)) -> Result<AuthState, StoreError> {
        let mut guard = self.current.write().await;
        let mut state = match guard.as_ref() {
            Some(state) => state.clone(),
            None => self.storage.read_state().await?,
        };
        f(&mut state);
        // memory only follows a successful write
        self.storage.write_state(Some(&state)).await?;
        *guard = Some(state.clone());
        Ok(state)
    }
}
