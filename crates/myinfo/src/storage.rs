use async_trait::async_trait;
use myinfo_common::store::{KeyValueStore, StoreError};
use smol_str::SmolStr;

use crate::state::AuthState;

pub const KEY_LAST_HASH: &str = "myinfo.last_config_hash";
pub const KEY_STATE: &str = "myinfo.auth_state";

/// Typed persistence for the MyInfo client: the hash of the last accepted
/// configuration and the serialized [`AuthState`].
#[async_trait]
pub trait MyInfoStorage: Send + Sync {
    async fn last_known_config_hash(&self) -> Result<Option<SmolStr>, StoreError>;

    async fn accept_configuration(&self, config_hash: &str) -> Result<(), StoreError>;

    /// Stored state, or an empty one when nothing (or nothing readable) is
    /// stored.
    async fn read_state(&self) -> Result<AuthState, StoreError>;

    /// Persist `state`; `None` removes the stored state.
    async fn write_state(&self, state: Option<&AuthState>) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: KeyValueStore> MyInfoStorage for S {
    async fn last_known_config_hash(&self) -> Result<Option<SmolStr>, StoreError> {
        Ok(self.get(KEY_LAST_HASH).await?.map(SmolStr::from))
    }

    async fn accept_configuration(&self, config_hash: &str) -> Result<(), StoreError> {
        self.set(KEY_LAST_HASH, config_hash.to_owned()).await
    }

    async fn read_state(&self) -> Result<AuthState, StoreError> {
        let Some(raw) = self.get(KEY_STATE).await? else {
            return Ok(AuthState::default());
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable auth state");
                Ok(AuthState::default())
            }
        }
    }

    async fn write_state(&self, state: Option<&AuthState>) -> Result<(), StoreError> {
        match state {
            Some(state) => self.set(KEY_STATE, serde_json::to_string(state)?).await,
            None => self.del(KEY_STATE).await,
        }
    }
}
