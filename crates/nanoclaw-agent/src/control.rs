//! The session store as seen from the tool layer.

use crate::session::SessionStore;
use nanoclaw_core::{ChannelIdentity, NewSession, Result, SessionSummary};
use nanoclaw_tools::SessionControl;

#[async_trait::async_trait]
impl SessionControl for SessionStore {
    async fn create(
        &self,
        identity: &ChannelIdentity,
        params: NewSession,
    ) -> Result<SessionSummary> {
        SessionStore::create(self, identity, params).await
    }

    async fn switch(&self, identity: &ChannelIdentity, key: &str) -> Result<SessionSummary> {
        SessionStore::switch(self, identity, key).await
    }

    async fn list(&self, identity: &ChannelIdentity) -> Result<Vec<SessionSummary>> {
        Ok(SessionStore::list(self, identity).await)
    }

    async fn current(&self, identity: &ChannelIdentity) -> Result<Option<SessionSummary>> {
        Ok(SessionStore::current(self, identity).await)
    }

    async fn reset(&self, identity: &ChannelIdentity) -> Result<()> {
        SessionStore::reset(self, identity).await
    }
}
