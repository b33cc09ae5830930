//! Deterministic cache keys for list results
//!
//! ```text
//! gmail|user=<u>|ws=<ws>|mailbox=<mb>[|qsha=<hash>]|pageToken=<t>
//! gmail|user=<u>|ws=<ws>|mailbox=<mb>[|qsha=<hash>]|page=<n>
//! ```

use sha2::{Digest, Sha256};

const PROVIDER: &str = "gmail";
const UNKNOWN_WORKSPACE: &str = "unknown";
/// Bytes of the query digest kept in the key
const QUERY_HASH_BYTES: usize = 16;

/// Builder for list-cache keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListCacheKey {
    user_id: String,
    workspace_id: Option<String>,
    mailbox: Option<String>,
    query: Option<String>,
    page_token: Option<String>,
    page: Option<u32>,
}

impl ListCacheKey {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    #[must_use]
    pub fn mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = Some(mailbox.into());
        self
    }

    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Opaque continuation token; takes precedence over `page`
    #[must_use]
    pub fn page_token(mut self, token: impl Into<String>) -> Self {
        self.page_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Render the key
    #[must_use]
    pub fn build(&self) -> String {
        let query = non_empty(self.query.as_deref());
        let workspace = non_empty(self.workspace_id.as_deref()).unwrap_or(UNKNOWN_WORKSPACE);
        let mailbox = non_empty(self.mailbox.as_deref())
            .unwrap_or(if query.is_some() { "query" } else { "inbox" });

        let mut key = format!(
            "{PROVIDER}|user={}|ws={workspace}|mailbox={mailbox}",
            self.user_id
        );
        if let Some(query) = query {
            key.push_str("|qsha=");
            key.push_str(&query_hash(query));
        }
        match non_empty(self.page_token.as_deref()) {
            Some(token) => {
                key.push_str("|pageToken=");
                key.push_str(token);
            }
            None => {
                let page = self.page.filter(|p| *p > 0).unwrap_or(1);
                key.push_str(&format!("|page={page}"));
            }
        }
        key
    }
}

impl std::fmt::Display for ListCacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.build())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Short hex digest of a free-text query
#[must_use]
pub fn query_hash(query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    hex::encode(&digest[..QUERY_HASH_BYTES])
}
