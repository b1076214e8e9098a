use std::{borrow::Borrow, fmt, sync::Arc};

use crate::error::{Error, Result};

/// Immutable `scope/namespace/path` key of a live channel.
///
/// Cheap to clone; used as the registry key and handed to every collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(Arc<str>);

impl ChannelKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the key into the parts the orchestrator needs to find a plugin.
    pub fn address(&self) -> Result<ChannelAddress> {
        ChannelAddress::parse(self.as_str())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ChannelKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ChannelKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl serde::Serialize for ChannelKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Channel scopes that are backed by plugin streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelScope {
    /// `ds/<datasource_uid>/<path>`
    Datasource,
    /// `plugin/<plugin_id>/<path>`
    Plugin,
}

impl ChannelScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Datasource => "ds",
            Self::Plugin => "plugin",
        }
    }
}

/// Parsed form of a [`ChannelKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddress {
    pub scope: ChannelScope,
    pub namespace: String,
    /// Remainder after the namespace; may itself contain `/`.
    pub path: String,
}

impl ChannelAddress {
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.splitn(3, '/');
        let (Some(scope), Some(namespace), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::invalid_channel(key, "expected scope/namespace/path"));
        };
        if scope.is_empty() || namespace.is_empty() || path.is_empty() {
            return Err(Error::invalid_channel(key, "empty channel segment"));
        }
        let scope = match scope {
            "ds" => ChannelScope::Datasource,
            "plugin" => ChannelScope::Plugin,
            _ => return Err(Error::invalid_channel(key, "scope has no plugin streams")),
        };
        Ok(Self {
            scope,
            namespace: namespace.to_string(),
            path: path.to_string(),
        })
    }

    /// Plugin id to resolve; empty for datasource channels, where the
    /// resolver derives it from the datasource.
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        match self.scope {
            ChannelScope::Plugin => &self.namespace,
            ChannelScope::Datasource => "",
        }
    }

    /// Datasource uid to resolve; empty for plugin channels.
    #[must_use]
    pub fn datasource_uid(&self) -> &str {
        match self.scope {
            ChannelScope::Datasource => &self.namespace,
            ChannelScope::Plugin => "",
        }
    }
}
