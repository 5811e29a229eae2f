//! In-process request handlers mounted at URL prefixes.
//!
//! A plugin answers GET (and, for plugin URLs only, POST) requests with a
//! complete body. Plugins are registered in code through
//! [`Server::add_plugin`](crate::Server::add_plugin), or named in the
//! configuration file when they are built in.

use std::sync::Arc;

use parking_lot::RwLock;

/// A plugin's answer, sent back as a keep-alive response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginReply {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl PluginReply {
    pub fn new(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.to_string(),
            body: body.into(),
        }
    }
}

/// Handler invoked for requests whose target starts with the plugin's URL.
///
/// `query` is the text after `?` (or after the URL prefix when there is
/// no `?`). Calls may come from any worker thread.
pub trait Plugin: Send + Sync {
    fn get(&self, query: &str) -> PluginReply;

    fn post(&self, query: &str, body: &[u8]) -> PluginReply;
}

/// Reports back the query string and any posted body.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoPlugin;

impl Plugin for EchoPlugin {
    fn get(&self, query: &str) -> PluginReply {
        PluginReply::new("text/html", format!("Get Querystring is {query}"))
    }

    fn post(&self, query: &str, body: &[u8]) -> PluginReply {
        PluginReply::new(
            "text/html",
            format!(
                "Post Querystring is {query}\nPost data is {}",
                String::from_utf8_lossy(body)
            ),
        )
    }
}

/// Look up a plugin compiled into the server by name.
pub fn builtin(name: &str) -> Option<Arc<dyn Plugin>> {
    match name {
        "echo" => Some(Arc::new(EchoPlugin)),
        _ => None,
    }
}

/// Plugins in registration order, shared by every worker.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<RwLock<Vec<(String, Arc<dyn Plugin>)>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `plugin` at `url` and return its index.
    pub fn add(&self, url: &str, plugin: Arc<dyn Plugin>) -> usize {
        let mut plugins = self.plugins.write();
        plugins.push((url.to_string(), plugin));
        tracing::info!(url, "plugin registered");
        plugins.len() - 1
    }

    /// First plugin whose URL prefixes `target`, with the query it should see.
    pub fn resolve<'a>(&self, target: &'a str) -> Option<(usize, &'a str)> {
        let plugins = self.plugins.read();
        plugins.iter().enumerate().find_map(|(index, (url, _))| {
            let rest = target.strip_prefix(url.as_str())?;
            Some((index, rest.strip_prefix('?').unwrap_or(rest)))
        })
    }

    pub fn get(&self, index: usize) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().get(index).map(|(_, plugin)| plugin.clone())
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_replies() {
        let reply = EchoPlugin.get("user=1&name=x");
        assert_eq!(reply.content_type, "text/html");
        assert_eq!(reply.body, b"Get Querystring is user=1&name=x");

        let reply = EchoPlugin.post("a=b", b"payload");
        assert_eq!(reply.body, b"Post Querystring is a=b\nPost data is payload");
    }

    #[test]
    fn resolve_by_prefix() {
        let registry = PluginRegistry::new();
        registry.add("/echo", builtin("echo").unwrap());
        registry.add("/status", Arc::new(EchoPlugin));

        assert_eq!(registry.resolve("/echo?x=1"), Some((0, "x=1")));
        assert_eq!(registry.resolve("/echo"), Some((0, "")));
        assert_eq!(registry.resolve("/status/now"), Some((1, "/now")));
        assert_eq!(registry.resolve("/other"), None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_builtin() {
        assert!(builtin("missing").is_none());
    }
}
