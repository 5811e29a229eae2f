//! Maps a request target to the resource that will answer it.
//!
//! Resolution order:
//!
//! 1. `/N` with an all-digit `N`: video `N`, single frame.
//! 2. Aliases, by URL prefix, in configuration order.
//! 3. Plugins, by URL prefix.
//! 4. A file under the document root (or a CGI script, by extension).

use std::path::PathBuf;

use crate::config::ServerConfig;
use crate::media::{VideoRegistry, mime};
use crate::plugin::PluginRegistry;

use super::request::{is_safe_path, query_value, split_query, url_decode};

/// How an alias delivers its video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasKind {
    /// One JPEG per request.
    Single,
    /// An endless `multipart/x-mixed-replace` stream.
    Stream,
}

/// Which video an alias serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSelector {
    /// Always the video at this zero-based index.
    Fixed(usize),
    /// The one-based index carried in this query parameter; video 0 when
    /// the parameter is absent.
    Param(String),
}

/// A configured URL that serves a video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub url: String,
    pub kind: AliasKind,
    pub video: VideoSelector,
    /// Query parameter carrying a requested image size. Accepted for
    /// compatibility; sources deliver their native size.
    pub size_param: Option<String>,
    /// Query parameter carrying the JPEG quality for capture sources.
    pub comp_param: Option<String>,
    /// Query parameter carrying the client's frame rate.
    pub frame_rate_param: Option<String>,
}

impl Alias {
    pub fn new(url: &str, kind: AliasKind) -> Self {
        Self {
            url: url.to_string(),
            kind,
            video: VideoSelector::Fixed(0),
            size_param: None,
            comp_param: None,
            frame_rate_param: None,
        }
    }
}

/// Runs files with `extension` as CGI scripts, optionally through an
/// interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiHandler {
    pub extension: String,
    pub application: Option<PathBuf>,
}

/// What is being served, and how its header is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// One complete response with `Content-Length`.
    Single,
    /// Multipart stream; the envelope has not been sent yet.
    MultipartFirst,
    /// Multipart stream; each frame only needs a part header.
    MultipartFrame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    NotFound,
    BadRequest,
    File(PathBuf),
    Cgi {
        script: PathBuf,
        application: Option<PathBuf>,
        query: String,
    },
    Plugin {
        index: usize,
        query: String,
    },
    Video(usize),
}

/// Outcome of resolving a request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub resource: Resource,
    pub mode: RequestMode,
    pub content_type: &'static str,
    /// Client frame rate requested through an alias parameter.
    pub frame_rate: Option<u32>,
    /// JPEG quality requested through an alias parameter.
    pub jpeg_quality: Option<u8>,
}

impl Route {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            mode: RequestMode::Single,
            content_type: mime::HTML,
            frame_rate: None,
            jpeg_quality: None,
        }
    }

    pub fn not_found() -> Self {
        Self::new(Resource::NotFound)
    }

    fn video(index: usize, mode: RequestMode) -> Self {
        Self {
            mode,
            content_type: mime::JPEG,
            ..Self::new(Resource::Video(index))
        }
    }
}

/// Resolves request targets against aliases, plugins and the document root.
#[derive(Clone)]
pub struct Dispatcher {
    aliases: Vec<Alias>,
    cgi_handlers: Vec<CgiHandler>,
    htdocs: Option<PathBuf>,
    index_file: String,
    videos: VideoRegistry,
    plugins: PluginRegistry,
}

impl Dispatcher {
    pub fn new(config: &ServerConfig, videos: VideoRegistry, plugins: PluginRegistry) -> Self {
        Self {
            aliases: config.aliases.clone(),
            cgi_handlers: config.cgi_handlers.clone(),
            htdocs: config.htdocs_dir.clone(),
            index_file: config.index_file.clone(),
            videos,
            plugins,
        }
    }

    pub fn resolve(&self, target: &str) -> Route {
        let (path, query) = split_query(target);

        if let Some(digits) = path.strip_prefix('/')
            && !digits.is_empty()
            && digits.bytes().all(|b| b.is_ascii_digit())
        {
            return match digits.parse::<usize>() {
                Ok(index) if index < self.videos.len() => Route::video(index, RequestMode::Single),
                _ => Route::not_found(),
            };
        }

        if let Some(alias) = self.aliases.iter().find(|a| target.starts_with(a.url.as_str())) {
            return self.resolve_alias(alias, query);
        }

        if let Some((index, query)) = self.plugins.resolve(target) {
            return Route::new(Resource::Plugin {
                index,
                query: query.to_string(),
            });
        }

        self.resolve_file(path, query)
    }

    fn resolve_alias(&self, alias: &Alias, query: &str) -> Route {
        let index = match &alias.video {
            VideoSelector::Fixed(index) => Some(*index),
            VideoSelector::Param(name) => match query_value(query, name) {
                None => Some(0),
                Some(value) => value.parse::<usize>().ok().and_then(|n| n.checked_sub(1)),
            },
        };
        let Some(index) = index.filter(|&i| i < self.videos.len()) else {
            return Route::not_found();
        };

        let mode = match alias.kind {
            AliasKind::Single => RequestMode::Single,
            AliasKind::Stream => RequestMode::MultipartFirst,
        };
        let param = |name: &Option<String>| {
            name.as_deref()
                .and_then(|name| query_value(query, name))
                .and_then(|value| value.parse::<u32>().ok())
        };
        Route {
            frame_rate: param(&alias.frame_rate_param),
            jpeg_quality: param(&alias.comp_param).map(|q| q.min(100) as u8),
            ..Route::video(index, mode)
        }
    }

    fn resolve_file(&self, path: &str, query: &str) -> Route {
        let Some(root) = &self.htdocs else {
            return Route::not_found();
        };
        if path.is_empty() || !is_safe_path(path) {
            return Route::not_found();
        }
        let Some(decoded) = url_decode(path).filter(|p| is_safe_path(p)) else {
            return Route::not_found();
        };

        let mut relative = decoded.trim_start_matches('/').to_string();
        if relative.is_empty() || relative.ends_with('/') {
            relative.push_str(&self.index_file);
        }
        let full = root.join(&relative);

        if let Some(ext) = mime::extension(&relative)
            && let Some(handler) = self
                .cgi_handlers
                .iter()
                .find(|h| h.extension.eq_ignore_ascii_case(ext))
        {
            return Route::new(Resource::Cgi {
                script: full,
                application: handler.application.clone(),
                query: query.to_string(),
            });
        }

        Route {
            content_type: mime::from_path(&relative),
            ..Route::new(Resource::File(full))
        }
    }
}
