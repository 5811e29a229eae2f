//! Server configuration and the configuration file parser.
//!
//! The file format is a flat list of directives. Tokens are separated by
//! whitespace; `;`, `{` and `}` are tokens on their own; `#` at the start
//! of a token comments out the rest of the line.
//!
//! ```text
//! port 8080
//! htdocs_dir /srv/www
//! filename /srv/video/lobby.avi
//! alias /live { port cam; type stream; frame_rate fps }
//! cgi_handler cgi;
//! plugin /echo { library echo }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::{Result, ServerError};
use crate::protocol::{Alias, AliasKind, CgiHandler, VideoSelector};

pub const DEFAULT_PORT: u16 = 5555;

/// Username and password required for every request when configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// The `Authorization: Basic` token clients must present.
    pub fn basic_token(&self) -> String {
        BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password))
    }
}

/// A video source declared in the configuration, in serving order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSpec {
    /// An MJPEG AVI file played in a loop.
    Avi(PathBuf),
    /// A JPEG file kept up to date by an external grabber.
    Snapshot { path: PathBuf, max_fps: Option<u32> },
}

/// A built-in plugin mounted at a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub url: String,
    pub library: String,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_host: String,
    pub port: u16,
    /// Slots whose buffers stay allocated while free.
    pub min_connections: usize,
    /// Size of the connection table; further clients are turned away.
    pub max_connections: usize,
    /// Worker threads sharing the connection table.
    pub workers: usize,
    /// Disconnect clients silent for longer than this. Zero disables it.
    pub max_idle_time: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
    /// Longest a worker blocks when no connection has work pending.
    pub idle_poll: Duration,
    /// Longest a single chunk may wait for the client to accept it.
    pub send_timeout: Duration,
    /// Default client frame rate for video requests.
    pub frame_rate: u32,
    /// Default JPEG quality passed to capture sources.
    pub jpeg_quality: u8,
    /// Document root. Without one, only videos and plugins are served.
    pub htdocs_dir: Option<PathBuf>,
    pub index_file: String,
    pub credentials: Option<Credentials>,
    /// Largest frame payload served, in bytes.
    pub max_frame_size: u64,
    /// Bytes read and sent per chunk.
    pub chunk_size: usize,
    /// Chunks sent to one client before moving on to the next.
    pub chunks_per_tick: usize,
    pub aliases: Vec<Alias>,
    pub videos: Vec<VideoSpec>,
    pub plugins: Vec<PluginSpec>,
    pub cgi_handlers: Vec<CgiHandler>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            min_connections: 10,
            max_connections: 50,
            workers: 4,
            max_idle_time: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            idle_poll: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
            frame_rate: 30,
            jpeg_quality: 80,
            htdocs_dir: None,
            index_file: "index.html".to_string(),
            credentials: None,
            max_frame_size: 400_000,
            chunk_size: 1024,
            chunks_per_tick: 8,
            aliases: Vec::new(),
            videos: Vec::new(),
            plugins: Vec::new(),
            cgi_handlers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse configuration text on top of the defaults.
    pub fn parse(text: &str) -> Result<Self> {
        Parser::new(text).run()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// Clamp values that would leave the server unable to run.
    pub fn normalized(mut self) -> Self {
        self.max_connections = self.max_connections.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self.workers = self.workers.clamp(1, self.max_connections);
        self.chunk_size = self.chunk_size.max(1);
        self.chunks_per_tick = self.chunks_per_tick.max(1);
        self.jpeg_quality = self.jpeg_quality.min(100);
        if self.sweep_interval.is_zero() {
            self.sweep_interval = Duration::from_secs(1);
        }
        self
    }
}

#[derive(Debug)]
struct Token {
    text: String,
    line: usize,
}

impl Token {
    fn is(&self, keyword: &str) -> bool {
        self.text.eq_ignore_ascii_case(keyword)
    }

    fn is_punct(&self) -> bool {
        matches!(self.text.as_str(), ";" | "{" | "}")
    }
}

struct Tokenizer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl Iterator for Tokenizer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        let mut text = String::new();
        let mut line = self.line;
        while let Some(&c) = self.chars.peek() {
            match c {
                '#' if text.is_empty() => {
                    for c in self.chars.by_ref() {
                        if c == '\n' {
                            self.line += 1;
                            break;
                        }
                    }
                }
                ';' | '{' | '}' => {
                    if text.is_empty() {
                        self.chars.next();
                        return Some(Token {
                            text: c.to_string(),
                            line: self.line,
                        });
                    }
                    break;
                }
                c if c.is_whitespace() => {
                    self.chars.next();
                    if c == '\n' {
                        self.line += 1;
                    }
                    if !text.is_empty() {
                        break;
                    }
                }
                _ => {
                    if text.is_empty() {
                        line = self.line;
                    }
                    text.push(c);
                    self.chars.next();
                }
            }
        }
        (!text.is_empty()).then_some(Token { text, line })
    }
}

struct Parser<'a> {
    tokens: Tokenizer<'a>,
    line: usize,
    config: ServerConfig,
    username: Option<String>,
    password: Option<String>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            tokens: Tokenizer {
                chars: text.chars().peekable(),
                line: 1,
            },
            line: 1,
            config: ServerConfig::default(),
            username: None,
            password: None,
        }
    }

    fn run(mut self) -> Result<ServerConfig> {
        while let Some(token) = self.next() {
            let directive = token.text.to_ascii_lowercase();
            match directive.as_str() {
                ";" => {}
                "port" => self.config.port = self.number(&directive)?,
                "minconn" => self.config.min_connections = self.number(&directive)?,
                "maxconn" => self.config.max_connections = self.number(&directive)?,
                "max_idle_time" => {
                    self.config.max_idle_time = Duration::from_secs(self.number(&directive)?);
                }
                "frame_rate" => self.config.frame_rate = self.number(&directive)?,
                "jpeg_quality" => self.config.jpeg_quality = self.number(&directive)?,
                "htdocs_dir" => self.config.htdocs_dir = Some(PathBuf::from(self.value(&directive)?)),
                "index_file" => self.config.index_file = self.value(&directive)?,
                "username" => self.username = Some(self.value(&directive)?),
                "password" => self.password = Some(self.value(&directive)?),
                "filename" => {
                    let path = self.value(&directive)?;
                    self.config.videos.push(VideoSpec::Avi(PathBuf::from(path)));
                }
                "runas" => {
                    let account = self.value(&directive)?;
                    tracing::warn!(account, line = token.line, "runas is not supported, ignoring");
                }
                "alias" => self.alias()?,
                "capture" => self.capture()?,
                "plugin" => self.plugin()?,
                "cgi_handler" => self.cgi_handler()?,
                _ => {
                    return Err(error(token.line, format!("unknown directive `{}`", token.text)));
                }
            }
        }

        if self.username.is_some() || self.password.is_some() {
            self.config.credentials = Some(Credentials {
                username: self.username.unwrap_or_default(),
                password: self.password.unwrap_or_default(),
            });
        }
        Ok(self.config)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.next()?;
        self.line = token.line;
        Some(token)
    }

    /// Next token, which must be a plain word.
    fn value(&mut self, directive: &str) -> Result<String> {
        match self.next() {
            Some(token) if !token.is_punct() => Ok(token.text),
            Some(token) => Err(error(
                token.line,
                format!("`{directive}` expects a value, found `{}`", token.text),
            )),
            None => Err(error(self.line, format!("`{directive}` expects a value"))),
        }
    }

    fn number<T: FromStr>(&mut self, directive: &str) -> Result<T> {
        let text = self.value(directive)?;
        text.parse()
            .map_err(|_| error(self.line, format!("`{directive}` expects a number, found `{text}`")))
    }

    fn open_block(&mut self, directive: &str) -> Result<()> {
        match self.next() {
            Some(token) if token.text == "{" => Ok(()),
            _ => Err(error(self.line, format!("`{directive}` expects `{{`"))),
        }
    }

    /// Next setting name inside a block, or `None` at its closing brace.
    fn block_entry(&mut self, directive: &str) -> Result<Option<Token>> {
        loop {
            match self.next() {
                Some(token) if token.text == ";" => {}
                Some(token) if token.text == "}" => return Ok(None),
                Some(token) => return Ok(Some(token)),
                None => return Err(error(self.line, format!("unterminated `{directive}` block"))),
            }
        }
    }

    fn alias(&mut self) -> Result<()> {
        let url = self.value("alias")?;
        let mut alias = Alias::new(&url, AliasKind::Single);
        self.open_block("alias")?;
        while let Some(setting) = self.block_entry("alias")? {
            if setting.is("port") {
                let value = self.value("port")?;
                alias.video = match value.parse() {
                    Ok(index) => VideoSelector::Fixed(index),
                    Err(_) => VideoSelector::Param(value),
                };
            } else if setting.is("type") {
                let value = self.value("type")?;
                alias.kind = if value.eq_ignore_ascii_case("single") {
                    AliasKind::Single
                } else if value.eq_ignore_ascii_case("stream") {
                    AliasKind::Stream
                } else {
                    return Err(error(self.line, format!("unknown alias type `{value}`")));
                };
            } else if setting.is("size") {
                let value = self.value("size")?;
                alias.size_param.get_or_insert(value);
            } else if setting.is("comp") {
                let value = self.value("comp")?;
                alias.comp_param.get_or_insert(value);
            } else if setting.is("frame_rate") {
                let value = self.value("frame_rate")?;
                alias.frame_rate_param.get_or_insert(value);
            } else {
                return Err(error(setting.line, format!("unknown alias setting `{}`", setting.text)));
            }
        }
        self.config.aliases.push(alias);
        Ok(())
    }

    fn capture(&mut self) -> Result<()> {
        let path = PathBuf::from(self.value("capture")?);
        let mut max_fps = None;
        self.open_block("capture")?;
        while let Some(setting) = self.block_entry("capture")? {
            if setting.is("max_fps") {
                let fps: u32 = self.number("max_fps")?;
                max_fps = (fps > 0).then_some(fps);
            } else if setting.is("size") || setting.is("channel") || setting.is("format") {
                let value = self.value(&setting.text)?;
                tracing::debug!(setting = %setting.text, value, "device setting ignored for snapshot capture");
            } else {
                return Err(error(
                    setting.line,
                    format!("unknown capture setting `{}`", setting.text),
                ));
            }
        }
        self.config.videos.push(VideoSpec::Snapshot { path, max_fps });
        Ok(())
    }

    fn plugin(&mut self) -> Result<()> {
        let url = self.value("plugin")?;
        let mut library = None;
        self.open_block("plugin")?;
        while let Some(setting) = self.block_entry("plugin")? {
            if setting.is("library") {
                library = Some(self.value("library")?);
            } else {
                return Err(error(setting.line, format!("unknown plugin setting `{}`", setting.text)));
            }
        }
        let library = library.ok_or_else(|| error(self.line, format!("plugin `{url}` has no library")))?;
        self.config.plugins.push(PluginSpec { url, library });
        Ok(())
    }

    fn cgi_handler(&mut self) -> Result<()> {
        let extension = self.value("cgi_handler")?;
        let mut handler = CgiHandler {
            extension: extension.trim_start_matches('.').to_string(),
            application: None,
        };
        match self.next() {
            None => {}
            Some(token) if token.text == ";" => {}
            Some(token) if token.text == "{" => {
                while let Some(setting) = self.block_entry("cgi_handler")? {
                    if setting.is("application") {
                        handler.application = Some(PathBuf::from(self.value("application")?));
                    } else {
                        return Err(error(
                            setting.line,
                            format!("unknown cgi_handler setting `{}`", setting.text),
                        ));
                    }
                }
            }
            Some(token) => {
                return Err(error(
                    token.line,
                    format!("`cgi_handler` expects `;` or `{{`, found `{}`", token.text),
                ));
            }
        }
        self.config.cgi_handlers.push(handler);
        Ok(())
    }
}

fn error(line: usize, message: String) -> ServerError {
    ServerError::Config { line, message }
}
