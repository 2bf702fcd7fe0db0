//! URL mounts of a virtual host.

use std::fmt;
use std::path::PathBuf;

use crate::config::MountConfig;
use crate::error::ContextError;

/// Where requests under a mountpoint are served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Static files below a directory.
    File(PathBuf),
    /// A CGI program run once per request.
    Cgi(PathBuf),
    /// `301` to the target URL with the path remainder appended.
    Redirect(String),
    /// A registered protocol handler, by name.
    Callback(String),
}

impl Origin {
    /// Parses an lws style origin URL.
    pub fn parse(origin: &str) -> Result<Self, ContextError> {
        if let Some(path) = origin.strip_prefix("file://") {
            return non_empty(origin, path).map(|path| Origin::File(PathBuf::from(path)));
        }
        if let Some(path) = origin.strip_prefix("cgi://") {
            return non_empty(origin, path).map(|path| Origin::Cgi(PathBuf::from(path)));
        }
        if let Some(target) = origin.strip_prefix('>') {
            if target.starts_with("http://") || target.starts_with("https://") {
                return Ok(Origin::Redirect(target.to_string()));
            }
        }
        if let Some(name) = origin.strip_prefix("callback://") {
            return non_empty(origin, name).map(|name| Origin::Callback(name.to_string()));
        }
        Err(ContextError::config(format!("unsupported mount origin {origin:?}")))
    }

    /// Short name of the origin kind as shown in the diagnostic snapshot.
    pub fn kind(&self) -> &'static str {
        match self {
            Origin::File(_) => "file",
            Origin::Cgi(_) => "cgi",
            Origin::Redirect(_) => "redirect",
            Origin::Callback(_) => "callback",
        }
    }
}

fn non_empty<'a>(origin: &str, rest: &'a str) -> Result<&'a str, ContextError> {
    if rest.is_empty() { Err(ContextError::config(format!("mount origin {origin:?} has no target"))) } else { Ok(rest) }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::File(path) => write!(f, "file://{}", path.display()),
            Origin::Cgi(path) => write!(f, "cgi://{}", path.display()),
            Origin::Redirect(target) => write!(f, ">{target}"),
            Origin::Callback(name) => write!(f, "callback://{name}"),
        }
    }
}

/// `Cache-Control` parameters applied to file responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    pub max_age: u32,
    pub reusable: bool,
    pub revalidate: bool,
    pub intermediaries: bool,
}

impl CachePolicy {
    /// The `Cache-Control` value, `None` when nothing was configured.
    pub fn header_value(&self) -> Option<String> {
        if *self == CachePolicy::default() {
            return None;
        }
        if !self.reusable {
            return Some("no-store".to_string());
        }

        let scope = if self.intermediaries { "public" } else { "private" };
        let mut value = format!("{scope}, max-age={}", self.max_age);
        if self.revalidate {
            value.push_str(", must-revalidate");
        }
        Some(value)
    }
}

/// One mountpoint to origin binding; immutable once the virtual host is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    mountpoint: String,
    origin: Origin,
    default_document: Option<String>,
    cache: CachePolicy,
}

impl Mount {
    pub fn new<S: Into<String>>(mountpoint: S, origin: Origin) -> Self {
        let mut mountpoint = mountpoint.into();
        while mountpoint.len() > 1 && mountpoint.ends_with('/') {
            mountpoint.pop();
        }
        if !mountpoint.starts_with('/') {
            mountpoint.insert(0, '/');
        }
        Self { mountpoint, origin, default_document: None, cache: CachePolicy::default() }
    }

    pub fn parse(mountpoint: &str, origin: &str) -> Result<Self, ContextError> {
        Ok(Self::new(mountpoint, Origin::parse(origin)?))
    }

    pub fn from_config(config: &MountConfig) -> Result<Self, ContextError> {
        let cache = CachePolicy {
            max_age: config.cache_max_age,
            reusable: config.cache_reusable,
            revalidate: config.cache_revalidate,
            intermediaries: config.cache_intermediaries,
        };
        let mut mount = Self::parse(&config.mountpoint, &config.origin)?.with_cache(cache);
        mount.default_document = config.default_document.clone();
        Ok(mount)
    }

    pub fn with_default_document<S: Into<String>>(mut self, document: S) -> Self {
        self.default_document = Some(document.into());
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn default_document(&self) -> Option<&str> {
        self.default_document.as_deref()
    }

    pub fn cache(&self) -> &CachePolicy {
        &self.cache
    }

    /// The part of `path` below this mountpoint, if the mountpoint covers it.
    ///
    /// `/api` covers `/api` and `/api/users` but not `/apis`.
    pub fn strip<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.mountpoint == "/" {
            return Some(path);
        }
        let rest = path.strip_prefix(self.mountpoint.as_str())?;
        if rest.is_empty() || rest.starts_with('/') { Some(rest) } else { None }
    }
}

/// Ordered mount list of one virtual host.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub fn new(mounts: Vec<Mount>) -> Self {
        Self { mounts }
    }

    /// Longest covering mountpoint; on equal length the first registered wins.
    pub fn resolve<'a>(&self, path: &'a str) -> Option<(&Mount, &'a str)> {
        let mut best: Option<(&Mount, &'a str)> = None;
        for mount in &self.mounts {
            if let Some(rest) = mount.strip(path) {
                match best {
                    Some((current, _)) if current.mountpoint.len() >= mount.mountpoint.len() => {}
                    _ => best = Some((mount, rest)),
                }
            }
        }
        best
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}
