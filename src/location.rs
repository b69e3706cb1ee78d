/// Source/destination resolution for rsync path arguments.
///
/// rsync accepts `[user@]host:path` for remote ends and a bare `path` for
/// local ones. The split mirrors a greedy `((.*@)?(.+):)?(.+)` match: the
/// user part ends at the rightmost `@` that still leaves a host, a colon
/// and a path behind it, and the host runs up to the rightmost usable
/// colon, so `host:/dir:with:colons` keeps everything after the first colon
/// in the host. Tokens without a usable colon are local.
use std::fmt;
use std::sync::LazyLock;

/// Fully-qualified name of this machine, resolved once per process.
static LOCAL_HOST: LazyLock<String> = LazyLock::new(|| {
    let short = short_hostname();
    let canonical = canonical_name(&short);
    choose_fqdn(short, canonical)
});

/// `gethostname(2)`, or "localhost" when it is unusable.
fn short_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => match name.into_string() {
            Ok(name) if !name.is_empty() => return name,
            Ok(_) => tracing::warn!("hostname is empty, using \"localhost\""),
            Err(raw) => tracing::warn!(?raw, "hostname is not valid UTF-8, using \"localhost\""),
        },
        Err(e) => tracing::warn!(error = %e, "failed to read hostname, using \"localhost\""),
    }
    "localhost".to_string()
}

/// Canonical name of `host` as reported by the resolver.
fn canonical_name(host: &str) -> Option<String> {
    let hints = dns_lookup::AddrInfoHints {
        flags: libc::AI_CANONNAME,
        address: 0,
        socktype: 0,
        protocol: 0,
    };
    let addrs = match dns_lookup::getaddrinfo(Some(host), None, Some(hints)) {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::debug!(host, error = ?e, "canonical name lookup failed");
            return None;
        }
    };
    addrs
        .filter_map(Result::ok)
        .find_map(|info| info.canonname)
        .filter(|name| !name.is_empty())
}

/// Prefer a dotted canonical name over the short host name.
fn choose_fqdn(short: String, canonical: Option<String>) -> String {
    match canonical {
        Some(name) if name.contains('.') => name,
        _ => short,
    }
}

/// The local host name used for paths that carry no host part.
pub fn local_host() -> &'static str {
    LOCAL_HOST.as_str()
}

/// One end of a transfer: the host it lives on and the path on that host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub host: String,
    pub path: String,
}

impl Location {
    /// Resolve an rsync path argument, using `local` when no host is given.
    pub fn resolve(token: &str, local: &str) -> Self {
        match split_remote(token) {
            Some((host, path)) => Location {
                host: host.to_string(),
                path: path.to_string(),
            },
            None => Location {
                host: local.to_string(),
                path: token.to_string(),
            },
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

/// Split `[user@]host:path` into `(host, path)`, or `None` for a local path.
fn split_remote(token: &str) -> Option<(&str, &str)> {
    for (at, _) in token.rmatch_indices('@') {
        if let Some(colon) = rightmost_separator(token, at + 2) {
            return Some((&token[at + 1..colon], &token[colon + 1..]));
        }
    }
    rightmost_separator(token, 1).map(|colon| (&token[..colon], &token[colon + 1..]))
}

/// Rightmost `:` at or after `min` that is followed by a non-empty path.
fn rightmost_separator(token: &str, min: usize) -> Option<usize> {
    token
        .rmatch_indices(':')
        .map(|(idx, _)| idx)
        .find(|&idx| idx + 1 < token.len())
        .filter(|&idx| idx >= min)
}
