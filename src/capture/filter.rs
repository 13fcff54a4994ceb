//! Display filters and the host include/exclude policy.

use super::entry::CaptureEntry;
use arc_swap::ArcSwap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodFilter {
    #[default]
    All,
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl MethodFilter {
    const CYCLE: [MethodFilter; 8] = [
        MethodFilter::All,
        MethodFilter::Get,
        MethodFilter::Post,
        MethodFilter::Put,
        MethodFilter::Patch,
        MethodFilter::Delete,
        MethodFilter::Head,
        MethodFilter::Options,
    ];

    pub fn next(self) -> Self {
        let index = Self::CYCLE.iter().position(|m| *m == self).unwrap_or(0);
        Self::CYCLE[(index + 1) % Self::CYCLE.len()]
    }

    pub fn label(self) -> &'static str {
        match self {
            MethodFilter::All => "ALL",
            MethodFilter::Get => "GET",
            MethodFilter::Post => "POST",
            MethodFilter::Put => "PUT",
            MethodFilter::Patch => "PATCH",
            MethodFilter::Delete => "DELETE",
            MethodFilter::Head => "HEAD",
            MethodFilter::Options => "OPTIONS",
        }
    }

    pub fn matches(self, method: &str) -> bool {
        self == MethodFilter::All || method.eq_ignore_ascii_case(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Success,
    Redirect,
    ClientError,
    ServerError,
}

impl StatusFilter {
    pub fn next(self) -> Self {
        match self {
            StatusFilter::All => StatusFilter::Success,
            StatusFilter::Success => StatusFilter::Redirect,
            StatusFilter::Redirect => StatusFilter::ClientError,
            StatusFilter::ClientError => StatusFilter::ServerError,
            StatusFilter::ServerError => StatusFilter::All,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StatusFilter::All => "ALL",
            StatusFilter::Success => "2xx",
            StatusFilter::Redirect => "3xx",
            StatusFilter::ClientError => "4xx",
            StatusFilter::ServerError => "5xx",
        }
    }

    /// Entries without a status (failed before a response) only match `All`.
    pub fn matches(self, status: Option<u16>) -> bool {
        let class = match self {
            StatusFilter::All => return true,
            StatusFilter::Success => 2,
            StatusFilter::Redirect => 3,
            StatusFilter::ClientError => 4,
            StatusFilter::ServerError => 5,
        };
        status.is_some_and(|s| s / 100 == class)
    }
}

/// Filters applied when listing captures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    pub method: MethodFilter,
    pub status: StatusFilter,
    pub include_hosts: Vec<String>,
    pub exclude_hosts: Vec<String>,
}

impl FilterState {
    pub fn with_hosts(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self {
            include_hosts: include,
            exclude_hosts: exclude,
            ..Default::default()
        }
    }

    pub fn cycle_method(&mut self) {
        self.method = self.method.next();
    }

    pub fn cycle_status(&mut self) {
        self.status = self.status.next();
    }

    /// Reset method and status filters; host patterns are capture policy and stay.
    pub fn clear(&mut self) {
        self.method = MethodFilter::All;
        self.status = StatusFilter::All;
    }

    pub fn is_active(&self) -> bool {
        self.method != MethodFilter::All || self.status != StatusFilter::All
    }

    pub fn host_patterns(&self) -> HostPatterns {
        HostPatterns::new(self.include_hosts.as_slice(), self.exclude_hosts.as_slice())
    }

    pub fn matches(&self, entry: &CaptureEntry) -> bool {
        self.matches_with(entry, &self.host_patterns())
    }

    /// Same as `matches` with host patterns normalized once by the caller.
    pub(crate) fn matches_with(&self, entry: &CaptureEntry, hosts: &HostPatterns) -> bool {
        self.method.matches(&entry.method)
            && self.status.matches(entry.status)
            && hosts.allows(&entry.host)
    }
}

/// Normalized include/exclude host patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPatterns {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl HostPatterns {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        let normalize = |patterns: &[S]| {
            patterns
                .iter()
                .map(|p| normalize_host(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect()
        };
        Self {
            include: normalize(include),
            exclude: normalize(exclude),
        }
    }

    pub fn include(&self) -> &[String] {
        &self.include
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    /// Exclude wins over include; an empty include list allows everything else.
    pub fn allows(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if self.exclude.iter().any(|p| pattern_matches(p, &host)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| pattern_matches(p, &host))
    }
}

/// Host policy consulted on every proxied connection.
///
/// Patterns can be swapped at runtime without blocking readers.
#[derive(Debug, Default)]
pub struct HostFilter {
    patterns: ArcSwap<HostPatterns>,
}

impl HostFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        Self {
            patterns: ArcSwap::from_pointee(HostPatterns::new(include, exclude)),
        }
    }

    pub fn allowed(&self, host: &str) -> bool {
        self.patterns.load().allows(host)
    }

    pub fn set_patterns<S: AsRef<str>>(&self, include: &[S], exclude: &[S]) {
        let patterns = HostPatterns::new(include, exclude);
        tracing::debug!(
            include = ?patterns.include(),
            exclude = ?patterns.exclude(),
            "Updated host filter"
        );
        self.patterns.store(Arc::new(patterns));
    }

    pub fn patterns(&self) -> Arc<HostPatterns> {
        self.patterns.load_full()
    }
}

/// `*.example.com` and `.example.com` match the domain and its subdomains;
/// anything else matches on substring.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    if let Some(domain) = pattern
        .strip_prefix("*.")
        .or_else(|| pattern.strip_prefix('.'))
    {
        return host == domain
            || host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.ends_with('.'));
    }
    host.contains(pattern)
}

fn normalize_host(host: &str) -> String {
    strip_port(host.trim())
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Drop a trailing `:port` and IPv6 brackets.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
