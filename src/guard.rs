//! Request-level URL filtering: domain allow/block lists and the
//! private-network (SSRF) guard.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use url::{Host, Url};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Only http and https URLs are supported, got {0}.")]
    UnsupportedScheme(String),
    #[error("The URL has no hostname.")]
    MissingHost,
    #[error("Domain {0} is not on the allow-list.")]
    NotAllowed(String),
    #[error("Domain {0} is blocked.")]
    Blocked(String),
    #[error("Host {host} resolves to a non-public address ({address}).")]
    PrivateAddress { host: String, address: IpAddr },
    #[error("Host {host} could not be resolved.")]
    Unresolvable { host: String },
}

/// A URL that passed the domain classifier.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: Url,
    pub host: String,
    /// eTLD+1, absent for IP literals and bare public suffixes.
    pub registered_domain: Option<String>,
    pub ip_literal: Option<IpAddr>,
}

impl Target {
    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(443)
    }
}

/// Parses a raw URL, adding `https://` when the scheme is missing.
pub fn parse_target(raw: &str) -> Result<Target, GuardError> {
    let trimmed = raw.trim();
    let candidate = if has_scheme(trimmed) {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&candidate).map_err(|error| GuardError::InvalidUrl(error.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GuardError::UnsupportedScheme(url.scheme().to_string()));
    }

    let (host, ip_literal) = match url.host() {
        Some(Host::Domain(domain)) => (domain.trim_end_matches('.').to_ascii_lowercase(), None),
        Some(Host::Ipv4(address)) => (address.to_string(), Some(IpAddr::V4(address))),
        Some(Host::Ipv6(address)) => (address.to_string(), Some(IpAddr::V6(address))),
        None => return Err(GuardError::MissingHost),
    };
    if host.is_empty() {
        return Err(GuardError::MissingHost);
    }

    let registered_domain = if ip_literal.is_some() {
        None
    } else {
        psl::domain_str(&host).map(ToString::to_string)
    };

    Ok(Target {
        url,
        host,
        registered_domain,
        ip_literal,
    })
}

/// True when `value` starts with `scheme://`, not merely contains it.
fn has_scheme(value: &str) -> bool {
    value.split_once("://").is_some_and(|(scheme, _)| {
        scheme
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|character| character.is_ascii_alphanumeric() || matches!(character, '+' | '-' | '.'))
    })
}

fn is_domain_match(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Static allow/block lists.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    allowed: Vec<String>,
    blocked: Vec<String>,
}

impl DomainPolicy {
    pub fn new(allowed: Vec<String>, blocked: Vec<String>) -> Self {
        Self { allowed, blocked }
    }

    pub fn is_blocked(&self, target: &Target) -> bool {
        self.blocked
            .iter()
            .any(|entry| target.host.contains(entry.as_str()))
    }

    /// True only for an explicit allow-list entry, never for the empty-list
    /// "allow everything" case.
    pub fn is_explicitly_allowed(&self, target: &Target) -> bool {
        self.allowed.iter().any(|entry| {
            is_domain_match(&target.host, entry)
                || target
                    .registered_domain
                    .as_deref()
                    .is_some_and(|domain| is_domain_match(domain, entry))
        })
    }

    pub fn is_allowed(&self, target: &Target) -> bool {
        self.allowed.is_empty() || self.is_explicitly_allowed(target)
    }

    /// Parses `raw` and applies both lists. The block-list wins.
    pub fn classify(&self, raw: &str) -> Result<Target, GuardError> {
        let target = parse_target(raw)?;

        if self.is_blocked(&target) {
            return Err(GuardError::Blocked(target.host));
        }
        if !self.is_allowed(&target) {
            return Err(GuardError::NotAllowed(
                target.registered_domain.unwrap_or(target.host),
            ));
        }

        Ok(target)
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addresses = tokio::net::lookup_host((host, port)).await?;
        Ok(addresses.map(|address| address.ip()).collect())
    }
}

/// Rejects targets that resolve to loopback, private or reserved networks.
#[derive(Clone)]
pub struct NetworkGuard {
    resolver: Arc<dyn Resolver>,
    allow_unresolved_allowlisted: bool,
}

impl NetworkGuard {
    pub fn new(resolver: Arc<dyn Resolver>, allow_unresolved_allowlisted: bool) -> Self {
        Self {
            resolver,
            allow_unresolved_allowlisted,
        }
    }

    pub async fn check(&self, target: &Target, policy: &DomainPolicy) -> Result<(), GuardError> {
        if let Some(address) = target.ip_literal {
            return ensure_public(&target.host, address);
        }

        let addresses = match self.resolver.resolve(&target.host, target.port()).await {
            Ok(addresses) if !addresses.is_empty() => addresses,
            Ok(_) => return self.unresolved(target, policy, "no addresses"),
            Err(error) => return self.unresolved(target, policy, &error.to_string()),
        };

        for address in &addresses {
            ensure_public(&target.host, *address)?;
        }

        debug!("{} resolved to public addresses {:?}", target.host, addresses);
        Ok(())
    }

    fn unresolved(
        &self,
        target: &Target,
        policy: &DomainPolicy,
        reason: &str,
    ) -> Result<(), GuardError> {
        if self.allow_unresolved_allowlisted && policy.is_explicitly_allowed(target) {
            warn!(
                "Host {} did not resolve ({reason}); allowing because its domain is allow-listed",
                target.host
            );
            return Ok(());
        }

        debug!("Host {} did not resolve: {reason}", target.host);
        Err(GuardError::Unresolvable {
            host: target.host.clone(),
        })
    }
}

fn ensure_public(host: &str, address: IpAddr) -> Result<(), GuardError> {
    if is_forbidden_ip(address) {
        warn!("Rejected {host}: resolves to non-public address {address}");
        return Err(GuardError::PrivateAddress {
            host: host.to_string(),
            address,
        });
    }
    Ok(())
}

pub fn is_forbidden_ip(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => is_forbidden_ipv4(v4),
        IpAddr::V6(v6) => is_forbidden_ipv6(v6),
    }
}

fn is_forbidden_ipv4(address: Ipv4Addr) -> bool {
    let [a, b, c, _] = address.octets();
    address.is_unspecified()
        || address.is_loopback()
        || address.is_private()
        || address.is_link_local()
        || address.is_broadcast()
        || address.is_documentation()
        || address.is_multicast()
        // 0.0.0.0/8
        || a == 0
        // shared address space 100.64.0.0/10
        || (a == 100 && (64..128).contains(&b))
        // IETF protocol assignments 192.0.0.0/24
        || (a == 192 && b == 0 && c == 0)
        // benchmarking 198.18.0.0/15
        || (a == 198 && (b == 18 || b == 19))
        // reserved 240.0.0.0/4
        || a >= 240
}

fn is_forbidden_ipv6(address: Ipv6Addr) -> bool {
    if let Some(mapped) = address.to_ipv4_mapped() {
        return is_forbidden_ipv4(mapped);
    }

    let segments = address.segments();
    // deprecated IPv4-compatible ::a.b.c.d
    if segments[..6].iter().all(|segment| *segment == 0) && !address.is_loopback() {
        return address.is_unspecified() || is_forbidden_ipv4(embedded_ipv4(segments[6], segments[7]));
    }
    // NAT64 64:ff9b::/96
    if segments[0] == 0x64 && segments[1] == 0xff9b && segments[2..6].iter().all(|segment| *segment == 0) {
        return is_forbidden_ipv4(embedded_ipv4(segments[6], segments[7]));
    }
    // 6to4 2002::/16
    if segments[0] == 0x2002 && is_forbidden_ipv4(embedded_ipv4(segments[1], segments[2])) {
        return true;
    }
    // Teredo 2001:0::/32: server address, then the client address inverted
    if segments[0] == 0x2001
        && segments[1] == 0
        && (is_forbidden_ipv4(embedded_ipv4(segments[2], segments[3]))
            || is_forbidden_ipv4(embedded_ipv4(!segments[6], !segments[7])))
    {
        return true;
    }

    address.is_loopback()
        || address.is_unspecified()
        || address.is_multicast()
        || address.is_unique_local()
        || address.is_unicast_link_local()
        // documentation 2001:db8::/32
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
}

fn embedded_ipv4(high: u16, low: u16) -> Ipv4Addr {
    Ipv4Addr::new((high >> 8) as u8, high as u8, (low >> 8) as u8, low as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticResolver(HashMap<&'static str, Vec<IpAddr>>);

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn policy(allowed: &[&str], blocked: &[&str]) -> DomainPolicy {
        DomainPolicy::new(
            allowed.iter().map(|entry| entry.to_string()).collect(),
            blocked.iter().map(|entry| entry.to_string()).collect(),
        )
    }

    fn guard(entries: &[(&'static str, &str)], allow_unresolved: bool) -> NetworkGuard {
        let mut map: HashMap<&'static str, Vec<IpAddr>> = HashMap::new();
        for (host, address) in entries {
            map.entry(*host).or_default().push(address.parse().unwrap());
        }
        NetworkGuard::new(Arc::new(StaticResolver(map)), allow_unresolved)
    }

    #[test]
    fn adds_missing_scheme_and_extracts_registered_domain() {
        let target = parse_target("m.youtube.com/watch?v=abc").unwrap();
        assert_eq!(target.url.scheme(), "https");
        assert_eq!(target.host, "m.youtube.com");
        assert_eq!(target.registered_domain.as_deref(), Some("youtube.com"));

        let target = parse_target("https://news.bbc.co.uk/video").unwrap();
        assert_eq!(target.registered_domain.as_deref(), Some("bbc.co.uk"));
    }

    #[test]
    fn url_in_query_does_not_count_as_scheme() {
        let target = parse_target("youtube.com/r?u=https://example.org/x").unwrap();
        assert_eq!(target.url.scheme(), "https");
        assert_eq!(target.host, "youtube.com");
        assert_eq!(target.url.query(), Some("u=https://example.org/x"));

        let target = parse_target("http://youtube.com/r?u=ftp://example.org").unwrap();
        assert_eq!(target.url.scheme(), "http");
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            parse_target("file:///etc/passwd"),
            Err(GuardError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_target("ftp://example.com/a"),
            Err(GuardError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn allow_list_matches_host_and_subdomains_only() {
        let policy = policy(&["youtube.com"], &[]);
        assert!(policy.classify("https://youtube.com/watch?v=X").is_ok());
        assert!(policy.classify("https://music.youtube.com/watch?v=X").is_ok());
        assert!(matches!(
            policy.classify("https://notyoutube.com/watch?v=X"),
            Err(GuardError::NotAllowed(_))
        ));
        assert!(matches!(
            policy.classify("https://youtube.com.evil.net/"),
            Err(GuardError::NotAllowed(_))
        ));
    }

    #[test]
    fn block_list_uses_substring_and_wins_over_allow_list() {
        let policy = policy(&["example.com"], &["internal"]);
        assert!(matches!(
            policy.classify("https://internal.example.com/a"),
            Err(GuardError::Blocked(_))
        ));
        assert!(matches!(
            policy.classify("https://cdn-internal-3.example.com/a"),
            Err(GuardError::Blocked(_))
        ));
        assert!(policy.classify("https://www.example.com/a").is_ok());
    }

    #[test]
    fn empty_allow_list_admits_any_host() {
        let policy = policy(&[], &["localhost"]);
        assert!(policy.classify("https://anything.example.org/").is_ok());
        assert!(policy.classify("http://localhost:8080/").is_err());
    }

    #[test]
    fn forbidden_ranges() {
        for address in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "0.0.0.0",
            "100.64.0.1",
            "198.18.0.1",
            "240.0.0.1",
            "255.255.255.255",
            "::1",
            "::",
            "fc00::1",
            "fe80::1",
            "::ffff:127.0.0.1",
            "::ffff:10.0.0.1",
            "2001:db8::1",
        ] {
            assert!(is_forbidden_ip(address.parse().unwrap()), "{address}");
        }
    }

    #[test]
    fn ipv6_forms_embedding_ipv4_are_judged_by_the_ipv4() {
        for address in [
            // NAT64 of 10.0.0.1
            "64:ff9b::a00:1",
            // 6to4 of 127.0.0.1 and 192.168.1.1
            "2002:7f00:1::",
            "2002:c0a8:101::1",
            // Teredo, client 127.0.0.1 stored inverted
            "2001:0:4136:e378:8000:0:80ff:fffe",
            // Teredo, server in 10/8
            "2001:0:a00:1::f7f7:f7f7",
        ] {
            assert!(is_forbidden_ip(address.parse().unwrap()), "{address}");
        }

        for address in [
            "8.8.8.8",
            "142.250.185.78",
            "2607:f8b0:4005:80a::200e",
            "64:ff9b::808:808",
            "2002:808:808::1",
            "2001:0:4136:e378::f7f7:f7f7",
        ] {
            assert!(!is_forbidden_ip(address.parse().unwrap()), "{address}");
        }
    }

    #[tokio::test]
    async fn rejects_when_any_address_is_private() {
        let policy = policy(&["example.com"], &[]);
        let guard = guard(
            &[("cdn.example.com", "93.184.216.34"), ("cdn.example.com", "10.0.0.7")],
            false,
        );
        let target = policy.classify("https://cdn.example.com/v").unwrap();

        let error = guard.check(&target, &policy).await.unwrap_err();
        assert!(matches!(error, GuardError::PrivateAddress { .. }));
    }

    #[tokio::test]
    async fn ip_literals_skip_dns() {
        let policy = policy(&[], &[]);
        let guard = guard(&[], false);

        let target = policy.classify("http://192.168.0.10/video.mp4").unwrap();
        assert!(matches!(
            guard.check(&target, &policy).await,
            Err(GuardError::PrivateAddress { .. })
        ));

        let target = policy.classify("http://[::1]:8000/").unwrap();
        assert!(guard.check(&target, &policy).await.is_err());

        let target = policy.classify("http://8.8.8.8/").unwrap();
        assert!(guard.check(&target, &policy).await.is_ok());
    }

    #[tokio::test]
    async fn unresolvable_hosts_fail_closed_by_default() {
        let policy = policy(&["youtu.be"], &[]);
        let target = policy.classify("https://youtu.be/abc").unwrap();

        let strict = guard(&[], false);
        assert!(matches!(
            strict.check(&target, &policy).await,
            Err(GuardError::Unresolvable { .. })
        ));

        let lenient = guard(&[], true);
        assert!(lenient.check(&target, &policy).await.is_ok());
    }

    #[tokio::test]
    async fn carve_out_needs_an_explicit_allow_list_entry() {
        let policy = policy(&[], &[]);
        let target = policy.classify("https://short.example/abc").unwrap();
        let lenient = guard(&[], true);

        assert!(matches!(
            lenient.check(&target, &policy).await,
            Err(GuardError::Unresolvable { .. })
        ));
    }
}
