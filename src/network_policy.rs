//! Network policy validator.
//!
//! Validates and normalizes a sandbox's `allowOut`/`denyOut` rule lists and
//! its `maskRequestHost` override before `create`/`update` commit it to the
//! orchestrator. Each rule is either a CIDR block (`ipnet`, the
//! crate the ecosystem reaches for here) or a domain pattern, optionally
//! wildcarded (`*.example.com`) or the catch-all `*`. Hostnames are
//! required to already be plain ASCII -- `idna::domain_to_ascii` is used as
//! a no-op check: if Unicode normalization would change the string, the
//! caller needed punycode and didn't send it.

use std::collections::HashSet;

use crate::error::{ApiError, ApiResult};
use crate::model::NetworkConfig;

#[derive(Debug, Clone, PartialEq)]
enum RuleKind {
    Cidr,
    Wildcard,
    Domain,
    CatchAll,
}

fn classify(entry: &str) -> ApiResult<RuleKind> {
    if entry.is_empty() {
        return Err(ApiError::invalid_input("network rule must not be empty"));
    }
    if entry == "*" {
        return Ok(RuleKind::CatchAll);
    }
    if entry.parse::<ipnet::IpNet>().is_ok() {
        return Ok(RuleKind::Cidr);
    }
    let (kind, domain) = match entry.strip_prefix("*.") {
        Some(rest) => (RuleKind::Wildcard, rest),
        None => (RuleKind::Domain, entry),
    };
    validate_ascii_domain(domain)?;
    Ok(kind)
}

fn validate_ascii_domain(domain: &str) -> ApiResult<()> {
    if domain.is_empty() || !domain.contains('.') {
        return Err(ApiError::invalid_input(format!("'{domain}' is not a valid domain")));
    }
    let ascii = idna::domain_to_ascii(domain).map_err(|_| ApiError::invalid_input(format!("'{domain}' is not a valid domain")))?;
    if ascii != domain.to_ascii_lowercase() {
        return Err(ApiError::invalid_input(format!(
            "'{domain}' requires IDNA/punycode encoding; send the ASCII form"
        )));
    }
    for label in domain.split('.') {
        if label.is_empty() || label.starts_with('-') || label.ends_with('-') {
            return Err(ApiError::invalid_input(format!("'{domain}' has an invalid label")));
        }
    }
    Ok(())
}

fn validate_and_dedup(list: &[String]) -> ApiResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in list {
        classify(entry)?;
        if seen.insert(entry.clone()) {
            out.push(entry.clone());
        }
    }
    Ok(out)
}

/// A deny rule that blocks all egress. Domain allow-lists only make sense on
/// top of one of these; CIDR allow-lists carry no such requirement.
fn is_block_all(entry: &str) -> bool {
    entry == "*" || entry == "0.0.0.0/0" || entry == "::/0"
}

/// The mask host may carry an explicit port (`example.com:8080`); only the
/// host part goes through domain validation.
fn validate_mask_request_host(host: &str) -> ApiResult<()> {
    let domain = match host.rsplit_once(':') {
        Some((domain, port)) => {
            if port.parse::<u16>().is_err() {
                return Err(ApiError::invalid_input(format!("'{host}' has an invalid port")));
            }
            domain
        }
        None => host,
    };
    validate_ascii_domain(domain)
}

/// `ValidateNetworkConfig(config)`. Returns a normalized copy (rules
/// deduplicated, order preserved) or the first validation failure.
pub fn validate(config: &NetworkConfig) -> ApiResult<NetworkConfig> {
    let allow_out = validate_and_dedup(&config.allow_out)?;
    let deny_out = validate_and_dedup(&config.deny_out)?;

    let has_domain_allow = allow_out
        .iter()
        .any(|e| matches!(classify(e).unwrap(), RuleKind::Domain | RuleKind::Wildcard));
    if has_domain_allow && !deny_out.iter().any(|e| is_block_all(e)) {
        return Err(ApiError::invalid_input(
            "domain rules in allow_out require a block-all deny_out entry (0.0.0.0/0)",
        ));
    }

    if let Some(host) = &config.mask_request_host {
        validate_mask_request_host(host)?;
    }

    Ok(NetworkConfig {
        allow_public_access: config.allow_public_access,
        mask_request_host: config.mask_request_host.clone(),
        allow_out,
        deny_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(allow_out: &[&str], deny_out: &[&str]) -> NetworkConfig {
        NetworkConfig {
            allow_public_access: true,
            mask_request_host: None,
            allow_out: allow_out.iter().map(|s| s.to_string()).collect(),
            deny_out: deny_out.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn accepts_cidr_and_wildcard_domain_with_catch_all_deny() {
        let out = validate(&cfg(&["10.0.0.0/8", "*.example.com"], &["*"])).unwrap();
        assert_eq!(out.allow_out.len(), 2);
    }

    #[test]
    fn accepts_block_all_cidr_as_the_deny_baseline() {
        let out = validate(&cfg(&["example.com"], &["0.0.0.0/0"])).unwrap();
        assert_eq!(out.allow_out, vec!["example.com".to_string()]);
    }

    #[test]
    fn rejects_domain_allow_without_block_all_deny() {
        let err = validate(&cfg(&["example.com"], &[])).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);

        // A narrower deny is not a substitute for the block-all baseline.
        let err = validate(&cfg(&["example.com"], &["10.0.0.0/8"])).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn cidr_only_allow_does_not_require_deny_baseline() {
        let out = validate(&cfg(&["10.0.0.0/8", "192.168.1.1/32"], &[])).unwrap();
        assert_eq!(out.allow_out.len(), 2);
    }

    #[test]
    fn catch_all_only_allow_does_not_require_deny_baseline() {
        let out = validate(&cfg(&["*"], &[])).unwrap();
        assert_eq!(out.allow_out, vec!["*".to_string()]);
    }

    #[test]
    fn dedups_repeated_rules() {
        let out = validate(&cfg(&["10.0.0.0/8", "10.0.0.0/8"], &["*"])).unwrap();
        assert_eq!(out.allow_out, vec!["10.0.0.0/8".to_string()]);
    }

    #[test]
    fn rejects_malformed_domain() {
        let err = validate(&cfg(&["not a domain"], &["*"])).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn mask_request_host_must_be_plain_ascii() {
        let mut c = cfg(&["*"], &[]);
        c.mask_request_host = Some("proxy.example.com".to_string());
        assert!(validate(&c).is_ok());

        let mut c2 = cfg(&["*"], &[]);
        c2.mask_request_host = Some("bücher.example.com".to_string());
        assert!(validate(&c2).is_err());
    }

    #[test]
    fn mask_request_host_may_carry_a_port() {
        let mut c = cfg(&["*"], &[]);
        c.mask_request_host = Some("example.com:8080".to_string());
        assert!(validate(&c).is_ok());

        let mut c2 = cfg(&["*"], &[]);
        c2.mask_request_host = Some("example.com:notaport".to_string());
        assert!(validate(&c2).is_err());
    }
}
