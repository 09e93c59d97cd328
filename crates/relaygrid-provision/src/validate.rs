//! Identity checks run before anything is written.

use std::net::IpAddr;

use regex::Regex;
use relaygrid_core::{FleetError, FleetResult};
use relaygrid_registry::Registry;

const NAME_PATTERN: &str = r"^[A-Za-z0-9_-]{1,63}$";
const LABEL_PATTERN: &str = r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$";
const MAX_DOMAIN_LEN: usize = 253;

/// Validate a node's name, address and domain, and check the name and
/// domain are not taken. Returns the parsed address.
pub fn validate_identity(
    registry: &Registry,
    name: &str,
    address: &str,
    domain: &str,
) -> FleetResult<IpAddr> {
    validate_name(name)?;
    let address = parse_address(address)?;
    validate_domain(domain)?;

    if registry.get(name)?.is_some() {
        return Err(FleetError::DuplicateName(name.to_string()));
    }
    let domain_lower = domain.to_ascii_lowercase();
    if let Some(other) = registry
        .list()?
        .into_iter()
        .find(|r| !r.state.is_removed() && r.domain.to_ascii_lowercase() == domain_lower)
    {
        return Err(FleetError::Validation(format!(
            "domain {domain} is already routed to node {}",
            other.name
        )));
    }
    Ok(address)
}

pub fn validate_name(name: &str) -> FleetResult<()> {
    let re = compile(NAME_PATTERN)?;
    if !re.is_match(name) {
        return Err(FleetError::Validation(format!(
            "invalid node name {name:?}: use 1-63 letters, digits, '-' or '_'"
        )));
    }
    Ok(())
}

pub fn parse_address(address: &str) -> FleetResult<IpAddr> {
    address
        .trim()
        .parse()
        .map_err(|_| FleetError::Validation(format!("invalid IP address {address:?}")))
}

pub fn validate_domain(domain: &str) -> FleetResult<()> {
    let invalid = |why: &str| FleetError::Validation(format!("invalid domain {domain:?}: {why}"));

    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("length must be 1-253"));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("needs at least two labels"));
    }
    let re = compile(LABEL_PATTERN)?;
    if let Some(label) = labels.iter().find(|l| !re.is_match(l)) {
        return Err(invalid(&format!("bad label {label:?}")));
    }
    if labels
        .last()
        .is_some_and(|tld| tld.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(invalid("top-level label is numeric"));
    }
    Ok(())
}

fn compile(pattern: &str) -> FleetResult<Regex> {
    Regex::new(pattern).map_err(|e| FleetError::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_core::Secret;
    use relaygrid_registry::{NodeRecord, SshAccess, SshCredential, WriteMode};

    fn registry_with(name: &str, domain: &str) -> Registry {
        let registry = Registry::open_in_memory().unwrap();
        let record = NodeRecord::pending(
            name,
            "10.0.0.1".parse().unwrap(),
            domain,
            443,
            SshAccess::new(
                "root",
                22,
                SshCredential::Password {
                    password: Secret::new("pw"),
                },
            ),
        );
        registry.upsert(&record, WriteMode::Create).unwrap();
        registry
    }

    #[test]
    fn names() {
        assert!(validate_name("node_b-2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("dots.are.out").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn addresses() {
        assert!(parse_address("10.0.0.5").is_ok());
        assert!(parse_address("fd00::5").is_ok());
        assert!(parse_address("10.0.0.256").is_err());
        assert!(parse_address("node.example.com").is_err());
    }

    #[test]
    fn domains() {
        assert!(validate_domain("c.example.com").is_ok());
        assert!(validate_domain("xn--bcher-kva.example").is_ok());
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("-bad.example.com").is_err());
        assert!(validate_domain("a..example.com").is_err());
        assert!(validate_domain("10.0.0.5").is_err());
        assert!(validate_domain(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn taken_name_is_duplicate() {
        let registry = registry_with("b", "b.example.com");
        let err = validate_identity(&registry, "b", "10.0.0.9", "other.example.com").unwrap_err();
        assert!(matches!(err, FleetError::DuplicateName(name) if name == "b"));
    }

    #[test]
    fn taken_domain_is_rejected_case_insensitively() {
        let registry = registry_with("b", "b.example.com");
        let err = validate_identity(&registry, "c", "10.0.0.9", "B.Example.com").unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn fresh_identity_passes() {
        let registry = registry_with("b", "b.example.com");
        let address = validate_identity(&registry, "c", "10.0.0.5", "c.example.com").unwrap();
        assert_eq!(address.to_string(), "10.0.0.5");
    }
}
