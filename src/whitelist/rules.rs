//! Firewall rule tuples and their text forms

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

use super::FirewallError;
use crate::models::WhitelistedAddress;

static DEST_PORT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"dpt:(\d+)").expect("valid regex"));

static OWNER_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\* user: (.+) \*/$").expect("valid regex"));

/// One accept rule in the whitelist chain
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleEntry {
    /// Single source address
    pub source: IpAddr,
    /// Destination port
    pub port: u16,
    /// Identity recorded in the rule comment
    pub owner: String,
}

impl RuleEntry {
    /// Create a rule
    pub fn new(source: IpAddr, port: u16, owner: impl Into<String>) -> Self {
        Self {
            source,
            port,
            owner: owner.into(),
        }
    }

    /// The rule permitting `address` to reach its instance
    #[must_use]
    pub fn from_address(address: &WhitelistedAddress) -> Self {
        Self::new(
            address.ip_address,
            address.instance.port,
            address.instance.user_email.clone(),
        )
    }

    /// Rule specification, without the chain, as passed to iptables
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            "tcp".to_string(),
            "-m".to_string(),
            "state".to_string(),
            "--state".to_string(),
            "NEW".to_string(),
            "-s".to_string(),
            self.source.to_string(),
            "--dport".to_string(),
            self.port.to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            format!("user: {}", self.owner),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }
}

impl fmt::Display for RuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> :{} ({})", self.source, self.port, self.owner)
    }
}

/// Mutations that take an existing rule set to the desired one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    /// Rules to append
    pub add: Vec<RuleEntry>,
    /// Rules to delete
    pub remove: Vec<RuleEntry>,
}

impl RuleDiff {
    /// Whether nothing needs to change
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Compute `desired − existing` and `existing − desired` over whole tuples.
///
/// A rule whose owner differs is a different rule, so it is replaced rather
/// than updated. Duplicate copies of an unwanted rule are all listed for
/// removal.
#[must_use]
pub fn diff(desired: &[RuleEntry], existing: &[RuleEntry]) -> RuleDiff {
    let desired_set: BTreeSet<&RuleEntry> = desired.iter().collect();
    let existing_set: BTreeSet<&RuleEntry> = existing.iter().collect();

    RuleDiff {
        add: desired_set
            .difference(&existing_set)
            .map(|r| (*r).clone())
            .collect(),
        remove: existing
            .iter()
            .filter(|r| !desired_set.contains(r))
            .cloned()
            .collect(),
    }
}

/// Parse one row of `iptables -L <chain> -n -v -x` output.
///
/// Rows look like
/// `0 0 ACCEPT tcp -- * * 1.2.3.4 0.0.0.0/0 state NEW tcp dpt:5555 /* user: a@x */`.
pub(crate) fn parse_listing_row(row: &str) -> Result<RuleEntry, FirewallError> {
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 10 {
        return Err(FirewallError::Parse(format!("too few fields in rule: '{row}'")));
    }

    let source = parse_source(fields[7])
        .ok_or_else(|| FirewallError::Parse(format!("invalid source address in rule: '{row}'")))?;
    let options = fields[9..].join(" ");
    let (port, owner) = parse_rule_options(&options)?;

    Ok(RuleEntry { source, port, owner })
}

/// Extract destination port and owner from a rule's options text
pub(crate) fn parse_rule_options(options: &str) -> Result<(u16, String), FirewallError> {
    let port = DEST_PORT
        .captures(options)
        .and_then(|c| c.get(1))
        .ok_or_else(|| {
            FirewallError::Parse(format!("failed to find destination port in rule options: '{options}'"))
        })?
        .as_str()
        .parse::<u16>()
        .map_err(|e| FirewallError::Parse(format!("failed to parse destination port in '{options}': {e}")))?;

    let owner = OWNER_COMMENT
        .captures(options.trim_end())
        .and_then(|c| c.get(1))
        .ok_or_else(|| FirewallError::Parse(format!("failed to find user email in rule options: '{options}'")))?
        .as_str()
        .to_string();

    Ok((port, owner))
}

/// Source column is a bare address or a full-length prefix
fn parse_source(field: &str) -> Option<IpAddr> {
    match field.split_once('/') {
        None => field.parse().ok(),
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.parse().ok()?;
            let full = if addr.is_ipv4() { "32" } else { "128" };
            (prefix == full).then_some(addr)
        }
    }
}
