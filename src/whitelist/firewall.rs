//! Host firewall control
//!
//! The reconciler only sees [`Firewall`]; [`IptablesFirewall`] is the
//! iptables backend. Every command runs with `-w` so that concurrent
//! iptables users wait for the xtables lock instead of failing.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use super::rules::{RuleEntry, parse_listing_row};
use crate::config::WhitelistConfig;

/// Table holding the whitelist chain
const TABLE: &str = "filter";

/// iptables exit status meaning "no such rule" for `-C`
const RULE_MISSING_STATUS: i32 = 1;

/// Firewall errors
#[derive(Debug, Error)]
pub enum FirewallError {
    /// The command could not be started
    #[error("failed to run {command}: {source}")]
    Spawn {
        /// Command line
        command: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The command did not finish in time
    #[error("{command} timed out after {timeout:?}")]
    Timeout {
        /// Command line
        command: String,
        /// Limit that was hit
        timeout: Duration,
    },

    /// The command exited unsuccessfully
    #[error("{command} exited with status {status:?}: {stderr}")]
    Failed {
        /// Command line
        command: String,
        /// Exit code, if any
        status: Option<i32>,
        /// Captured stderr
        stderr: String,
    },

    /// Output could not be understood
    #[error("failed to parse firewall state: {0}")]
    Parse(String),
}

/// Control surface of the host firewall, scoped to one chain
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Create the chain if it does not exist
    async fn ensure_chain(&self) -> Result<(), FirewallError>;

    /// Every rule currently in the chain.
    ///
    /// Fails if any single rule cannot be parsed.
    async fn list_rules(&self) -> Result<Vec<RuleEntry>, FirewallError>;

    /// Append `rule` unless an identical rule is already present
    async fn append_rule(&self, rule: &RuleEntry) -> Result<(), FirewallError>;

    /// Delete one copy of `rule`
    async fn delete_rule(&self, rule: &RuleEntry) -> Result<(), FirewallError>;

    /// Whether rules for `source` can be expressed in this firewall
    fn accepts(&self, _source: IpAddr) -> bool {
        true
    }
}

/// Output of a finished command
struct CommandOutput {
    status: Option<i32>,
    stdout: String,
    stderr: String,
}

/// iptables-backed firewall
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    program: String,
    chain: String,
    timeout: Duration,
}

impl IptablesFirewall {
    /// Create a firewall managing `chain` with the given binary
    pub fn new(program: impl Into<String>, chain: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            chain: chain.into(),
            timeout,
        }
    }

    /// Create a firewall from configuration
    #[must_use]
    pub fn from_config(config: &WhitelistConfig) -> Self {
        Self::new(&config.iptables_path, &config.chain_name, config.command_timeout)
    }

    /// Chain this firewall manages
    #[must_use]
    pub fn chain(&self) -> &str {
        &self.chain
    }

    async fn run(&self, args: &[String]) -> Result<CommandOutput, FirewallError> {
        let command = format!("{} {}", self.program, args.join(" "));
        debug!(command = %command, "Running firewall command");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .arg("-w")
                .args(["-t", TABLE])
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| FirewallError::Timeout {
            command: command.clone(),
            timeout: self.timeout,
        })?
        .map_err(|source| FirewallError::Spawn {
            command: command.clone(),
            source,
        })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }

    async fn run_checked(&self, args: &[String]) -> Result<String, FirewallError> {
        let output = self.run(args).await?;
        if output.status == Some(0) {
            Ok(output.stdout)
        } else {
            Err(FirewallError::Failed {
                command: format!("{} {}", self.program, args.join(" ")),
                status: output.status,
                stderr: output.stderr,
            })
        }
    }

    fn rule_command(&self, flag: &str, rule: &RuleEntry) -> Vec<String> {
        let mut args = vec![flag.to_string(), self.chain.clone()];
        args.extend(rule.to_args());
        args
    }

    async fn rule_exists(&self, rule: &RuleEntry) -> Result<bool, FirewallError> {
        let args = self.rule_command("-C", rule);
        let output = self.run(&args).await?;
        match output.status {
            Some(0) => Ok(true),
            Some(RULE_MISSING_STATUS) => Ok(false),
            status => Err(FirewallError::Failed {
                command: format!("{} {}", self.program, args.join(" ")),
                status,
                stderr: output.stderr,
            }),
        }
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    fn accepts(&self, source: IpAddr) -> bool {
        source.is_ipv4()
    }

    async fn ensure_chain(&self) -> Result<(), FirewallError> {
        let listing = self.run_checked(&["-S".to_string()]).await?;
        if parse_chain_names(&listing).iter().any(|c| *c == self.chain) {
            debug!(chain = %self.chain, "Whitelist chain already present");
            return Ok(());
        }

        self.run_checked(&["-N".to_string(), self.chain.clone()]).await?;
        info!(chain = %self.chain, "Created whitelist chain");
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<RuleEntry>, FirewallError> {
        let listing = self
            .run_checked(&[
                "-L".to_string(),
                self.chain.clone(),
                "-n".to_string(),
                "-v".to_string(),
                "-x".to_string(),
            ])
            .await?;

        parse_rule_listing(&listing)
    }

    async fn append_rule(&self, rule: &RuleEntry) -> Result<(), FirewallError> {
        if self.rule_exists(rule).await? {
            debug!(rule = %rule, "Rule already present");
            return Ok(());
        }
        self.run_checked(&self.rule_command("-A", rule)).await.map(drop)
    }

    async fn delete_rule(&self, rule: &RuleEntry) -> Result<(), FirewallError> {
        self.run_checked(&self.rule_command("-D", rule)).await.map(drop)
    }
}

/// Chain names from `iptables -S` output (`-P` built-ins and `-N` user chains)
fn parse_chain_names(listing: &str) -> Vec<&str> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("-P" | "-N") => parts.next(),
                _ => None,
            }
        })
        .collect()
}

/// Rules from `iptables -L <chain> -n -v -x` output, skipping the two header lines
fn parse_rule_listing(listing: &str) -> Result<Vec<RuleEntry>, FirewallError> {
    listing
        .lines()
        .skip(2)
        .filter(|line| !line.trim().is_empty())
        .map(parse_listing_row)
        .collect()
}
