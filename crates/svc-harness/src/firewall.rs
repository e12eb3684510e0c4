//! iptables helpers for simulating network partitions in tests
//!
//! Nothing in the supervisor calls these. Tests that block ports should
//! call [`FirewallRules::clear_all`] when they are done.

use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::error::{HarnessError, Result};

/// Thin wrapper over the `iptables` command line
#[derive(Debug, Clone)]
pub struct FirewallRules {
    program: String,
}

impl Default for FirewallRules {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallRules {
    pub fn new() -> Self {
        Self::with_program("iptables")
    }

    /// Use a different executable in place of `iptables`
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Remove all rules
    pub async fn clear_all(&self) -> Result<()> {
        info!("iptables: clearing all rules");
        self.run(&["-F".to_string()]).await
    }

    /// Drop incoming TCP traffic to `port` on the loopback interface
    pub async fn block_port(&self, port: u16) -> Result<()> {
        info!(port, "iptables: blocking port");
        self.run(&Self::rule("-I", port)).await
    }

    /// Remove a rule added by [`block_port`](Self::block_port)
    pub async fn unblock_port(&self, port: u16) -> Result<()> {
        info!(port, "iptables: unblocking port");
        self.run(&Self::rule("-D", port)).await
    }

    fn rule(action: &str, port: u16) -> Vec<String> {
        [
            action, "INPUT", "-p", "tcp", "--dport", &port.to_string(), "-i", "lo", "-j",
            "DROP",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        let command = format!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HarnessError::Firewall {
                command: command.clone(),
                status: None,
                output: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(HarnessError::Firewall {
            command,
            status: output.status.code(),
            output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_rule_args() {
        assert_eq!(
            FirewallRules::rule("-I", 9001).join(" "),
            "-I INPUT -p tcp --dport 9001 -i lo -j DROP"
        );
    }

    #[tokio::test]
    async fn test_success_with_stand_in_program() {
        let rules = FirewallRules::with_program("true");
        rules.block_port(9001).await.unwrap();
        rules.unblock_port(9001).await.unwrap();
        rules.clear_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_carries_command() {
        let rules = FirewallRules::with_program("false");
        match rules.block_port(9001).await {
            Err(HarnessError::Firewall {
                command, status, ..
            }) => {
                assert_eq!(command, "false -I INPUT -p tcp --dport 9001 -i lo -j DROP");
                assert_eq!(status, Some(1));
            }
            other => panic!("Expected firewall error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let rules = FirewallRules::with_program("/nonexistent/iptables");
        assert!(matches!(
            rules.clear_all().await,
            Err(HarnessError::Firewall { status: None, .. })
        ));
    }
}
