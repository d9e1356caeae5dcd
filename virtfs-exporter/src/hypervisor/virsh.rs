//! Hypervisor binding over the `virsh` command-line client.

use std::time::Duration;

use async_trait::async_trait;
use process_utils::{CommandOutput, output_with_timeout, tokio_command};
use tracing::trace;

use super::xml::parse_domain_xml;
use super::{Hypervisor, HypervisorConnection};
use crate::domain::DomainRef;
use crate::{Error, Result};

/// Per-call timeout for virsh invocations.
pub const DEFAULT_VIRSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Stderr fragments virsh prints when a domain no longer exists.
const NOT_FOUND_MARKERS: &[&str] = &["Domain not found", "failed to get domain", "no domain with matching"];

/// Read-only virsh client bound to one libvirt URI.
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    bin: String,
    uri: String,
    timeout: Duration,
}

impl VirshHypervisor {
    pub fn new(bin: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            uri: uri.into(),
            timeout: DEFAULT_VIRSH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = tokio_command(&self.bin);
        cmd.args(["--readonly", "--quiet", "-c", self.uri.as_str()]).args(args);
        trace!(uri = %self.uri, ?args, "virsh");
        Ok(output_with_timeout(&mut cmd, self.timeout).await?)
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn connect(&self) -> Result<Box<dyn HypervisorConnection>> {
        let out = self
            .run(&["uri"])
            .await
            .map_err(|e| Error::connection(e.to_string()))?;
        if !out.success() {
            return Err(Error::connection(format!(
                "cannot connect to {}: {}",
                self.uri,
                out.diagnostic()
            )));
        }
        Ok(Box::new(VirshConnection {
            client: self.clone(),
        }))
    }
}

/// A verified virsh endpoint. Each call is a separate virsh process.
struct VirshConnection {
    client: VirshHypervisor,
}

#[async_trait]
impl HypervisorConnection for VirshConnection {
    async fn list_domain_ids(&mut self) -> Result<Vec<String>> {
        let out = self.client.run(&["list", "--uuid"]).await?;
        if !out.success() {
            return Err(Error::connection(format!(
                "listing domains failed: {}",
                out.diagnostic()
            )));
        }
        Ok(parse_uuid_list(&out.stdout))
    }

    async fn describe_domain(&mut self, domain_id: &str) -> Result<DomainRef> {
        let out = self.client.run(&["dumpxml", domain_id]).await?;
        if !out.success() {
            let diag = out.diagnostic();
            if NOT_FOUND_MARKERS.iter().any(|m| diag.contains(m)) {
                return Err(Error::DomainNotFound(domain_id.to_string()));
            }
            return Err(Error::Other(format!("dumpxml {domain_id} failed: {diag}")));
        }
        parse_domain_xml(&out.stdout)
    }
}

/// Parse `virsh list --uuid` output: one UUID per line, blank lines ignored.
pub fn parse_uuid_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
