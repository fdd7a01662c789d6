use crate::cli::OutputFormat;
use crate::display;
use crate::error::{CliError, Result};
use colored::*;
use fleet_cluster::{
    retry::wait_for_server, wait_for_hosts, Assignment, ClusterConfig, ExecEnv, HostAddress,
    HostSet, MembershipAuthority, ServiceId, WorkItem,
};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

const HOSTS_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct CommandHandler {
    config: ClusterConfig,
    output_format: OutputFormat,
}

#[derive(Serialize)]
struct HostsReport<'a> {
    service_id: &'a ServiceId,
    version: u64,
    hosts: &'a HostSet,
}

#[derive(Serialize)]
struct ScheduleReport<'a> {
    service_id: &'a ServiceId,
    assignment: &'a Assignment,
}

/// Load the cluster configuration from `path`, or from defaults plus environment
pub fn load_config(path: Option<&Path>) -> Result<ClusterConfig> {
    let config = match path {
        Some(path) => ClusterConfig::from_file(path),
        None => ClusterConfig::from_env(),
    };
    config.map_err(|e| CliError::ConfigError(e.to_string()))
}

/// Parse `id` or `id=host:port,host:port` into a work item.
///
/// A port of 0 in a hint matches any port on that host.
pub fn parse_work_item(raw: &str) -> Result<WorkItem> {
    let (id, hints) = match raw.split_once('=') {
        Some((id, hints)) => (id.trim(), Some(hints)),
        None => (raw.trim(), None),
    };
    if id.is_empty() {
        return Err(CliError::InvalidInput(format!("Work item without id: '{}'", raw)));
    }

    let mut item = WorkItem::new(id);
    if let Some(hints) = hints {
        for hint in hints.split(',').map(str::trim).filter(|h| !h.is_empty()) {
            let host: HostAddress = hint
                .parse()
                .map_err(|e| CliError::InvalidInput(format!("Bad host hint '{}': {}", hint, e)))?;
            item = item.with_preferred_host(host);
        }
    }
    Ok(item)
}

fn parse_address(address: &str) -> Result<HostAddress> {
    address
        .parse()
        .map_err(|e| CliError::InvalidInput(format!("Bad address '{}': {}", address, e)))
}

impl CommandHandler {
    pub fn new(config: ClusterConfig, output_format: OutputFormat) -> Self {
        Self {
            config,
            output_format,
        }
    }

    /// Config with the authority address overridden from the command line
    fn config_for(&self, authority: Option<&str>) -> Result<ClusterConfig> {
        let mut config = self.config.clone();
        if let Some(authority) = authority {
            config.subscriber.authority_address = parse_address(authority)?.to_string();
        }
        Ok(config)
    }

    fn service_or_default(&self, service: Option<String>) -> ServiceId {
        service
            .map(ServiceId::new)
            .unwrap_or_else(|| self.config.scheduler.service_id())
    }

    pub async fn run_statestore(&self, port: Option<u16>) -> Result<()> {
        let port = port.unwrap_or(self.config.authority.bind_address.port());
        let authority =
            MembershipAuthority::new(self.config.authority.clone(), self.config.pool.clone());
        let local_addr = authority.start(port).await?;

        display::success(format!(
            "Membership authority {} listening on {}",
            authority.authority_id(),
            local_addr
        ));

        tokio::signal::ctrl_c().await?;
        tracing::info!("Interrupt received, stopping authority");
        authority.stop().await;
        display::success("Membership authority stopped");
        Ok(())
    }

    pub async fn run_backend(
        &self,
        authority: Option<&str>,
        service: String,
        address: &str,
    ) -> Result<()> {
        let config = self.config_for(authority)?;
        let address = parse_address(address)?;
        let service_id = ServiceId::new(service);

        let env = ExecEnv::backend(&config)?;
        env.start_services().await?;

        if let Err(e) = env.register_service(service_id.clone(), address.clone()).await {
            env.shutdown().await;
            return Err(e.into());
        }
        display::success(format!("Registered {} under '{}'", address, service_id));

        let mut updates = env.membership().subscribe();
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = updates.borrow_and_update().clone();
                    let hosts = snapshot.known_hosts(&service_id);
                    self.print_hosts(&service_id, snapshot.version(), &hosts)?;
                }
            }
        }

        tracing::info!("Interrupt received, deregistering {}", address);
        env.shutdown().await;
        display::success("Backend stopped");
        Ok(())
    }

    pub async fn show_hosts(
        &self,
        authority: Option<&str>,
        service: Option<String>,
        expect: Option<usize>,
        timeout_ms: u64,
    ) -> Result<()> {
        let config = self.config_for(authority)?;
        let service_id = self.service_or_default(service);

        let env = ExecEnv::backend(&config)?;
        env.start_services().await?;
        let result = self.observe_hosts(&env, &service_id, expect, timeout_ms).await;
        env.shutdown().await;

        let (version, hosts) = result?;
        self.print_hosts(&service_id, version, &hosts)
    }

    async fn observe_hosts(
        &self,
        env: &ExecEnv,
        service_id: &ServiceId,
        expect: Option<usize>,
        timeout_ms: u64,
    ) -> Result<(u64, HostSet)> {
        let attempts = poll_attempts(timeout_ms);
        match expect {
            Some(expected) => {
                let membership = env.membership();
                wait_for_hosts(membership, service_id, expected, attempts, HOSTS_POLL_INTERVAL)
                    .await?;
            }
            None => {
                // Any snapshot at all, including an empty one
                let membership = env.membership();
                fleet_cluster::poll_until(attempts, HOSTS_POLL_INTERVAL, || {
                    membership.health().last_update_age.is_some()
                })
                .await;
            }
        }

        let snapshot = env.membership().snapshot();
        Ok((snapshot.version(), snapshot.known_hosts(service_id)))
    }

    pub async fn schedule(
        &self,
        authority: Option<&str>,
        service: Option<String>,
        expect: Option<usize>,
        timeout_ms: u64,
        items: &[String],
    ) -> Result<()> {
        let items = items
            .iter()
            .map(|raw| parse_work_item(raw))
            .collect::<Result<Vec<_>>>()?;

        let mut config = self.config_for(authority)?;
        let service_id = self.service_or_default(service);
        config.scheduler.service_id = service_id.to_string();

        let env = ExecEnv::coordinator(&config)?;
        env.start_services().await?;
        let result = async {
            self.observe_hosts(&env, &service_id, expect.or(Some(1)), timeout_ms)
                .await?;
            Ok::<_, CliError>(env.scheduler()?.schedule(&items)?)
        }
        .await;
        env.shutdown().await;

        let assignment = result?;
        match self.output_format {
            OutputFormat::Json => {
                let report = ScheduleReport {
                    service_id: &service_id,
                    assignment: &assignment,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Plain => {
                display::header(format!(
                    "Assignment of {} item(s) at membership version {}",
                    assignment.len(),
                    assignment.snapshot_version
                ));
                for (id, host) in assignment.iter() {
                    println!("  {} -> {}", id.to_string().bold(), host);
                }
                for (host, load) in assignment.load_by_host() {
                    println!("  {} {} item(s)", format!("{}:", host).dimmed(), load);
                }
            }
        }
        Ok(())
    }

    pub async fn probe(&self, address: &str, attempts: u32, interval_ms: u64) -> Result<()> {
        let address = parse_address(address)?;
        wait_for_server(
            address.host(),
            address.port(),
            attempts,
            Duration::from_millis(interval_ms),
        )
        .await?;
        display::success(format!("{} is accepting connections", address));
        Ok(())
    }

    fn print_hosts(&self, service_id: &ServiceId, version: u64, hosts: &HostSet) -> Result<()> {
        match self.output_format {
            OutputFormat::Json => {
                let report = HostsReport {
                    service_id,
                    version,
                    hosts,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Plain => {
                display::header(format!(
                    "Service '{}' at version {}: {} host(s)",
                    service_id,
                    version,
                    hosts.len()
                ));
                if hosts.is_empty() {
                    display::warning("No hosts known");
                }
                for host in hosts {
                    println!("  {}", host);
                }
            }
        }
        Ok(())
    }
}

fn poll_attempts(timeout_ms: u64) -> u32 {
    let interval = HOSTS_POLL_INTERVAL.as_millis() as u64;
    (timeout_ms / interval).clamp(1, u32::MAX as u64) as u32
}
