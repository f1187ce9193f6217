use anyhow::{bail, Context, Result};
use chrono::{Local, TimeZone};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use failtrack::config::{Config, JailConfig};
use failtrack::datedetector::DateDetection;
use failtrack::dns::{DnsPolicy, IdentityResolver};
use failtrack::models::FailTicket;
use failtrack::registry::FailRegistry;
use failtrack::sampling::RetrySampler;
use failtrack::Jail;

#[derive(Parser)]
#[command(name = "failtrack")]
#[command(author, version, about = "Run fail patterns over log files and report ban candidates")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Only run this jail from the configuration
    #[arg(short, long)]
    pub jail: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Ad-hoc fail pattern (repeatable); ignores jails from the config
    #[arg(long = "fail-regex")]
    pub fail_regex: Vec<String>,

    /// Ad-hoc ignore pattern (repeatable)
    #[arg(long = "ignore-regex")]
    pub ignore_regex: Vec<String>,

    /// Address, network or hostname to never report (repeatable)
    #[arg(long = "ignore-ip")]
    pub ignore_ip: Vec<String>,

    /// Override the number of failures before ban
    #[arg(long)]
    pub max_retry: Option<u32>,

    /// Override the failure window in seconds
    #[arg(long)]
    pub max_time: Option<i64>,

    /// Override DNS policy (yes, no, warn)
    #[arg(long)]
    pub use_dns: Option<DnsPolicy>,

    /// Read line dates with the built-in templates instead of using now
    #[arg(long)]
    pub detect_dates: bool,

    /// Print tickets as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Log files to scan (default: the jail's configured paths)
    pub logs: Vec<PathBuf>,
}

impl Cli {
    pub fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::load(path),
            None => Config::load_or_default(),
        }
    }

    fn adhoc_jail(&self) -> JailConfig {
        JailConfig {
            fail_regex: self.fail_regex.clone(),
            ..Default::default()
        }
    }

    fn apply_overrides(&self, jail: &mut JailConfig) {
        if !self.logs.is_empty() {
            jail.log_paths = self.logs.iter().map(|p| p.display().to_string()).collect();
        }
        jail.ignore_regex.extend(self.ignore_regex.iter().cloned());
        jail.ignore_ip.extend(self.ignore_ip.iter().cloned());
        if let Some(max_retry) = self.max_retry {
            jail.max_retry = max_retry;
        }
        if let Some(max_time) = self.max_time {
            jail.max_time = max_time;
        }
        if let Some(policy) = self.use_dns {
            jail.use_dns = policy;
        }
        if self.detect_dates {
            jail.date = DateDetection::Auto;
        }
    }

    /// Jails to run, with command-line overrides applied
    fn selected_jails(&self, config: &Config) -> Result<Vec<(String, JailConfig)>> {
        let mut jails: Vec<(String, JailConfig)> = if !self.fail_regex.is_empty() {
            vec![("adhoc".to_string(), self.adhoc_jail())]
        } else if let Some(name) = &self.jail {
            let jail = config
                .jails
                .get(name)
                .with_context(|| format!("No jail named '{}' in configuration", name))?;
            vec![(name.clone(), jail.clone())]
        } else {
            config
                .jails
                .iter()
                .filter(|(_, jail)| jail.enabled)
                .map(|(name, jail)| (name.clone(), jail.clone()))
                .collect()
        };

        if jails.is_empty() {
            bail!("No enabled jails to run");
        }
        jails.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, jail) in &mut jails {
            self.apply_overrides(jail);
        }
        Ok(jails)
    }
}

fn print_ticket(jail: &str, ticket: &FailTicket, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(ticket)?);
        return Ok(());
    }

    let when = Local
        .timestamp_opt(ticket.timestamp(), 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ticket.timestamp().to_string());
    println!(
        "{:<10} {:<40} {:>5} attempts  last {}",
        jail,
        ticket.identity(),
        ticket.attempt_count(),
        when
    );
    Ok(())
}

pub fn run(cli: Cli, config: Config) -> Result<()> {
    let jails = cli.selected_jails(&config)?;
    let resolver = Arc::new(IdentityResolver::system().context("Failed to set up DNS resolver")?);

    for (name, jail_config) in &jails {
        let registry = Arc::new(FailRegistry::new().with_observer(Arc::new(RetrySampler::new())));
        let mut jail = Jail::with_registry(name, jail_config, resolver.clone(), registry)
            .with_context(|| format!("Invalid configuration for jail '{}'", name))?;

        let added = jail.poll();
        let mut banned = 0;
        for ticket in jail.registry().drain() {
            print_ticket(name, &ticket, cli.json)?;
            banned += 1;
        }

        if !cli.json {
            println!(
                "{}: {} failures recorded, {} ban candidates, {} identities below threshold",
                name,
                added,
                banned,
                jail.registry().size()
            );
        }
    }

    Ok(())
}
