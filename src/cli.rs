use anyhow::Context;
use clap::{Parser, ValueEnum};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

use crate::reconcile::TargetFilter;
use crate::tail::PrefixTemplate;
use crate::types::{ContainerStateMatcher, TailOptions};
use crate::utils::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

#[derive(Parser, Debug)]
#[command(name = "kubectl-stern")]
#[command(about = "Tail logs from multiple pods and containers with continuous discovery")]
pub struct Cli {
    /// Pod name query (regular expression)
    pub pod_query: String,

    /// Container name query (regular expression)
    #[arg(short = 'c', long, default_value = ".*")]
    pub container: String,

    /// Container names to exclude (regular expression, repeatable)
    #[arg(short = 'E', long)]
    pub exclude_container: Vec<String>,

    /// Pod names to exclude (regular expression, repeatable)
    #[arg(long)]
    pub exclude_pod: Vec<String>,

    /// Log lines to exclude (regular expression, repeatable)
    #[arg(short = 'e', long)]
    pub exclude: Vec<String>,

    /// Log lines to include (regular expression, repeatable)
    #[arg(short = 'i', long)]
    pub include: Vec<String>,

    /// Include init containers
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub init_containers: bool,

    /// Include ephemeral containers
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub ephemeral_containers: bool,

    /// Container states to tail
    #[arg(long, value_enum, value_delimiter = ',', default_value = "running")]
    pub container_state: Vec<ContainerStateMatcher>,

    /// Label selector
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Field selector
    #[arg(long)]
    pub field_selector: Option<String>,

    /// Print timestamps
    #[arg(short = 't', long)]
    pub timestamps: bool,

    /// Return logs newer than a relative duration like 5s, 2m, or 3h
    #[arg(short = 's', long, default_value = "48h", value_parser = parse_duration)]
    pub since: Duration,

    /// Number of lines from the end of the logs to show (default: all)
    #[arg(long)]
    pub tail: Option<i64>,

    /// Namespace
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Tail pods in all namespaces
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Context
    #[arg(long)]
    pub context: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Line prefix template, e.g. "{namespace}/{pod} {container}"
    #[arg(long)]
    pub template: Option<String>,

    /// When to color the output
    #[arg(long, value_enum, default_value = "auto")]
    pub color: ColorMode,

    /// Enable verbose (debug) logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

fn compile(patterns: &[String], what: &str) -> anyhow::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("Invalid {} pattern '{}'", what, p)))
        .collect()
}

impl Cli {
    pub fn target_filter(&self) -> anyhow::Result<TargetFilter> {
        Ok(TargetFilter {
            pod: Regex::new(&self.pod_query)
                .with_context(|| format!("Invalid pod query '{}'", self.pod_query))?,
            exclude_pod: compile(&self.exclude_pod, "pod exclude")?,
            container: Regex::new(&self.container)
                .with_context(|| format!("Invalid container query '{}'", self.container))?,
            exclude_container: compile(&self.exclude_container, "container exclude")?,
            init_containers: self.init_containers,
            ephemeral_containers: self.ephemeral_containers,
            states: self.container_state.clone(),
        })
    }

    pub fn tail_options(&self) -> anyhow::Result<TailOptions> {
        let since = i64::try_from(self.since.as_secs()).unwrap_or(i64::MAX);
        Ok(TailOptions {
            timestamps: self.timestamps,
            since_seconds: (since > 0).then_some(since),
            tail_lines: self.tail.filter(|n| *n >= 0),
            include: compile(&self.include, "include")?,
            exclude: compile(&self.exclude, "exclude")?,
            show_namespace: self.all_namespaces,
        })
    }

    pub fn prefix_template(&self) -> anyhow::Result<PrefixTemplate> {
        match &self.template {
            Some(template) => PrefixTemplate::parse(template),
            None => Ok(PrefixTemplate::default_for(self.all_namespaces)),
        }
    }
}
