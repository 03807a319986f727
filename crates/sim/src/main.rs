//! Elastic Node simulator
//!
//! Runs a node in-process and drives its services through a phased load:
//! steady arrivals, then rising, peak and falling rates. Prints how the
//! allocations followed the load.

mod load;
mod output;
mod report;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use node_lib::{NodeFacade, NodeSettings, Service, TracingSink};
use output::OutputFormat;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Elastic Node load simulator
#[derive(Parser)]
#[command(name = "node-sim")]
#[command(author, version, about = "Load simulator for the Elastic Node controller", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: OutputFormat,

    /// Log control decisions while running
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run services under phased load and summarize the allocations
    Run {
        /// Requests per service after the steady phase, split in three phases
        #[arg(long, default_value_t = 1000)]
        requests: u64,

        /// Requests per service in the steady phase
        #[arg(long, default_value_t = 200)]
        steady: u64,

        /// Node memory
        #[arg(long, default_value_t = 8192)]
        memory: u64,

        /// Control period in milliseconds
        #[arg(long, default_value_t = 9000)]
        period_ms: u64,

        /// Smoothing factor of the allocation filters
        #[arg(long, default_value_t = 0.9)]
        alpha: f64,

        /// Apply the target allocations as given instead of adapting them
        #[arg(long)]
        open_loop: bool,

        /// Write the allocation log to this CSV file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Service as name:memory:target_rt_ms[:target_allocation]; repeatable
        #[arg(long = "service", value_parser = parse_service)]
        services: Vec<Service>,
    },

    /// Print the static pool size for a steady arrival rate
    Static {
        /// Milliseconds between two requests
        #[arg(long)]
        inter_arrival_ms: f64,

        /// Target response time in milliseconds
        #[arg(long)]
        target_rt_ms: f64,

        /// Control period in milliseconds
        #[arg(long, default_value_t = 9000.0)]
        period_ms: f64,
    },
}

fn parse_service(value: &str) -> std::result::Result<Service, String> {
    let parts: Vec<&str> = value.split(':').collect();
    if !(3..=4).contains(&parts.len()) {
        return Err("expected name:memory:target_rt_ms[:target_allocation]".to_string());
    }
    let memory = parts[1]
        .parse::<u64>()
        .map_err(|e| format!("invalid memory: {e}"))?;
    let target_rt_ms = parts[2]
        .parse::<f64>()
        .map_err(|e| format!("invalid target_rt_ms: {e}"))?;
    let target_allocation = match parts.get(3) {
        Some(hint) => hint
            .parse::<f64>()
            .map_err(|e| format!("invalid target_allocation: {e}"))?,
        None => 0.0,
    };

    let service =
        Service::new(parts[0], memory, target_rt_ms).with_target_allocation(target_allocation);
    service.validate().map_err(|e| e.to_string())?;
    Ok(service)
}

/// Two services sharing the node, as in the reference experiment
fn default_services() -> Vec<Service> {
    vec![
        Service::new("1", 128, 120.0).with_target_allocation(32.0),
        Service::new("2", 256, 100.0).with_target_allocation(16.0),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer())
        .init();

    match cli.command {
        Commands::Run {
            requests,
            steady,
            memory,
            period_ms,
            alpha,
            open_loop,
            log_file,
            services,
        } => {
            let settings = NodeSettings::new(
                "1",
                memory,
                Duration::from_millis(period_ms),
                alpha,
                !open_loop,
            );
            let services = if services.is_empty() {
                default_services()
            } else {
                services
            };
            run(settings, services, steady, requests, log_file, cli.verbose, cli.format).await?;
        }
        Commands::Static {
            inter_arrival_ms,
            target_rt_ms,
            period_ms,
        } => {
            let allocation =
                NodeFacade::get_static_allocation(inter_arrival_ms, target_rt_ms, period_ms);
            match cli.format {
                OutputFormat::Table => println!("{}", output::format_allocation(allocation)),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({
                        "inter_arrival_ms": inter_arrival_ms,
                        "target_rt_ms": target_rt_ms,
                        "period_ms": period_ms,
                        "allocation": allocation.is_finite().then_some(allocation),
                    })
                ),
            }
        }
    }

    Ok(())
}

async fn run(
    settings: NodeSettings,
    services: Vec<Service>,
    steady: u64,
    requests: u64,
    log_file: Option<PathBuf>,
    verbose: bool,
    format: OutputFormat,
) -> Result<()> {
    let node = Arc::new(NodeFacade::new(settings)?);
    node.set_verbose(verbose || log_file.is_some());
    if verbose {
        node.add_sink(Arc::new(TracingSink)).await;
    }
    if let Some(path) = &log_file {
        node.log_to_file(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }

    for service in &services {
        node.add_service(service.clone()).await?;
    }
    node.start().await?;
    output::print_info(&format!(
        "Running {} service(s), control period {:?}",
        services.len(),
        node.settings().control_period
    ));

    let mut generators = Vec::with_capacity(services.len());
    for service in &services {
        let phases = load::plan(service, steady, requests);
        generators.push(tokio::spawn(load::drive(
            node.clone(),
            service.clone(),
            phases,
            |service: &Service, phase: &load::Phase| {
                output::print_info(&format!(
                    "{}: {} phase, {} requests",
                    service.name, phase.name, phase.requests
                ))
            },
        )));
    }

    let mut rejected = 0;
    for generator in generators {
        let stats = generator.await.context("Load generator failed")?;
        rejected += stats.rejected;
    }

    let summaries: Vec<report::ServiceSummary> = services
        .iter()
        .map(|service| report::summarize(service, &node.get_history(&service.name)))
        .collect();
    let diagnostics = node.diagnostics();
    node.stop().await;

    output::print_table(&summaries, format);
    if let OutputFormat::Table = format {
        for (service, summary) in services.iter().zip(&summaries) {
            println!(
                "  {} mean response time {} (target {})",
                service.name,
                output::color_response_time(summary.mean_rt_ms, service.target_rt_ms),
                output::format_ms(service.target_rt_ms)
            );
        }
        if rejected > 0 {
            output::print_warning(&format!("{rejected} request(s) rejected"));
        }
        output::print_success(&format!(
            "Simulation complete after {} control ticks",
            diagnostics.ticks
        ));
    }

    Ok(())
}
