//! Fleet commands: launching, bidding for, stopping and inspecting render
//! instances.
//!
//! New instances boot with a script that pipes the farm settings into
//! `framefarm-node`, so a launched instance starts working the queue
//! without further setup.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Subcommand};
use framefarm_cloud::{Compute, LaunchSpec, SpotPrice, SpotSpec};
use framefarm_config::{ConfigError, Settings};
use tabled::Tabled;

use crate::config::{flag_or_required, flag_or_setting};
use crate::error::CliError;
use crate::output::{print_heading, print_info, print_success, print_table};

use super::filter::{FilterArgs, InstanceFilter, InstanceRow};
use super::CommandContext;

pub const DEFAULT_INSTANCE_TYPE: &str = "m2.xlarge";
pub const DEFAULT_WORK_DIR: &str = "/mnt/framefarm";
const LOGIN_DIR: &str = "/root";
const NODE_BINARY: &str = "/usr/local/bin/framefarm-node";

/// Keys every boot script must carry.
const REQUIRED_KEYS: &[&str] = &["WORK_QUEUE", "RENDER_OUTPUT", "PROJECT"];

/// Keys passed through when set.
const OPTIONAL_KEYS: &[&str] = &[
    "S3_REGION",
    "SQS_REGION",
    "FETCH_MAX_THREADS",
    "FETCH_N_RETRIES",
    "VISIBILITY_TIMEOUT",
    "VISIBILITY_TIMEOUT_REASSERT",
    "POLL_INTERVAL_MS",
    "N_RETRIES",
    "ERROR_PAUSE",
    "RESET_PERIOD",
    "RENDER_FAILURE_RETRY",
    "PROJECT_ALWAYS_REFETCH",
    "SHUTDOWN",
    "DONE",
    "DONE_POLL_INTERVAL",
];

/// Provider credentials exported to the node's environment when set.
const CREDENTIAL_KEYS: &[&str] = &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"];

/// Side files linked back into the login directory.
const LINKED_FILES: &[&str] = &["framefarm.pid", "task_count", "task_last", "DONE"];

const DONE_MODES: &[&str] = &["stop", "exit", "poll", "shutdown"];

/// Fleet commands.
#[derive(Debug, Args)]
pub struct FleetCommand {
    #[command(subcommand)]
    command: FleetSubcommand,
}

#[derive(Debug, Subcommand)]
enum FleetSubcommand {
    /// Print the instance boot script.
    Script,

    /// Launch on-demand instances.
    Demand(LaunchArgs),

    /// Bid for spot instances.
    Spot(SpotArgs),

    /// Show the latest spot price per availability zone.
    Price(PriceArgs),

    /// Stop (or terminate) running instances.
    Stop(StopArgs),

    /// Cancel every spot request.
    Cancel(CancelArgs),

    /// Show instances and spot requests.
    Status(FilterArgs),
}

#[derive(Debug, Args)]
struct LaunchArgs {
    /// Number of instances.
    #[arg(long = "instances", short = 'N', default_value_t = 1)]
    count: u32,

    /// Instance type (default: INSTANCE_TYPE setting, then m2.xlarge).
    #[arg(long, short = 'i')]
    instance_type: Option<String>,

    /// Machine image (default: AMI_ID setting).
    #[arg(long)]
    ami: Option<String>,

    /// Launch without the boot script.
    #[arg(long)]
    idle: bool,

    /// Show what would be launched.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct SpotArgs {
    #[command(flatten)]
    launch: LaunchArgs,

    /// Maximum hourly price (default: BID_PRICE setting).
    #[arg(long, short = 'p')]
    price: Option<String>,

    /// Keep the request open after instances are reclaimed.
    #[arg(long)]
    persistent: bool,
}

#[derive(Debug, Args)]
struct PriceArgs {
    #[arg(long, short = 'i')]
    instance_type: Option<String>,
}

#[derive(Debug, Args)]
struct StopArgs {
    #[command(flatten)]
    filter: FilterArgs,

    /// Terminate instead of stopping.
    #[arg(long, short = 'T')]
    terminate: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct CancelArgs {
    #[arg(long)]
    dry_run: bool,
}

impl FleetCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            FleetSubcommand::Script => {
                print!("{}", startup_script(&ctx.settings)?);
                Ok(())
            }
            FleetSubcommand::Demand(args) => demand(ctx, args).await,
            FleetSubcommand::Spot(args) => spot(ctx, args).await,
            FleetSubcommand::Price(args) => price(ctx, args).await,
            FleetSubcommand::Stop(args) => stop(ctx, args).await,
            FleetSubcommand::Cancel(args) => cancel(ctx, args).await,
            FleetSubcommand::Status(args) => status(ctx, args).await,
        }
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Boot script that runs the node agent with the farm settings.
///
/// The settings go through a quoted heredoc, so `$` in values reaches the
/// node's own expansion untouched.
pub fn startup_script(settings: &Settings) -> Result<String, CliError> {
    let mut script = String::from("#!/bin/bash\n");

    for key in CREDENTIAL_KEYS {
        if let Some(value) = settings.get(key) {
            script.push_str(&format!("export {key}={}\n", shell_quote(value)));
        }
    }

    let work_dir = settings.get("WORK_DIR").unwrap_or(DEFAULT_WORK_DIR);
    if work_dir == LOGIN_DIR {
        script.push_str(&format!("cd \"{LOGIN_DIR}\"\n"));
    } else {
        script.push_str(&format!(
            "# run the node on the instance store volume\n\
             W=\"{work_dir}\"\n\
             if ! [ -d \"$W\" ]; then\n  \
               for f in {files} ; do\n    \
                 ln -s \"$W/$f\" \"{LOGIN_DIR}/$f\"\n  \
               done\n\
             fi\n\
             mkdir -p \"$W\"\n\
             cd \"$W\"\n",
            files = LINKED_FILES.join(" "),
        ));
    }

    script.push_str(&format!("{NODE_BINARY} <<'EOF'\nWORK_DIR=.\n"));
    for key in REQUIRED_KEYS {
        script.push_str(&format!("{key}={}\n", settings.require(key)?));
    }
    for key in OPTIONAL_KEYS {
        if let Some(value) = settings.get(key) {
            script.push_str(&format!("{key}={value}\n"));
        }
    }
    script.push_str("EOF\n");
    Ok(script)
}

/// `script` with credential values replaced, for display.
pub fn redact(script: &str) -> String {
    script
        .lines()
        .map(|line| {
            CREDENTIAL_KEYS
                .iter()
                .map(|key| format!("export {key}="))
                .find(|prefix| line.starts_with(prefix.as_str()))
                .map_or_else(|| line.to_string(), |prefix| format!("{prefix}[redacted]"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reject a `DONE` setting the node would not understand.
fn check_done(settings: &Settings) -> Result<(), ConfigError> {
    match settings.get("DONE") {
        Some(value) if !DONE_MODES.contains(&value.trim().to_ascii_lowercase().as_str()) => {
            Err(ConfigError::Invalid {
                key: "DONE".to_string(),
                value: value.to_string(),
                reason: format!("expected one of {}", DONE_MODES.join(", ")),
            })
        }
        _ => Ok(()),
    }
}

/// Launch parameters from flags and settings.
fn launch_spec(args: &LaunchArgs, settings: &Settings) -> Result<LaunchSpec, CliError> {
    check_done(settings)?;
    Ok(LaunchSpec {
        image_id: flag_or_required(args.ami.as_deref(), settings, "AMI_ID")?,
        instance_type: flag_or_setting(
            args.instance_type.as_deref(),
            settings,
            "INSTANCE_TYPE",
            DEFAULT_INSTANCE_TYPE,
        ),
        count: args.count,
        user_data: if args.idle {
            None
        } else {
            Some(startup_script(settings)?)
        },
        key_name: Some(settings.get("SSH_KEY_NAME").unwrap_or("framefarm").to_string()),
        security_groups: vec![settings
            .get("SECURITY_GROUP")
            .unwrap_or("framefarm")
            .to_string()],
    })
}

fn describe_launch(spec: &LaunchSpec) {
    println!("Image:           {}", spec.image_id);
    println!("Instance type:   {}", spec.instance_type);
    println!("Instances:       {}", spec.count);
    println!("SSH key name:    {}", spec.key_name.as_deref().unwrap_or("-"));
    println!("Security groups: {}", spec.security_groups.join(", "));
    if let Some(script) = &spec.user_data {
        println!("Boot script:");
        for line in redact(script).lines() {
            println!("  {line}");
        }
    }
}

/// Launch on-demand instances, returning their ids.
pub async fn launch(
    compute: &dyn Compute,
    spec: &LaunchSpec,
    ctx: &CommandContext,
) -> Result<Vec<String>, CliError> {
    Ok(ctx.retry()?.run(|| compute.launch_on_demand(spec)).await?)
}

async fn demand(ctx: CommandContext, args: LaunchArgs) -> Result<()> {
    let spec = launch_spec(&args, &ctx.settings)?;
    describe_launch(&spec);
    if args.dry_run {
        print_info("Dry run: nothing launched");
        return Ok(());
    }

    let compute = ctx.compute().await?;
    let ids = launch(compute.as_ref(), &spec, &ctx).await?;
    print_success(&format!("Launched {}", ids.join(", ")));
    Ok(())
}

async fn spot(ctx: CommandContext, args: SpotArgs) -> Result<()> {
    let spec = SpotSpec {
        launch: launch_spec(&args.launch, &ctx.settings)?,
        price: flag_or_required(args.price.as_deref(), &ctx.settings, "BID_PRICE")?,
        persistent: args.persistent,
    };
    println!("Max bid price:   {}", spec.price);
    println!(
        "Request type:    {}",
        if spec.persistent { "persistent" } else { "one-time" }
    );
    describe_launch(&spec.launch);
    if args.launch.dry_run {
        print_info("Dry run: no bid placed");
        return Ok(());
    }

    let compute = ctx.compute().await?;
    let ids = ctx
        .retry()?
        .run(|| compute.request_spot(&spec))
        .await
        .map_err(CliError::from)?;
    print_success(&format!("Placed spot requests {}", ids.join(", ")));
    Ok(())
}

/// The most recent price for every availability zone, ordered by zone.
pub fn latest_prices(history: Vec<SpotPrice>) -> Vec<SpotPrice> {
    let mut latest: BTreeMap<String, SpotPrice> = BTreeMap::new();
    for entry in history {
        let newer = latest
            .get(&entry.availability_zone)
            .is_none_or(|seen| entry.timestamp > seen.timestamp);
        if newer {
            latest.insert(entry.availability_zone.clone(), entry);
        }
    }
    latest.into_values().collect()
}

#[derive(Debug, Tabled)]
struct PriceRow {
    #[tabled(rename = "Zone")]
    zone: String,

    #[tabled(rename = "Since")]
    timestamp: String,

    #[tabled(rename = "Price")]
    price: String,
}

async fn price(ctx: CommandContext, args: PriceArgs) -> Result<()> {
    let instance_type = flag_or_setting(
        args.instance_type.as_deref(),
        &ctx.settings,
        "INSTANCE_TYPE",
        DEFAULT_INSTANCE_TYPE,
    );
    let compute = ctx.compute().await?;
    let history = ctx
        .retry()?
        .run(|| compute.spot_price_history(&instance_type))
        .await
        .map_err(CliError::from)?;

    print_heading(&format!("Spot prices for {instance_type}"));
    let rows: Vec<_> = latest_prices(history)
        .into_iter()
        .map(|p| PriceRow {
            zone: p.availability_zone,
            timestamp: p.timestamp.to_rfc3339(),
            price: format!("${}", p.price),
        })
        .collect();
    print_table(&rows);
    Ok(())
}

/// Stop or terminate `ids` unless this is a dry run.
pub async fn shutdown(
    compute: &dyn Compute,
    ids: &[String],
    terminate: bool,
    dry_run: bool,
    ctx: &CommandContext,
) -> Result<(), CliError> {
    let verb = if terminate { "TERMINATE" } else { "SHUTDOWN" };
    println!("{verb} {}", ids.join(" "));
    if dry_run || ids.is_empty() {
        return Ok(());
    }
    ctx.retry()?
        .run(|| compute.stop_instances(ids, terminate))
        .await?;
    Ok(())
}

async fn stop(ctx: CommandContext, args: StopArgs) -> Result<()> {
    let filter = InstanceFilter::from_args(&args.filter, &ctx.settings)?;
    let compute = ctx.compute().await?;
    let instances = filter.select(compute.as_ref(), &ctx.retry()?).await?;
    let ids: Vec<String> = instances.into_iter().map(|i| i.id).collect();
    shutdown(compute.as_ref(), &ids, args.terminate, args.dry_run, &ctx).await?;
    Ok(())
}

async fn cancel(ctx: CommandContext, args: CancelArgs) -> Result<()> {
    let compute = ctx.compute().await?;
    let retry = ctx.retry()?;
    let requests = retry
        .run(|| compute.spot_requests())
        .await
        .map_err(CliError::from)?;
    let ids: Vec<String> = requests.into_iter().map(|r| r.id).collect();
    println!("CANCEL {}", ids.join(" "));
    if !args.dry_run && !ids.is_empty() {
        retry
            .run(|| compute.cancel_spot_requests(&ids))
            .await
            .map_err(CliError::from)?;
    }
    Ok(())
}

#[derive(Debug, Tabled)]
struct SpotRequestRow {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Type")]
    request_type: String,

    #[tabled(rename = "Created")]
    created: String,

    #[tabled(rename = "Price")]
    price: String,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Status")]
    status: String,
}

async fn status(ctx: CommandContext, args: FilterArgs) -> Result<()> {
    let filter = InstanceFilter::from_args(&args, &ctx.settings)?;
    let compute = ctx.compute().await?;
    let retry = ctx.retry()?;

    let now = Utc::now();
    let instances = filter.select(compute.as_ref(), &retry).await?;
    print_heading("Active instances");
    let rows: Vec<_> = instances.iter().map(|i| InstanceRow::new(i, now)).collect();
    print_table(&rows);

    let requests = retry
        .run(|| compute.spot_requests())
        .await
        .map_err(CliError::from)?;
    print_heading("Spot requests");
    let rows: Vec<_> = requests
        .into_iter()
        .map(|r| SpotRequestRow {
            id: r.id,
            request_type: r.request_type,
            created: r
                .create_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            price: format!("${}", r.price),
            state: r.state,
            status: r.status,
        })
        .collect();
    print_table(&rows);
    Ok(())
}
