//! Fleet tooling over ssh: listing, command fan-out and pruning.
//!
//! Commands run on every selected instance concurrently, bounded by
//! `TOOL_THREADS`. Output is collected under a lock so per-host blocks
//! never interleave.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Subcommand};
use directories::BaseDirs;
use framefarm_config::Settings;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::CliError;
use crate::output::{print_heading, print_table};

use super::filter::{FilterArgs, InstanceFilter, InstanceRow};
use super::fleet::shutdown;
use super::CommandContext;

const DEFAULT_TOOL_THREADS: usize = 64;
const DEFAULT_REMOTE_PIDFILE: &str = "framefarm.pid";

/// Rank of an instance that has never completed a task.
const RANK_SMALL: i64 = -1;

/// Rank of an instance whose agent has exited.
const RANK_BIG: i64 = 1 << 32;

/// Placeholder replaced by each host in rsync arguments.
const HOST_MACRO: &str = "HOST";

/// Tool commands.
#[derive(Debug, Args)]
pub struct ToolCommand {
    #[command(flatten)]
    filter: FilterArgs,

    /// Remote user (default: SSH_USER setting).
    #[arg(long, short = 'u', global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: ToolSubcommand,
}

#[derive(Debug, Subcommand)]
enum ToolSubcommand {
    /// List the selected instances.
    Instances,

    /// Run a command on every instance over ssh.
    Ssh {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Run rsync against every instance; `HOST` in arguments becomes the host.
    Rsync {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Stop surplus instances, keeping the given number.
    Prune(PruneArgs),
}

#[derive(Debug, Args)]
struct PruneArgs {
    /// Instances to keep.
    target: usize,

    /// Terminate instead of stopping.
    #[arg(long, short = 'T')]
    terminate: bool,

    #[arg(long)]
    dry_run: bool,
}

impl ToolCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let filter = InstanceFilter::from_args(&self.filter, &ctx.settings)?;
        let ssh = ssh_args(&ctx.settings, self.user.as_deref());
        let threads = ctx.settings.get_or("TOOL_THREADS", DEFAULT_TOOL_THREADS)?;

        match self.command {
            ToolSubcommand::Instances => instances(&ctx, &filter).await,
            ToolSubcommand::Ssh { args } => {
                let hosts = hosts(&ctx, &filter).await?;
                run_commands(ssh_commands(&ssh, &hosts, &args), threads, true, true).await;
                Ok(())
            }
            ToolSubcommand::Rsync { args } => {
                let hosts = hosts(&ctx, &filter).await?;
                run_commands(rsync_commands(&ssh, &hosts, &args), threads, true, true).await;
                Ok(())
            }
            ToolSubcommand::Prune(args) => prune(&ctx, &filter, &ssh, threads, args).await,
        }
    }
}

async fn instances(ctx: &CommandContext, filter: &InstanceFilter) -> Result<()> {
    let compute = ctx.compute().await?;
    let now = Utc::now();
    let selected = filter.select(compute.as_ref(), &ctx.retry()?).await?;
    let rows: Vec<_> = selected.iter().map(|i| InstanceRow::new(i, now)).collect();
    print_table(&rows);
    Ok(())
}

async fn hosts(ctx: &CommandContext, filter: &InstanceFilter) -> Result<Vec<String>, CliError> {
    let compute = ctx.compute().await?;
    let selected = filter.select(compute.as_ref(), &ctx.retry()?).await?;
    Ok(selected.into_iter().map(|i| i.public_dns_name).collect())
}

fn default_identity() -> String {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".ssh").join("id_rsa"))
        .unwrap_or_else(|| PathBuf::from(".ssh/id_rsa"))
        .to_string_lossy()
        .into_owned()
}

/// Base ssh invocation: no host key prompts, quiet, fixed identity.
pub fn ssh_args(settings: &Settings, user: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = [
        "ssh",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "LogLevel=quiet",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();

    if let Some(user) = user.or_else(|| settings.get("SSH_USER")) {
        args.extend(["-o".to_string(), format!("User={user}")]);
    }
    args.push("-i".to_string());
    args.push(
        settings
            .get("SSH_IDENTITY")
            .map(str::to_string)
            .unwrap_or_else(default_identity),
    );
    args
}

/// One `(host, argv)` per host running `remote` over ssh.
pub fn ssh_commands(ssh: &[String], hosts: &[String], remote: &[String]) -> Vec<(String, Vec<String>)> {
    hosts
        .iter()
        .map(|host| {
            let mut cmd = ssh.to_vec();
            cmd.push(host.clone());
            cmd.extend(remote.iter().cloned());
            (host.clone(), cmd)
        })
        .collect()
}

/// One `(host, argv)` per host running rsync over the ssh transport.
pub fn rsync_commands(ssh: &[String], hosts: &[String], args: &[String]) -> Vec<(String, Vec<String>)> {
    let transport = ssh.join(" ");
    hosts
        .iter()
        .map(|host| {
            let mut cmd = vec!["rsync".to_string(), "-e".to_string(), transport.clone()];
            cmd.extend(args.iter().map(|a| a.replace(HOST_MACRO, host)));
            (host.clone(), cmd)
        })
        .collect()
}

/// Run every command with at most `threads` in flight; returns
/// `(host, output)` in completion order.
pub async fn run_commands(
    commands: Vec<(String, Vec<String>)>,
    threads: usize,
    show_output: bool,
    capture_stderr: bool,
) -> Vec<(String, String)> {
    let permits = Arc::new(Semaphore::new(threads.max(1)));
    let results = Arc::new(Mutex::new(Vec::with_capacity(commands.len())));
    let mut set = JoinSet::new();

    for (host, argv) in commands {
        let permits = Arc::clone(&permits);
        let results = Arc::clone(&results);
        set.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let output = command_output(&argv, capture_stderr).await;

            let mut results = results.lock().await;
            if show_output {
                print!("------- {host}\n{output}");
                if !output.ends_with('\n') {
                    println!();
                }
            }
            results.push((host, output));
        });
    }
    while set.join_next().await.is_some() {}

    let collected = std::mem::take(&mut *results.lock().await);
    collected
}

async fn command_output(argv: &[String], capture_stderr: bool) -> String {
    let Some((program, args)) = argv.split_first() else {
        return String::new();
    };
    debug!(command = ?argv, "Running");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(if capture_stderr { Stdio::piped() } else { Stdio::null() })
        .output()
        .await;
    match output {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            text
        }
        Err(e) => format!("failed to run {program}: {e}\n"),
    }
}

/// Prune rank from a host's report: the last completion time, or one of
/// the `SMALL`/`BIG` markers.
pub fn rank(report: &str) -> i64 {
    match report.trim() {
        "SMALL" => RANK_SMALL,
        "BIG" => RANK_BIG,
        other => other.parse().unwrap_or(RANK_SMALL),
    }
}

/// Hosts to stop so that `target` remain, highest rank first.
pub fn surplus(reports: &[(String, String)], target: usize) -> Vec<String> {
    let mut ranked: Vec<(i64, &str)> = reports
        .iter()
        .map(|(host, report)| (rank(report), host.as_str()))
        .collect();
    ranked.sort_by(|a, b| b.cmp(a));
    for (rank, host) in &ranked {
        debug!(host, rank, "Prune rank");
    }

    let excess = ranked.len().saturating_sub(target);
    ranked
        .into_iter()
        .take(excess)
        .map(|(_, host)| host.to_string())
        .collect()
}

/// Remote probe: `SMALL` before the first completion, the last completion
/// time while the agent runs, `BIG` once it has exited.
fn prune_probe(pidfile: &str) -> Vec<String> {
    format!(
        "if ! [ -f task_last ]; then echo SMALL; \
         elif [ -f {pidfile} ]; then cat task_last; \
         else echo BIG; fi"
    )
    .split(' ')
    .map(str::to_string)
    .collect()
}

async fn prune(
    ctx: &CommandContext,
    filter: &InstanceFilter,
    ssh: &[String],
    threads: usize,
    args: PruneArgs,
) -> Result<()> {
    let pidfile = ctx
        .settings
        .get("REMOTE_PIDFILE")
        .unwrap_or(DEFAULT_REMOTE_PIDFILE);
    let compute = ctx.compute().await?;
    let retry = ctx.retry()?;

    let selected = filter.select(compute.as_ref(), &retry).await?;
    let hosts: Vec<String> = selected.iter().map(|i| i.public_dns_name.clone()).collect();
    let reports = run_commands(
        ssh_commands(ssh, &hosts, &prune_probe(pidfile)),
        threads,
        false,
        false,
    )
    .await;

    let mut ranked: Vec<_> = reports.iter().map(|(h, r)| (rank(r), h.clone())).collect();
    ranked.sort_by(|a, b| b.cmp(a));
    print_heading("Prune ranking");
    for (rank, host) in &ranked {
        println!("  {rank} {host}");
    }

    let doomed: HashSet<String> = surplus(&reports, args.target).into_iter().collect();
    if doomed.is_empty() {
        return Ok(());
    }
    print_heading("Shutdown list");
    for host in &doomed {
        println!("  {host}");
    }

    let ids: Vec<String> = selected
        .into_iter()
        .filter(|i| doomed.contains(&i.public_dns_name))
        .map(|i| i.id)
        .collect();
    shutdown(compute.as_ref(), &ids, args.terminate, args.dry_run, ctx).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case("SMALL\n", RANK_SMALL)]
    #[case("BIG\n", RANK_BIG)]
    #[case("1700000000\n", 1_700_000_000)]
    #[case("", RANK_SMALL)]
    #[case("garbage", RANK_SMALL)]
    fn test_rank(#[case] report: &str, #[case] expected: i64) {
        assert_eq!(rank(report), expected);
    }

    #[test]
    fn test_surplus_keeps_target() {
        let reports = vec![
            ("a".to_string(), "100\n".to_string()),
            ("b".to_string(), "BIG\n".to_string()),
            ("c".to_string(), "SMALL\n".to_string()),
            ("d".to_string(), "200\n".to_string()),
        ];
        assert_eq!(surplus(&reports, 2), ["b", "d"]);
        assert!(surplus(&reports, 4).is_empty());
        assert!(surplus(&reports, 10).is_empty());
        assert_eq!(surplus(&reports, 0).len(), 4);
    }

    #[test]
    fn test_ssh_args() {
        let settings =
            Settings::parse_with("SSH_USER=render\nSSH_IDENTITY=/keys/farm\n", |_| None);
        let args = ssh_args(&settings, None);
        assert_eq!(args[0], "ssh");
        assert!(args.windows(2).any(|w| w == ["-o", "User=render"]));
        assert_eq!(&args[args.len() - 2..], ["-i", "/keys/farm"]);

        let args = ssh_args(&settings, Some("admin"));
        assert!(args.windows(2).any(|w| w == ["-o", "User=admin"]));
    }

    #[test]
    fn test_command_builders() {
        let ssh = strings(&["ssh", "-i", "/k"]);
        let hosts = strings(&["h1", "h2"]);

        let cmds = ssh_commands(&ssh, &hosts, &strings(&["cat", "task_count"]));
        assert_eq!(cmds[1].0, "h2");
        assert_eq!(cmds[1].1, ["ssh", "-i", "/k", "h2", "cat", "task_count"]);

        let cmds = rsync_commands(&ssh, &hosts, &strings(&["-a", "HOST:/mnt/out/", "out/HOST/"]));
        assert_eq!(
            cmds[0].1,
            ["rsync", "-e", "ssh -i /k", "-a", "h1:/mnt/out/", "out/h1/"]
        );
    }

    #[test]
    fn test_prune_probe() {
        let probe = prune_probe("framefarm.pid").join(" ");
        assert!(probe.contains("elif [ -f framefarm.pid ]; then cat task_last;"));
    }

    #[tokio::test]
    async fn test_run_commands_collects_every_host() {
        let commands: Vec<_> = (0..5)
            .map(|n| {
                (
                    format!("host{n}"),
                    strings(&["sh", "-c", &format!("echo out{n}; echo err{n} >&2")]),
                )
            })
            .collect();

        let mut results = run_commands(commands, 2, false, true).await;
        results.sort();
        assert_eq!(results.len(), 5);
        assert_eq!(results[0], ("host0".to_string(), "out0\nerr0\n".to_string()));

        let results = run_commands(
            vec![("h".to_string(), strings(&["sh", "-c", "echo out; echo err >&2"]))],
            4,
            false,
            false,
        )
        .await;
        assert_eq!(results[0].1, "out\n");
    }

    #[tokio::test]
    async fn test_run_commands_reports_spawn_failure() {
        let results = run_commands(
            vec![("h".to_string(), strings(&["/nonexistent/farmctl-test"]))],
            1,
            false,
            true,
        )
        .await;
        assert!(results[0].1.starts_with("failed to run"));
    }
}
