//! Work queue commands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use framefarm_cloud::{create_queue, open_queue, WorkQueue};
use framefarm_retry::RetryExecutor;
use rand::seq::SliceRandom;

use crate::error::CliError;
use crate::output::{print_info, print_success};

use super::CommandContext;

/// Placeholder for the frame range of a task.
pub const FRAME_MACRO: &str = "$FRAME";

/// Work queue commands.
#[derive(Debug, Args)]
pub struct WorkCommand {
    #[command(subcommand)]
    command: WorkSubcommand,
}

#[derive(Debug, Subcommand)]
enum WorkSubcommand {
    /// Build render tasks from a script template and queue them.
    Push(PushArgs),

    /// Show how many tasks are queued.
    Status,

    /// Drop all queued tasks.
    Reset(ResetArgs),
}

#[derive(Debug, Args)]
struct PushArgs {
    /// Task script template; `$FRAME` becomes the frame range.
    #[arg(long, short = 'T')]
    task_script: PathBuf,

    /// First frame.
    #[arg(long, short = 's')]
    start: u32,

    /// Last frame (inclusive).
    #[arg(long, short = 'e')]
    end: u32,

    /// Frames per task.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    task_size: u32,

    /// Split every frame into this many columns of tiles.
    #[arg(long, default_value_t = 0)]
    subdiv_x: u32,

    /// Split every frame into this many rows of tiles.
    #[arg(long, default_value_t = 0)]
    subdiv_y: u32,

    /// Queue tasks in random order.
    #[arg(long)]
    randomize: bool,

    /// Print the tasks without queueing them.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ResetArgs {
    /// Delete the queue itself, not just its tasks.
    #[arg(long)]
    hard: bool,
}

impl WorkCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            WorkSubcommand::Push(args) => push(ctx, args).await,
            WorkSubcommand::Status => status(ctx).await,
            WorkSubcommand::Reset(args) => reset(ctx, args).await,
        }
    }
}

/// How a frame range is cut into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPlan {
    pub start: u32,
    pub end: u32,
    pub task_size: u32,
    pub subdiv_x: u32,
    pub subdiv_y: u32,
}

impl TaskPlan {
    fn subdivided(&self) -> bool {
        self.subdiv_x > 0 && self.subdiv_y > 0
    }
}

/// A tile bound, always printed with a decimal point (`0.0`, `0.5`).
fn fraction(value: f64) -> String {
    format!("{value:?}")
}

/// Tile macro substitutions, column-major.
fn tiles(subdiv_x: u32, subdiv_y: u32) -> Vec<[(&'static str, String); 4]> {
    let (x_step, y_step) = (1.0 / f64::from(subdiv_x), 1.0 / f64::from(subdiv_y));
    let mut tiles = Vec::new();
    for x in 0..subdiv_x {
        for y in 0..subdiv_y {
            tiles.push([
                ("$SF_MIN_X", fraction(f64::from(x) * x_step)),
                ("$SF_MAX_X", fraction(f64::from(x + 1) * x_step)),
                ("$SF_MIN_Y", fraction(f64::from(y) * y_step)),
                ("$SF_MAX_Y", fraction(f64::from(y + 1) * y_step)),
            ]);
        }
    }
    tiles
}

/// Expand `template` into one task per frame chunk (and tile).
pub fn build_tasks(template: &str, plan: &TaskPlan) -> Vec<String> {
    let tiles = if plan.subdivided() {
        tiles(plan.subdiv_x, plan.subdiv_y)
    } else {
        Vec::new()
    };

    let mut tasks = Vec::new();
    let step = plan.task_size.max(1);
    let mut first = plan.start;
    while first <= plan.end {
        let last = first.saturating_add(step - 1).min(plan.end);
        let script = template.replace(FRAME_MACRO, &format!("-s {first} -e {last} -j 1"));

        if tiles.is_empty() {
            tasks.push(script);
        } else {
            for tile in &tiles {
                let mut tile_script = script.clone();
                for (macro_name, value) in tile {
                    tile_script = tile_script.replace(macro_name, value);
                }
                tasks.push(tile_script);
            }
        }

        match last.checked_add(1) {
            Some(next) => first = next,
            None => break,
        }
    }
    tasks
}

/// Queue every task, each push under the retry policy.
pub async fn enqueue_all(
    queue: &dyn WorkQueue,
    tasks: &[String],
    retry: &RetryExecutor,
) -> Result<usize, CliError> {
    for task in tasks {
        retry.run(|| queue.push(task)).await?;
    }
    Ok(tasks.len())
}

async fn push(ctx: CommandContext, args: PushArgs) -> Result<()> {
    let template = std::fs::read_to_string(&args.task_script)
        .with_context(|| format!("failed to read task script {}", args.task_script.display()))?;

    let plan = TaskPlan {
        start: args.start,
        end: args.end,
        task_size: args.task_size,
        subdiv_x: args.subdiv_x,
        subdiv_y: args.subdiv_y,
    };
    let mut tasks = build_tasks(&template, &plan);
    if tasks.is_empty() {
        return Err(CliError::Usage(format!(
            "no tasks: end frame {} is before start frame {}",
            args.end, args.start
        ))
        .into());
    }
    if args.randomize {
        tasks.shuffle(&mut rand::rng());
    }

    for task in &tasks {
        print!("{task}");
        if !task.ends_with('\n') {
            println!();
        }
    }

    if args.dry_run {
        print_info(&format!("Dry run: {} tasks not queued", tasks.len()));
        return Ok(());
    }

    let retry = ctx.retry()?;
    let url = ctx.work_queue()?;
    let options = ctx.queue_options()?;
    let queue = retry.run(|| create_queue(url, &options)).await.map_err(CliError::from)?;
    let queued = enqueue_all(queue.as_ref(), &tasks, &retry).await?;
    print_success(&format!("Queued {queued} tasks on {}", queue.describe()));
    Ok(())
}

async fn open(ctx: &CommandContext) -> Result<std::sync::Arc<dyn WorkQueue>, CliError> {
    let retry = ctx.retry()?;
    let url = ctx.work_queue()?;
    let options = ctx.queue_options()?;
    Ok(retry.run(|| open_queue(url, &options)).await?)
}

async fn status(ctx: CommandContext) -> Result<()> {
    let queue = open(&ctx).await?;
    let count = ctx.retry()?.run(|| queue.count()).await.map_err(CliError::from)?;
    println!("Queued tasks: {count}");
    Ok(())
}

async fn reset(ctx: CommandContext, args: ResetArgs) -> Result<()> {
    let queue = open(&ctx).await?;
    let retry = ctx.retry()?;
    if args.hard {
        retry.run(|| queue.destroy()).await.map_err(CliError::from)?;
        print_success(&format!("Deleted queue {}", queue.describe()));
    } else {
        retry.run(|| queue.clear()).await.map_err(CliError::from)?;
        print_success(&format!("Cleared queue {}", queue.describe()));
    }
    Ok(())
}
