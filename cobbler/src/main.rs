//! `cobbler`: run coding-agent cycles on isolated git trails.
//!
//! State lives under `.cobbler/` in the repository root; configuration in
//! `cobbler.toml` (written with defaults on first use).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cobbler::core::types::CyclePhase;
use cobbler::cycle::CycleReport;
use cobbler::error::CobblerError;
use cobbler::exit_codes;
use cobbler::io::agent::CommandAgent;
use cobbler::io::config::load_or_create_config;
use cobbler::io::init::CobblerPaths;
use cobbler::lifecycle::{MergeKind, TrailSummary};
use cobbler::logging;
use cobbler::recovery::Recovery;
use cobbler::Orchestrator;

#[derive(Parser)]
#[command(
    name = "cobbler",
    version,
    about = "Generation-trail orchestrator for coding agents"
)]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(short = 'C', long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `cobbler.toml` if missing and create the `.cobbler/` layout.
    Init,
    /// Destroy every trail, the scratch directory and tracker state.
    Reset,
    /// Manage trails.
    #[command(subcommand)]
    Trail(TrailCommand),
    /// Run a single cycle step on the active trail.
    #[command(subcommand)]
    Cycle(CycleCommand),
    /// Manage the task tracker.
    #[command(subcommand)]
    Tracker(TrackerCommand),
    /// Print agent prompts without invoking the agent.
    #[command(subcommand)]
    Prompt(PromptCommand),
    /// Size reports for the active worktree.
    #[command(subcommand)]
    Stats(StatsCommand),
    /// Cross-reference documentation with task history.
    Analyze(JsonArgs),
}

#[derive(Subcommand)]
enum TrailCommand {
    /// Create a trail and make it active.
    Start { name: String },
    /// Run cycles on the active trail (0 or omitted: configured default).
    Run { cycles: Option<u32> },
    /// Resume an interrupted trail from its checkpoint.
    Resume {
        /// Adopt a HEAD that does not match the checkpoint.
        #[arg(long)]
        force: bool,
    },
    /// Merge a trail into its base branch (default: the active trail).
    Stop { name: Option<String> },
    /// List trails.
    List(JsonArgs),
    /// Make another trail active.
    Switch { name: String },
    /// Destroy a trail's branch, worktree and state.
    Reset { name: String },
}

#[derive(Subcommand)]
enum CycleCommand {
    /// Run only the Measure step.
    Measure,
    /// Run only the Stitch step.
    Stitch,
    /// Delete agent prompts, outputs and logs.
    ResetScratch,
}

#[derive(Subcommand)]
enum TrackerCommand {
    /// Create the `.cobbler/` layout and git exclude entry.
    Init,
    /// Archive a trail's tasks and start with an empty tracker.
    Reset { name: Option<String> },
}

#[derive(Subcommand)]
enum PromptCommand {
    /// Print the Measure prompt.
    Measure,
    /// Print the Stitch prompt.
    Stitch {
        /// Task to render (default: the next task Stitch would run).
        #[arg(long)]
        task: Option<String>,
    },
}

#[derive(Subcommand)]
enum StatsCommand {
    /// Lines of code per extension and markdown word counts.
    Loc(JsonArgs),
    /// Estimated tokens of prompt-attached files.
    Tokens(JsonArgs),
}

#[derive(Args)]
struct JsonArgs {
    /// Print JSON instead of text.
    #[arg(long)]
    json: bool,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_code(&err));
        }
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match CobblerError::find(err) {
        Some(CobblerError::StaleCheckpoint { .. }) => exit_codes::STALE,
        Some(CobblerError::TrailBusy { .. }) => exit_codes::BUSY,
        _ => exit_codes::INVALID,
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::fs::canonicalize(&cli.root)
        .with_context(|| format!("resolve root {}", cli.root.display()))?;
    let config = load_or_create_config(&CobblerPaths::new(&root).config_path)?;
    let agent = CommandAgent::new(config.agent.command.clone())?;
    let orch = Orchestrator::new(root, config, agent)?;

    match cli.command {
        Command::Init => {
            let outcome = orch.init()?;
            println!(
                "initialized {} (exclude entry {})",
                orch.paths().state_dir.display(),
                if outcome.exclude_added { "added" } else { "present" }
            );
        }
        Command::Reset => {
            let names = orch.reset_all()?;
            println!("reset {} trail(s)", names.len());
        }
        Command::Trail(cmd) => return cmd_trail(&orch, cmd),
        Command::Cycle(cmd) => return cmd_cycle(&orch, cmd),
        Command::Tracker(TrackerCommand::Init) => {
            orch.init()?;
            println!("tracker ready at {}", orch.paths().state_dir.display());
        }
        Command::Tracker(TrackerCommand::Reset { name }) => {
            match orch.reset_tracker(name.as_deref())? {
                Some(archive) => println!("tasks archived to {}", archive.display()),
                None => println!("tracker reset (nothing to archive)"),
            }
        }
        Command::Prompt(PromptCommand::Measure) => print!("{}", orch.measure_prompt()?),
        Command::Prompt(PromptCommand::Stitch { task }) => {
            print!("{}", orch.stitch_prompt(task.as_deref())?);
        }
        Command::Stats(StatsCommand::Loc(args)) => {
            let report = orch.loc_stats()?;
            if args.json {
                print_json(&report)?;
            } else {
                for (ext, stats) in &report.by_extension {
                    println!("{ext:>10} {:>6} files {:>8} lines", stats.files, stats.lines);
                }
                println!("{:>10} {:>21} lines", "total", report.total_lines);
                for doc in &report.docs {
                    println!("{} ({} words)", doc.path, doc.words);
                }
            }
        }
        Command::Stats(StatsCommand::Tokens(args)) => {
            let report = orch.token_stats()?;
            if args.json {
                print_json(&report)?;
            } else {
                for entry in report.files.iter().chain(report.measure_prompt.as_ref()) {
                    println!("{:>8} {}", entry.tokens, entry.name);
                }
                println!("{:>8} total (estimated, bytes / 4)", report.total_tokens);
            }
        }
        Command::Analyze(args) => {
            let findings = orch.analyze()?;
            if args.json {
                print_json(&findings)?;
            } else {
                for finding in &findings {
                    println!("{finding}");
                }
                if findings.is_empty() {
                    println!("no findings");
                }
            }
            if !findings.is_empty() {
                return Ok(exit_codes::FINDINGS);
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_trail(orch: &Orchestrator<CommandAgent>, cmd: TrailCommand) -> Result<i32> {
    match cmd {
        TrailCommand::Start { name } => {
            let outcome = orch.start(&name)?;
            if let Some(commit) = &outcome.parked {
                println!("parked previous trail at {}", short(commit));
            }
            println!(
                "started trail {} on {} from {} ({})",
                outcome.name,
                outcome.branch,
                outcome.base_branch,
                short(&outcome.commit)
            );
            println!("worktree: {}", outcome.worktree.display());
        }
        TrailCommand::Run { cycles } => {
            let outcome = orch.run(cycles)?;
            print_cycles(&outcome.cycles);
            println!(
                "trail {}: {}/{} cycles, {} tasks ({} done, {} failed)",
                outcome.name,
                outcome.cycles_completed,
                outcome.cycle_budget,
                outcome.counts.total(),
                outcome.counts.done,
                outcome.counts.failed
            );
            if outcome.cycles.is_empty() {
                return Ok(exit_codes::FINDINGS);
            }
        }
        TrailCommand::Resume { force } => {
            let outcome = orch.resume(force)?;
            let how = match &outcome.recovery {
                Recovery::Clean => "checkpoint clean".to_string(),
                Recovery::RolledBack { task_id, discarded } => {
                    format!("rolled back commit {} of task {task_id}", short(discarded))
                }
                Recovery::Forced { previous } => {
                    format!("adopted HEAD over checkpoint {}", short(previous))
                }
            };
            let phase = match outcome.phase {
                CyclePhase::Measure => "measure",
                CyclePhase::Stitch => "stitch",
            };
            println!(
                "resumed trail {} at cycle {} ({phase}): {how}",
                outcome.name, outcome.cycle
            );
            if !outcome.in_flight.is_empty() {
                println!("re-executing: {}", outcome.in_flight.join(", "));
            }
            print_cycles(&outcome.cycles);
            println!(
                "trail {}: {}/{} cycles",
                outcome.name, outcome.cycles_completed, outcome.cycle_budget
            );
        }
        TrailCommand::Stop { name } => {
            let outcome = orch.stop(name.as_deref())?;
            let how = match outcome.merge {
                MergeKind::FastForward => "fast-forward",
                MergeKind::MergeCommit => "merge commit",
            };
            println!(
                "stopped trail {} after {} cycles ({how} {})",
                outcome.name,
                outcome.cycles_completed,
                short(&outcome.merge_commit)
            );
        }
        TrailCommand::List(args) => {
            let rows = orch.list()?;
            if args.json {
                print_json(&rows)?;
            } else if rows.is_empty() {
                println!("no trails");
            } else {
                for row in &rows {
                    println!("{}", list_line(row));
                }
            }
        }
        TrailCommand::Switch { name } => {
            let outcome = orch.switch(&name)?;
            if let Some(commit) = &outcome.parked {
                println!("parked previous trail at {}", short(commit));
            }
            if outcome.recreated_worktree {
                println!("re-created worktree for {}", outcome.to);
            }
            println!("active trail: {}", outcome.to);
        }
        TrailCommand::Reset { name } => {
            let outcome = orch.reset_trail(&name)?;
            if outcome.existed {
                println!("reset trail {}", outcome.name);
            } else {
                println!("trail {} does not exist; nothing to do", outcome.name);
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_cycle(orch: &Orchestrator<CommandAgent>, cmd: CycleCommand) -> Result<i32> {
    match cmd {
        CycleCommand::Measure => {
            let report = orch.measure_once()?;
            println!(
                "cycle {} of trail {}: proposed {}",
                report.cycle,
                report.name,
                list_or_none(&report.proposed)
            );
            if report.proposed.is_empty() {
                return Ok(exit_codes::FINDINGS);
            }
        }
        CycleCommand::Stitch => {
            let report = orch.stitch_once()?;
            print_cycles(std::slice::from_ref(&report));
            if report.results.is_empty() {
                return Ok(exit_codes::FINDINGS);
            }
        }
        CycleCommand::ResetScratch => {
            if orch.reset_scratch()? {
                println!("scratch directory removed");
            } else {
                println!("no scratch directory");
            }
        }
    }
    Ok(exit_codes::OK)
}

fn print_cycles(reports: &[CycleReport]) {
    for report in reports {
        println!(
            "cycle {} [{:?}]: proposed {}",
            report.index,
            report.status,
            list_or_none(&report.proposed)
        );
        for result in &report.results {
            let commit = result.commit.as_deref().map(short).unwrap_or("-");
            println!(
                "  {} {:?} {commit} {}",
                result.task_id, result.outcome, result.detail
            );
        }
    }
}

fn list_line(row: &TrailSummary) -> String {
    format!(
        "{} {:<16} {:<11} cycles {}/{} tasks {} (done {}, failed {}){}",
        if row.active { "*" } else { " " },
        row.name,
        row.state.as_str(),
        row.cycles_completed,
        row.cycle_budget,
        row.tasks.total(),
        row.tasks.done,
        row.tasks.failed,
        if row.worktree_present { "" } else { " [no worktree]" }
    )
}

fn list_or_none(ids: &[String]) -> String {
    if ids.is_empty() {
        "none".to_string()
    } else {
        ids.join(", ")
    }
}

fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize json")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trail_run_count() {
        let cli = Cli::parse_from(["cobbler", "trail", "run", "3"]);
        assert!(matches!(
            cli.command,
            Command::Trail(TrailCommand::Run { cycles: Some(3) })
        ));
        let cli = Cli::parse_from(["cobbler", "trail", "run"]);
        assert!(matches!(
            cli.command,
            Command::Trail(TrailCommand::Run { cycles: None })
        ));
    }

    #[test]
    fn parse_resume_force_and_global_root() {
        let cli = Cli::parse_from(["cobbler", "trail", "resume", "--force", "-C", "/tmp/repo"]);
        assert!(matches!(
            cli.command,
            Command::Trail(TrailCommand::Resume { force: true })
        ));
        assert_eq!(cli.root, PathBuf::from("/tmp/repo"));
    }

    #[test]
    fn parse_prompt_stitch_task() {
        let cli = Cli::parse_from(["cobbler", "prompt", "stitch", "--task", "t1"]);
        match cli.command {
            Command::Prompt(PromptCommand::Stitch { task }) => {
                assert_eq!(task.as_deref(), Some("t1"));
            }
            _ => panic!("expected prompt stitch"),
        }
    }

    #[test]
    fn parse_cycle_reset_scratch() {
        let cli = Cli::parse_from(["cobbler", "cycle", "reset-scratch"]);
        assert!(matches!(
            cli.command,
            Command::Cycle(CycleCommand::ResetScratch)
        ));
    }

    #[test]
    fn typed_errors_map_to_exit_codes() {
        let stale = anyhow::Error::new(CobblerError::StaleCheckpoint {
            trail: "t".to_string(),
            expected: "a".to_string(),
            found: "b".to_string(),
        })
        .context("resume");
        assert_eq!(exit_code(&stale), exit_codes::STALE);
        let busy = anyhow::Error::new(CobblerError::TrailBusy {
            name: "t".to_string(),
            detail: "locked".to_string(),
        });
        assert_eq!(exit_code(&busy), exit_codes::BUSY);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), exit_codes::INVALID);
    }

    #[test]
    fn short_sha_truncates() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }
}
