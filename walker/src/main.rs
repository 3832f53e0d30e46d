//! Walker CLI: a thin shell over the walk store, plus the `drive` supervisor.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};

use walker::core::types::{CloseSignal, IssueStatus};
use walker::driver::{DriveOutcome, ShutdownFlags, drive};
use walker::exit_codes;
use walker::io::init::{InitOptions, init_walk};
use walker::io::store::{CreateIssue, WalkStore};
use walker::io::worker::CommandWorker;
use walker::report;

#[derive(Parser)]
#[command(
    name = "walker",
    version,
    about = "Autonomous investigation driver over a filesystem issue store"
)]
struct Cli {
    /// Walk directory (defaults to the current directory).
    #[arg(long, global = true, env = "WALK_DIR", default_value = ".")]
    walk: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold a new walk directory.
    Init {
        #[arg(long)]
        title: String,
        /// Investigation goals body.
        #[arg(long, default_value = "")]
        body: String,
    },
    /// Run the supervisor loop until the walk terminates.
    Drive,
    /// Create an open issue.
    Create {
        slug: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
        /// Issue type; derived from the title or slug prefix when omitted.
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long, default_value_t = 1)]
        priority: u32,
        /// Slugs that must close before this issue becomes ready.
        #[arg(long = "blocked-by")]
        blocked_by: Vec<String>,
        /// Provenance links to the issues this one was derived from.
        #[arg(long = "derived-from")]
        derived_from: Vec<String>,
    },
    /// Close an open issue.
    Close {
        slug: String,
        reason: String,
        /// routine | surprising | pivotal
        #[arg(long, default_value = "routine")]
        signal: String,
    },
    /// Append a timestamped comment to an issue.
    Comment { slug: String, text: String },
    /// List issues (open by default).
    List {
        #[arg(long)]
        closed: bool,
    },
    /// Show one issue.
    Show { slug: String },
    /// Print the ready queue.
    Ready,
    /// Bump an issue to the front of the ready queue.
    Bump { slug: String },
    /// Print walk status.
    Status,
    /// Print closure history grouped by epoch.
    History,
    /// Propose a memory for the next planning round.
    Propose { key: String, text: String },
    /// Promote a proposal into an alive memory.
    Accept { key: String },
    /// Drop a proposal.
    Discard { key: String },
    /// End an alive memory's lifetime at the current epoch.
    Forget { key: String },
}

fn main() {
    walker::logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let store = WalkStore::new(&cli.walk);
    match cli.command {
        Command::Init { title, body } => {
            let paths = init_walk(&cli.walk, &InitOptions { title, body })?;
            println!("initialised walk at {}", paths.walk_dir.display());
        }
        Command::Drive => {
            let walk = store.load_walk()?;
            let worker = Arc::new(CommandWorker::new(walk.config.worker_command.clone()));
            let flags = ShutdownFlags::install()?;
            return Ok(match drive(&cli.walk, worker, &flags)? {
                DriveOutcome::Finished(status) => {
                    println!("walk finished: {}", status.as_str());
                    exit_codes::OK
                }
                DriveOutcome::RestartRequested => exit_codes::RESTART,
            });
        }
        Command::Create {
            slug,
            title,
            body,
            kind,
            priority,
            blocked_by,
            derived_from,
        } => {
            let issue = store.create(&CreateIssue {
                slug,
                title,
                body,
                kind,
                priority,
                blocked_by,
                derived_from,
            })?;
            println!("created {}", issue.slug);
        }
        Command::Close {
            slug,
            reason,
            signal,
        } => {
            let signal = CloseSignal::parse(&signal)
                .ok_or_else(|| anyhow!("unknown signal '{signal}' (routine|surprising|pivotal)"))?;
            let closure = store.close(&slug, &reason, signal)?;
            println!("closed {slug} in epoch {}", closure.epoch);
        }
        Command::Comment { slug, text } => {
            store.add_comment(&slug, &text)?;
        }
        Command::List { closed } => {
            let status = if closed {
                IssueStatus::Closed
            } else {
                IssueStatus::Open
            };
            for issue in store.list(status)? {
                match &issue.closure {
                    Some(closure) => println!(
                        "{}  e{}  {}  {}",
                        issue.slug, closure.epoch, closure.signal.as_str(), issue.title
                    ),
                    None => println!("{}  p{}  {}", issue.slug, issue.priority, issue.title),
                }
            }
        }
        Command::Show { slug } => {
            let issue = store.show(&slug)?;
            print!("{}", render_issue(&issue));
        }
        Command::Ready => {
            for issue in store.ready_issues()? {
                println!("{}  p{}  {}", issue.slug, issue.priority, issue.title);
            }
        }
        Command::Bump { slug } => {
            store.bump(&slug)?;
        }
        Command::Status => {
            let walk = store.load_walk()?;
            print!("{}", report::render_status(&store, &walk)?);
        }
        Command::History => {
            print!("{}", report::render_history(&store)?);
        }
        Command::Propose { key, text } => {
            let proposed_by = std::env::var("WALK_ISSUE").ok();
            store.add_proposal(&key, &text, proposed_by.as_deref())?;
        }
        Command::Accept { key } => {
            let memory = store.accept_proposal(&key)?;
            println!("memory {} alive from epoch {}", memory.key, memory.alive_from);
        }
        Command::Discard { key } => {
            store.discard_proposal(&key)?;
        }
        Command::Forget { key } => {
            let killed_by = std::env::var("WALK_ISSUE").ok();
            store.forget_memory(&key, killed_by.as_deref())?;
        }
    }
    Ok(exit_codes::OK)
}

fn render_issue(issue: &walker::core::types::Issue) -> String {
    let mut buf = format!(
        "slug: {}\ntitle: {}\ntype: {}\npriority: {}\n",
        issue.slug, issue.title, issue.kind, issue.priority
    );
    if !issue.blocked_by.is_empty() {
        buf.push_str(&format!("blocked by: {}\n", issue.blocked_by.join(", ")));
    }
    if !issue.derived_from.is_empty() {
        buf.push_str(&format!("derived from: {}\n", issue.derived_from.join(", ")));
    }
    if issue.blocked_by_driver {
        buf.push_str("blocked by driver: yes\n");
    }
    match &issue.closure {
        Some(closure) => buf.push_str(&format!(
            "status: closed (epoch {}, signal {})\nreason: {}\n",
            closure.epoch,
            closure.signal.as_str(),
            closure.reason
        )),
        None => buf.push_str("status: open\n"),
    }
    if !issue.body.trim().is_empty() {
        buf.push_str(&format!("\n{}\n", issue.body.trim_end()));
    }
    buf
}
