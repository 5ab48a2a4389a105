//! Skill-driven agent runner CLI.
//!
//! `run` executes one task, `chat` runs stdin tasks into a shared session,
//! and the remaining commands inspect skills, replay run logs and manage the
//! config file.

use std::env;
use std::io::{self as stdio, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use skillrun::exit_codes;
use skillrun::io::config::{
    AgentConfig, CONFIG_FILE_NAME, Credentials, Provider, discover_config_path, load_config,
    load_effective_config, write_default_config,
};
use skillrun::io::events::{EventRecord, read_events};
use skillrun::io::executor::ShellExecutor;
use skillrun::io::run_store::find_run_dir;
use skillrun::io::signals::{InterruptFlag, install_signal_handlers};
use skillrun::io::transcript::replay_transcript;
use skillrun::llm::router::ProviderRouter;
use skillrun::logging;
use skillrun::mcp::bridge::McpManager;
use skillrun::scheduler::{ProgressCallback, RunRequest, RunResult, Scheduler};
use skillrun::session::{ChatSession, SessionOptions};
use skillrun::skills::registry::prepare_skills;

#[derive(Parser)]
#[command(name = "skillrun", version, about = "Skill-driven agent runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task to completion.
    Run {
        task: String,
        #[arg(long)]
        skills_dir: Option<PathBuf>,
        #[arg(long, value_enum)]
        provider: Option<Provider>,
        /// Compose the first prompt and stop before calling the model.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        max_turns: Option<u32>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print each event type to stderr as it is recorded.
        #[arg(long)]
        progress: bool,
    },
    /// Read tasks from stdin, one per line, into a single session.
    Chat {
        #[arg(long)]
        skills_dir: Option<PathBuf>,
        #[arg(long, value_enum)]
        provider: Option<Provider>,
        #[arg(long)]
        max_turns: Option<u32>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        reload_skills_each_task: bool,
    },
    /// Inspect the skill catalog.
    Skills {
        #[command(subcommand)]
        command: SkillsCommand,
        #[arg(long, global = true)]
        skills_dir: Option<PathBuf>,
        #[arg(long, global = true)]
        config: Option<PathBuf>,
    },
    /// Print the event log (or transcript) of a previous run.
    Replay {
        run_id: String,
        #[arg(long)]
        transcript: bool,
        /// Print records exactly as stored.
        #[arg(long)]
        raw: bool,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Manage the config file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum SkillsCommand {
    List,
    Inspect {
        name: String,
        /// Print every body section.
        #[arg(long)]
        sections: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default config.
    Init {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate a config file.
    Validate {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the config file that would be used.
    Path,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task,
            skills_dir,
            provider,
            dry_run,
            max_turns,
            config,
            progress,
        } => {
            let request = RunRequest {
                skills_dir,
                provider,
                dry_run,
                max_turns,
                ..RunRequest::new(task)
            };
            cmd_run(config.as_deref(), &request, progress)
        }
        Command::Chat {
            skills_dir,
            provider,
            max_turns,
            config,
            reload_skills_each_task,
        } => cmd_chat(
            config.as_deref(),
            SessionOptions {
                skills_dir,
                provider,
                max_turns,
                reload_skills_each_task,
            },
        ),
        Command::Skills {
            command,
            skills_dir,
            config,
        } => cmd_skills(config.as_deref(), skills_dir, command),
        Command::Replay {
            run_id,
            transcript,
            raw,
            config,
        } => cmd_replay(config.as_deref(), &run_id, transcript, raw),
        Command::Config { command } => cmd_config(command),
    }
}

/// Collaborators built from the effective config and the environment.
struct Runtime {
    config: AgentConfig,
    provider: ProviderRouter,
    executor: ShellExecutor,
    interrupt: InterruptFlag,
}

impl Runtime {
    fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = load_effective_config(config_path)?;
        let workdir = env::current_dir().context("resolve working directory")?;
        let credentials = Credentials::discover(&config.model, &workdir);
        let provider = ProviderRouter::new(
            &credentials,
            Duration::from_secs(config.model.request_timeout_secs),
        )?;
        let executor = ShellExecutor::new(&config.runtime, workdir);
        let interrupt = InterruptFlag::new();
        install_signal_handlers(&interrupt)?;
        Ok(Self {
            config,
            provider,
            executor,
            interrupt,
        })
    }
}

fn progress_printer() -> ProgressCallback {
    Arc::new(|record: &EventRecord| eprintln!("[{}] {}", record.timestamp, record.event_type))
}

fn cmd_run(config_path: Option<&Path>, request: &RunRequest, progress: bool) -> Result<i32> {
    let runtime = Runtime::load(config_path)?;
    let mut tools = McpManager::new();
    let mut scheduler = Scheduler::new(&runtime.config, &runtime.provider, &runtime.executor)
        .with_tool_manager(&mut tools)
        .with_interrupt(runtime.interrupt.clone());
    if progress {
        scheduler = scheduler.with_progress(progress_printer());
    }
    let result = scheduler.run(request)?;
    print_result(&result);
    Ok(exit_code(&result))
}

fn cmd_chat(config_path: Option<&Path>, options: SessionOptions) -> Result<i32> {
    let runtime = Runtime::load(config_path)?;
    let mut tools = McpManager::new();
    let mut session = ChatSession::new(
        &runtime.config,
        &runtime.provider,
        &runtime.executor,
        options,
    )
    .with_tool_manager(&mut tools)
    .with_interrupt(runtime.interrupt.clone());
    println!("session {}", session.run_id());

    let stdin = stdio::stdin();
    let mut last = exit_codes::OK;
    loop {
        print!("> ");
        stdio::stdout().flush().context("flush stdout")?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).context("read task")? == 0 {
            break;
        }
        let task = line.trim();
        if task.is_empty() {
            continue;
        }
        if matches!(task, "exit" | "quit") || runtime.interrupt.is_requested() {
            break;
        }
        let result = session.run_task(task)?;
        print_result(&result);
        last = exit_code(&result);
        if runtime.interrupt.is_requested() {
            break;
        }
    }
    Ok(last)
}

fn cmd_skills(
    config_path: Option<&Path>,
    skills_dir: Option<PathBuf>,
    command: SkillsCommand,
) -> Result<i32> {
    let config = load_effective_config(config_path)?;
    let dir = skills_dir.unwrap_or(config.skills.dir);
    let prepared = prepare_skills(&dir)?;
    for failure in &prepared.parse_failures {
        eprintln!("skipped {}: {}", failure.skill_dir.display(), failure.error);
    }
    match command {
        SkillsCommand::List => {
            if prepared.catalog.is_empty() {
                println!("no skills in {}", prepared.skills_dir.display());
            }
            for entry in &prepared.catalog {
                println!("{}\t{}", entry.name, entry.description);
            }
        }
        SkillsCommand::Inspect { name, sections } => {
            let Some(skill) = prepared.by_name(&name) else {
                bail!("skill not found: {name}");
            };
            let meta = &skill.metadata;
            println!("name: {}", meta.name);
            println!("description: {}", meta.description);
            println!("version: {}", meta.version);
            println!("tags: {}", meta.tags.join(", "));
            println!("allowed_tools: {}", meta.allowed_tools.join(", "));
            println!("path: {}", skill.skill_md_path.display());
            println!("references: {}", skill.references.join(", "));
            println!("scripts: {}", skill.scripts.join(", "));
            if sections {
                for section in &skill.sections {
                    println!("\n## {}\n{}", section.title, section.content);
                }
            } else {
                let titles: Vec<&str> = skill
                    .sections
                    .iter()
                    .map(|section| section.title.as_str())
                    .collect();
                println!("sections: {}", titles.join(", "));
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_replay(config_path: Option<&Path>, run_id: &str, transcript: bool, raw: bool) -> Result<i32> {
    let config = load_effective_config(config_path)?;
    let run_dir = find_run_dir(&config.logging.jsonl_dir, run_id)?;
    if transcript {
        let path = run_dir.join(&config.logging.llm_transcript_filename);
        let blocks = replay_transcript(&path)?;
        if blocks.is_empty() {
            println!("no transcript at {}", path.display());
        }
        for block in blocks {
            println!("{block}");
        }
        return Ok(exit_codes::OK);
    }
    for record in read_events(&run_dir.join(skillrun::io::run_store::EVENTS_FILE))? {
        if raw {
            println!("{}", serde_json::to_string(&record)?);
        } else {
            println!(
                "{} {} {}",
                record.timestamp,
                record.event_type,
                serde_json::Value::Object(record.payload)
            );
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_config(command: ConfigCommand) -> Result<i32> {
    match command {
        ConfigCommand::Init { output, force } => {
            let path = output.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            write_default_config(&path, force)?;
            println!("{}", path.display());
        }
        ConfigCommand::Validate { file } => {
            // Both loaders validate.
            match file {
                Some(path) => {
                    if !path.exists() {
                        bail!("config file not found: {}", path.display());
                    }
                    load_config(&path)?;
                }
                None => {
                    load_effective_config(None)?;
                }
            }
            println!("config ok");
        }
        ConfigCommand::Path => match discover_config_path(None) {
            Some(path) => println!("{}", path.display()),
            None => println!("(defaults)"),
        },
    }
    Ok(exit_codes::OK)
}

fn exit_code(result: &RunResult) -> i32 {
    if result.is_success() {
        exit_codes::OK
    } else {
        exit_codes::RUN_FAILED
    }
}

fn print_result(result: &RunResult) {
    println!("run_id: {}", result.run_id);
    println!("status: {}", result.status.as_str());
    if let Some(reason) = result.failure {
        println!("failure: {reason}");
    }
    println!("message: {}", result.message);
    println!("events: {}", result.events_path.display());
    if let Some(path) = &result.transcript_path {
        println!("transcript: {}", path.display());
    }
    if let Some(path) = &result.final_summary_path {
        println!("final_summary: {}", path.display());
    }
    if let Some(summary) = &result.final_summary {
        println!("\n{summary}");
    }
}
