//! Binary entry point for tutorlog.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// CLI output goes to stdout/stderr directly
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, bail};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tutorlog::llm::{ChatReply, OpenAiTransport};
use tutorlog::models::{Actor, EventType};
use tutorlog::observability::{self, LoggingConfig};
use tutorlog::{
    AiClient, Event, ModelRouter, RateLimiter, RefreshScheduler, SkillService, SqliteStore,
    SummarizationService, Task, TutorConfig, TutorStore,
};

/// Tutorlog - tutoring event log with AI-maintained topic summaries.
#[derive(Parser)]
#[command(name = "tutorlog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "TUTORLOG_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Record a tutoring event.
    Log {
        /// Event content.
        content: String,

        /// Topic ids (repeatable).
        #[arg(short, long = "topic")]
        topics: Vec<String>,

        /// Skill ids (repeatable).
        #[arg(short, long = "skill")]
        skills: Vec<String>,

        /// Event type: chat, transcript, quiz, or assessment.
        #[arg(long, default_value = "chat")]
        event_type: String,

        /// Actor: student, tutor, or system.
        #[arg(long, default_value = "student")]
        actor: String,
    },

    /// Refresh topic summaries now.
    Refresh {
        /// Topic ids to refresh (default: topics with recent events).
        #[arg(short, long = "topic")]
        topics: Vec<String>,

        /// Ignore the cooldown window.
        #[arg(short, long)]
        force: bool,

        /// Look back this many hours when discovering topics.
        #[arg(long)]
        since_hours: Option<i64>,
    },

    /// List topics that need a refresh.
    Stale {
        /// Look back this many hours for topics without a summary.
        #[arg(long)]
        since_hours: Option<i64>,
    },

    /// Ask the tutor a question.
    Chat {
        /// The student message.
        message: String,

        /// Pre-assembled context passed to the model as is.
        #[arg(long)]
        context: Option<String>,

        /// Stream the reply as it arrives.
        #[arg(long)]
        stream: bool,

        /// Model to use instead of the chat route's default.
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Show model routes and fallback chains.
    Routes,

    /// Run the refresh scheduler until interrupted.
    Schedule {
        /// Seconds between cycles (default from configuration).
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

/// Main entry point.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let expose_metrics = matches!(cli.command, Commands::Schedule { .. });
    let _observability = match observability::init(
        &LoggingConfig::from_env(cli.verbose),
        &config.metrics,
        expose_metrics,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn load_config(path: Option<&str>) -> tutorlog::Result<TutorConfig> {
    match path {
        Some(path) => {
            let _ = dotenvy::dotenv();
            TutorConfig::load_from_file(Path::new(path))
        },
        None => Ok(TutorConfig::load_default()),
    }
}

/// Shared collaborators, built once per process.
struct App {
    config: TutorConfig,
    store: Arc<dyn TutorStore>,
    client: Arc<AiClient>,
}

impl App {
    fn build(config: TutorConfig) -> anyhow::Result<Self> {
        let store = SqliteStore::new(config.database_path())
            .with_context(|| format!("opening {}", config.database_path().display()))?;
        let client = AiClient::new(
            Arc::new(OpenAiTransport::from_config(&config.llm)),
            Arc::new(ModelRouter::from_config(&config.llm)),
            Arc::new(RateLimiter::new(config.llm.rate_limit_qps)),
            config.client_settings(),
        );
        Ok(Self {
            config,
            store: Arc::new(store),
            client: Arc::new(client),
        })
    }

    fn engine(&self) -> SummarizationService {
        SummarizationService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            self.config.summarization.clone(),
        )
    }
}

fn run_command(command: Commands, config: TutorConfig) -> anyhow::Result<()> {
    let app = App::build(config)?;
    match command {
        Commands::Log {
            content,
            topics,
            skills,
            event_type,
            actor,
        } => cmd_log(&app, content, topics, skills, &event_type, &actor),
        Commands::Refresh {
            topics,
            force,
            since_hours,
        } => cmd_refresh(&app, topics, force, since_hours),
        Commands::Stale { since_hours } => cmd_stale(&app, since_hours),
        Commands::Chat {
            message,
            context,
            stream,
            model,
        } => cmd_chat(&app, &message, context.as_deref(), stream, model.as_deref()),
        Commands::Routes => cmd_routes(&app),
        Commands::Schedule { interval_secs } => cmd_schedule(&app, interval_secs),
    }
}

fn cmd_log(
    app: &App,
    content: String,
    topics: Vec<String>,
    skills: Vec<String>,
    event_type: &str,
    actor: &str,
) -> anyhow::Result<()> {
    let Some(event_type) = EventType::parse(event_type) else {
        bail!("unknown event type '{event_type}'");
    };
    let Some(actor) = Actor::parse(actor) else {
        bail!("unknown actor '{actor}'");
    };

    let mut event = Event::new(content, event_type, actor);
    event.topics = topics;
    event.skills = skills;
    app.store.insert_event(&event)?;
    let queued = RefreshScheduler::new(Arc::new(app.engine())).on_event_created(&event);

    if !event.skills.is_empty() {
        let skills = SkillService::new(Arc::clone(&app.store), Arc::clone(&app.client));
        for skill in skills.update_skill_states(&event.skills, std::slice::from_ref(&event.event_id)) {
            println!("{}: mastery {:.2}", skill.skill_id, skill.p_mastery);
        }
    }

    println!("Event logged: {}", event.event_id);
    if !queued && !event.topics.is_empty() {
        println!("Run `tutorlog refresh` to fold it into topic summaries.");
    }
    Ok(())
}

fn cmd_refresh(
    app: &App,
    topics: Vec<String>,
    force: bool,
    since_hours: Option<i64>,
) -> anyhow::Result<()> {
    let engine = app.engine();
    let ids = (!topics.is_empty()).then_some(topics.as_slice());
    let results = engine.refresh_topic_summaries(ids, cutoff(since_hours), force)?;

    if results.is_empty() {
        println!("No topics to refresh.");
        return Ok(());
    }
    for (topic_id, outcome) in &results {
        match outcome {
            (Some(topic), Some(tokens)) => println!(
                "{topic_id}: updated to v{} ({} events, ~{tokens} tokens)",
                topic.summary_version(),
                topic.event_count
            ),
            (Some(topic), None) => println!("{topic_id}: unchanged at v{}", topic.summary_version()),
            (None, _) => println!("{topic_id}: failed (see audit log)"),
        }
    }
    Ok(())
}

fn cmd_stale(app: &App, since_hours: Option<i64>) -> anyhow::Result<()> {
    let stale = app.engine().topics_needing_refresh(cutoff(since_hours))?;
    if stale.is_empty() {
        println!("All topics are up to date.");
    }
    for topic_id in stale {
        println!("{topic_id}");
    }
    Ok(())
}

fn cmd_chat(
    app: &App,
    message: &str,
    context: Option<&str>,
    stream: bool,
    model: Option<&str>,
) -> anyhow::Result<()> {
    match app.client.chat(message, context, stream, model)? {
        ChatReply::Text(text) => println!("{text}"),
        ChatReply::Stream(fragments) => {
            let mut stdout = std::io::stdout().lock();
            for fragment in fragments {
                write!(stdout, "{}", fragment?)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        },
    }
    Ok(())
}

fn cmd_routes(app: &App) -> anyhow::Result<()> {
    let router = app.client.router();
    for task in Task::ALL {
        let route = router.get_route(task, None);
        println!(
            "{:<16} {:<20} budget={:<6} streaming={:<5} structured={:<5} fallbacks={}",
            task.as_str(),
            route.model,
            route.token_budget,
            route.supports_streaming,
            route.supports_structured_output,
            router.get_fallback_chain(task).join(" -> ")
        );
    }
    Ok(())
}

fn cmd_schedule(app: &App, interval_secs: Option<u64>) -> anyhow::Result<()> {
    let mut scheduler = RefreshScheduler::new(Arc::new(app.engine()));
    if let Some(secs) = interval_secs {
        scheduler = scheduler.with_interval(Duration::from_secs(secs.max(1)));
    }

    let (interrupt, interrupted) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = interrupt.send(());
    })
    .context("installing Ctrl-C handler")?;

    scheduler.start()?;
    println!("Refresh scheduler running; press Ctrl-C to stop.");
    let _ = interrupted.recv();
    scheduler.stop();
    Ok(())
}

fn cutoff(since_hours: Option<i64>) -> Option<chrono::DateTime<Utc>> {
    since_hours
        .and_then(ChronoDuration::try_hours)
        .map(|lookback| Utc::now() - lookback)
}
