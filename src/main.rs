use chrono::Utc;
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

mod cli;
mod config;

use cli::Cli;
use cli::commands::{AddArgs, Commands};
use config::Config;
use recurrer::calculator::upcoming;
use recurrer::clock::SystemClock;
use recurrer::domain::{Cadence, CadenceFields, NewRule, RecurrenceRule, RuleStatus, RuleTemplate};
use recurrer::ledger::JsonlLedger;
use recurrer::session::{DueRuleSession, Transition};
use recurrer::store::{RuleStore, SqliteRuleStore};

fn setup_logging(config: &Config) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("recurrer")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("recurrer.log");

    // Setup env_logger with file output; RUST_LOG wins over the config level
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    log_builder(config, env_logger::Env::default())
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn log_builder<'a>(config: &'a Config, env: env_logger::Env<'a>) -> env_logger::Builder {
    env_logger::Builder::from_env(env.default_filter_or(config.log_filter()))
}

struct App {
    config: Config,
    store: Arc<SqliteRuleStore>,
    ledger: Arc<JsonlLedger>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let store = SqliteRuleStore::open_at(&config.storage.data_dir)
            .with_context(|| format!("Failed to open rule store in {}", config.storage.data_dir.display()))?;
        let ledger_path = config.storage.ledger_path();
        let ledger = JsonlLedger::open(&ledger_path)
            .with_context(|| format!("Failed to open ledger {}", ledger_path.display()))?;
        Ok(Self {
            config,
            store: Arc::new(store),
            ledger: Arc::new(ledger),
        })
    }
}

async fn run_application(cli: &Cli, app: &App) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        None | Some(Commands::Due) => handle_due_command(app).await,
        Some(Commands::Add(args)) => handle_add_command(args, app).await,
        Some(Commands::List { status }) => handle_list_command(status.as_deref(), app).await,
        Some(Commands::Show { id, count }) => handle_show_command(id, *count, app).await,
        Some(Commands::Remove { id }) => handle_remove_command(id, app).await,
        Some(Commands::Pause { id }) => handle_pause_command(id, app).await,
        Some(Commands::Resume { id }) => handle_resume_command(id, app).await,
        Some(Commands::Review) => handle_review_command(app).await,
        Some(Commands::Ledger { rule }) => handle_ledger_command(rule.as_deref(), app),
    }
}

fn print_rule(rule: &RecurrenceRule) {
    let status = match rule.status {
        RuleStatus::Active => rule.status.as_str().green(),
        RuleStatus::Paused => rule.status.as_str().yellow(),
    };
    println!(
        "{}  {}  {:>10.2} {}  {}  next {}  [{}]",
        rule.id.bold(),
        rule.template.category.cyan(),
        rule.template.amount,
        rule.template.currency,
        rule.cadence.describe(),
        rule.next_run_at.format("%Y-%m-%d %H:%M"),
        status
    );
}

async fn handle_add_command(args: &AddArgs, app: &App) -> Result<()> {
    info!("Adding {} rule for {}", args.frequency, args.category);

    let cadence = Cadence::from_fields(&CadenceFields {
        frequency_type: args.frequency.clone(),
        interval_value: args.interval,
        weekly_day_of_week: args.weekday,
        monthly_day_of_month: args.day,
        is_last_day_of_month: Some(args.last_day),
    })?;

    let template = RuleTemplate {
        amount: args.amount,
        category: args.category.clone(),
        currency: args.currency.clone(),
        note: args.note.clone(),
        device_name: args.device.clone(),
    };

    let mut new_rule = NewRule::new(cadence, template);
    new_rule.start_date = args.start;
    new_rule.end_date = args.end;
    new_rule.timezone = args.timezone.clone();

    let rule = app.store.create(new_rule.into_rule(Utc::now())).await?;
    println!("{} {}", "Created:".green(), rule.id);
    print_rule(&rule);
    Ok(())
}

async fn handle_list_command(status: Option<&str>, app: &App) -> Result<()> {
    let filter = status.map(RuleStatus::from_str).transpose()?;
    let rules = app.store.list_all().await?;
    let rules: Vec<_> = rules
        .into_iter()
        .filter(|r| filter.is_none_or(|s| r.status == s))
        .collect();

    if rules.is_empty() {
        println!("{}", "No rules".dimmed());
    }
    for rule in &rules {
        print_rule(rule);
    }
    Ok(())
}

async fn handle_due_command(app: &App) -> Result<()> {
    let due = app.store.list_due(Utc::now()).await?;
    if due.is_empty() {
        println!("{}", "Nothing due".green());
        return Ok(());
    }
    println!("{} {}", due.len().to_string().bold(), "rule(s) due:".yellow());
    for rule in &due {
        print_rule(rule);
    }
    Ok(())
}

async fn handle_show_command(id: &str, count: Option<usize>, app: &App) -> Result<()> {
    let rule = app
        .store
        .get(id)
        .await?
        .ok_or_else(|| eyre::eyre!("Rule not found: {}", id))?;

    print_rule(&rule);
    if let Some(last) = rule.last_run_at {
        println!("  last run   {}", last.format("%Y-%m-%d %H:%M"));
    }
    if let Some(start) = rule.start_date {
        println!("  start      {}", start);
    }
    if let Some(end) = rule.end_date {
        let ended = if rule.has_ended(Utc::now()) { " (ended)" } else { "" };
        println!("  end        {}{}", end, ended.red());
    }
    if let Some(tz) = &rule.timezone {
        println!("  timezone   {}", tz);
    }
    if let Some(note) = &rule.template.note {
        println!("  note       {}", note);
    }

    let count = count.unwrap_or(app.config.scheduler.preview_count);
    if count > 0 {
        println!("  upcoming:");
        println!("    {}", rule.next_run_at.format("%Y-%m-%d %H:%M %a"));
        for at in upcoming(&rule.cadence, rule.next_run_at, count.saturating_sub(1))? {
            println!("    {}", at.format("%Y-%m-%d %H:%M %a"));
        }
    }
    Ok(())
}

async fn handle_remove_command(id: &str, app: &App) -> Result<()> {
    info!("Removing rule: {}", id);
    app.store.delete(id).await?;
    println!("{} {}", "Removed:".red(), id);
    Ok(())
}

async fn handle_pause_command(id: &str, app: &App) -> Result<()> {
    info!("Pausing rule: {}", id);
    let rule = app.store.pause(id).await?;
    println!("{} {}", "Paused:".yellow(), rule.id);
    Ok(())
}

async fn handle_resume_command(id: &str, app: &App) -> Result<()> {
    info!("Resuming rule: {}", id);
    let rule = app.store.resume(id).await?;
    println!("{} {}", "Resumed:".green(), rule.id);
    Ok(())
}

async fn handle_review_command(app: &App) -> Result<()> {
    let mut session = DueRuleSession::with_config(
        app.store.clone(),
        app.ledger.clone(),
        Arc::new(SystemClock),
        app.config.scheduler.session_config(),
    );

    session.refresh().await?;
    if !session.is_visible() {
        println!("{}", "Nothing due".green());
        return Ok(());
    }

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(rule) = session.current() {
        let (position, total) = session.position().unwrap_or((0, 0));
        println!();
        println!("{}", format!("[{}/{}]", position, total).dimmed());
        print_rule(rule);
        stdout
            .write_all(b"(e)xecute, (s)kip, (d)efer, (q)uit: ")
            .await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            session.dismiss();
            break;
        };

        let outcome = match line.trim() {
            "e" | "execute" => session.execute().await,
            "s" | "skip" => session.skip().await,
            "d" | "defer" => session.defer().await,
            "q" | "quit" => {
                session.dismiss();
                println!("{}", "Dismissed; remaining rules stay due".yellow());
                break;
            }
            other => {
                println!("{} {}", "Unknown choice:".red(), other);
                continue;
            }
        };

        match outcome {
            Ok(Transition::Held { reason }) => println!("{} {}", "Not applied, try again:".red(), reason),
            Ok(Transition::Closed) => println!("{}", "All due rules handled".green()),
            Ok(Transition::Advanced { .. }) => {}
            Err(e) => println!("{} {}", "Error:".red(), e),
        }
    }

    Ok(())
}

fn handle_ledger_command(rule: Option<&str>, app: &App) -> Result<()> {
    let entries = app.ledger.entries()?;
    let entries: Vec<_> = entries
        .iter()
        .filter(|e| rule.is_none_or(|id| e.rule_id == id))
        .collect();

    if entries.is_empty() {
        println!("{}", "No entries".dimmed());
    }
    for entry in entries {
        println!(
            "{}  {}  {:>10.2} {}  {}  {}",
            entry.spending_time.format("%Y-%m-%d %H:%M"),
            entry.category.cyan(),
            entry.amount,
            entry.currency,
            entry.rule_id.dimmed(),
            entry.note.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration first so its log level can seed the logger
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(&config).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    let app = App::open(config)?;

    // Run the main application logic
    run_application(&cli, &app).await.context("Application failed")?;

    Ok(())
}
