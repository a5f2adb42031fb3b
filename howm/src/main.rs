use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use howm::Parsed;
use howm::calendar::{CalendarEvent, DesiredEvent, ScopeKey, SyncAction, plan_sync};
use howm::config::{Settings, SpeedTable};
use howm::crawler::{CrawledPage, crawl};
use howm::document::{DocumentSource, LineBuffer, LineItem, ScannedLine, scan_document};
use howm::period::Period;
use howm::recurrence::Occurrence;
use howm::sort::{Agendable, sort_agenda};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(
    name = "howm",
    about = "Task and event tooling for howm-style notes",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON settings file (speeds, sync defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List tasks and events ordered by urgency.
    Agenda(AgendaArgs),

    /// Show what occupies a single day: events, planned task lines and recorded work.
    Day(DayArgs),

    /// Expand the recurrence rules written in a file for one date.
    Recur(RecurArgs),

    /// Report every task or event marker that fails to parse.
    Check(CheckArgs),

    /// Plan the calendar changes needed to mirror the events of a file.
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
struct AgendaArgs {
    file: PathBuf,
    /// Reference time (YYYY-MM-DDTHH:MM:SS). Defaults to now.
    #[arg(long)]
    now: Option<NaiveDateTime>,
    /// Include entries that are currently hidden.
    #[arg(long)]
    all: bool,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct DayArgs {
    file: PathBuf,
    /// Day to project onto (YYYY-MM-DD).
    #[arg(long)]
    date: NaiveDate,
    /// Reference time for work still running. Defaults to now.
    #[arg(long)]
    now: Option<NaiveDateTime>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RecurArgs {
    file: PathBuf,
    #[arg(long)]
    date: NaiveDate,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct SyncArgs {
    file: PathBuf,
    /// JSON array of the calendar's current events for this file.
    #[arg(long)]
    existing: Option<PathBuf>,
    /// Project part of the scope key. Defaults to the configured project.
    #[arg(long)]
    project: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = load_settings(cli.config.as_deref())?;
    match cli.command {
        Commands::Agenda(args) => handle_agenda(args, &settings),
        Commands::Day(args) => handle_day(args),
        Commands::Recur(args) => handle_recur(args, &settings),
        Commands::Check(args) => handle_check(args),
        Commands::Sync(args) => handle_sync(args, &settings),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load(path),
        None => Ok(Settings::default()),
    }
}

fn read_document(path: &Path) -> Result<LineBuffer> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    Ok(LineBuffer::from_text(&text))
}

fn now_or_local(now: Option<NaiveDateTime>) -> NaiveDateTime {
    now.unwrap_or_else(|| Local::now().naive_local())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{}", json);
    Ok(())
}

fn parsed_links(scanned: &[ScannedLine]) -> impl Iterator<Item = (usize, &String, &Parsed)> {
    scanned.iter().flat_map(|line| {
        line.items.iter().filter_map(move |item| match item {
            LineItem::Link {
                text,
                parsed: Ok(parsed),
            } => Some((line.index, text, parsed)),
            _ => None,
        })
    })
}

/* ------------------------------- agenda ------------------------------- */

#[derive(Debug, Serialize)]
struct AgendaRow {
    line: usize,
    freshness: f64,
    item: Parsed,
}

fn agenda_rows(
    doc: &LineBuffer,
    now: NaiveDateTime,
    speeds: &SpeedTable,
    all: bool,
) -> Vec<AgendaRow> {
    let scanned = scan_document(doc);
    let mut items: Vec<(usize, Parsed)> = parsed_links(&scanned)
        .map(|(line, _, parsed)| (line, parsed.clone()))
        .collect();

    let mut parsed: Vec<Parsed> = items.iter().map(|(_, p)| p.clone()).collect();
    sort_agenda(&mut parsed, now, speeds);

    let mut rows = Vec::new();
    for item in parsed {
        let freshness = item.freshness(now, speeds);
        if !all && !freshness.is_finite() {
            continue;
        }
        let pos = items.iter().position(|(_, p)| *p == item);
        let line = pos.map(|i| items.remove(i).0).unwrap_or_default();
        rows.push(AgendaRow {
            line: line + 1,
            freshness,
            item,
        });
    }
    rows
}

fn handle_agenda(args: AgendaArgs, settings: &Settings) -> Result<()> {
    let doc = read_document(&args.file)?;
    let rows = agenda_rows(&doc, now_or_local(args.now), &settings.speeds, args.all);
    if args.json {
        return print_json(&rows);
    }
    for row in rows {
        let (status, raw) = match &row.item {
            Parsed::Task(t) => (t.status, t.raw.as_str()),
            Parsed::Event(e) => (row.item.status(), e.raw.as_str()),
        };
        println!(
            "{:>9.2} {:<9} {} (line {})",
            row.freshness,
            status.to_string(),
            raw,
            row.line
        );
    }
    Ok(())
}

/* --------------------------------- day --------------------------------- */

#[derive(Debug, Serialize, PartialEq)]
struct DayEntry {
    kind: &'static str,
    title: String,
    period: Period,
}

fn day_entries(doc: &LineBuffer, date: NaiveDate, now: NaiveDateTime) -> Vec<DayEntry> {
    let scanned = scan_document(doc);
    let mut entries = Vec::new();
    for line in &scanned {
        for item in &line.items {
            let (kind, title, period) = match item {
                LineItem::Link {
                    parsed: Ok(Parsed::Event(event)),
                    ..
                } => ("event", event.name.clone(), Period::from_event(event)),
                LineItem::TaskLine(task) => {
                    if let Some(log) = task.record_log() {
                        if let Some(period) = log.to_period_until(now).clip_to_day(date) {
                            entries.push(DayEntry {
                                kind: "record",
                                title: task.title.clone(),
                                period,
                            });
                        }
                    }
                    ("plan", task.title.clone(), task.planned_period())
                }
                _ => continue,
            };
            if let Some(period) = period.and_then(|p| p.clip_to_day(date)) {
                entries.push(DayEntry {
                    kind,
                    title,
                    period,
                });
            }
        }
    }
    entries.sort_by_key(|e| e.period.start);
    entries
}

fn handle_day(args: DayArgs) -> Result<()> {
    let doc = read_document(&args.file)?;
    let entries = day_entries(&doc, args.date, now_or_local(args.now));
    if args.json {
        return print_json(&entries);
    }
    for e in entries {
        println!(
            "{}-{} {:<6} {}",
            e.period.start.format("%H:%M"),
            e.period.end().format("%H:%M"),
            e.kind,
            e.title
        );
    }
    Ok(())
}

/* -------------------------------- recur -------------------------------- */

/// Every non-blank line stands for one page title.
fn pages_from(doc: &LineBuffer, project: &str) -> Vec<CrawledPage> {
    doc.lines()
        .into_iter()
        .filter(|line| !line.text.trim().is_empty())
        .map(|line| CrawledPage {
            title: line.text.trim().to_string(),
            links: Vec::new(),
            project: project.to_string(),
        })
        .collect()
}

fn handle_recur(args: RecurArgs, settings: &Settings) -> Result<()> {
    let doc = read_document(&args.file)?;
    let pages = pages_from(&doc, &settings.sync.default_project);
    let result = crawl(&pages, args.date);
    if args.json {
        return print_json(&result.found);
    }
    for found in &result.found {
        match &found.occurrence {
            Occurrence::Task(t) => println!("{}", t.raw),
            Occurrence::Event(e) => println!("{} {}-{}", e.name, e.start, e.end),
        }
    }
    Ok(())
}

/* -------------------------------- check -------------------------------- */

fn check_messages(doc: &LineBuffer) -> Vec<String> {
    scan_document(doc)
        .iter()
        .flat_map(|line| {
            line.errors()
                .map(|(text, err)| format!("line {}: [{}]: {}", line.index + 1, text, err))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn handle_check(args: CheckArgs) -> Result<()> {
    let doc = read_document(&args.file)?;
    let messages = check_messages(&doc);
    for message in &messages {
        eprintln!("{:?} {}", args.file, message);
    }
    if !messages.is_empty() {
        anyhow::bail!("{} malformed marker(s) in {:?}", messages.len(), args.file);
    }
    Ok(())
}

/* --------------------------------- sync --------------------------------- */

fn desired_events(doc: &LineBuffer) -> Vec<DesiredEvent> {
    let scanned = scan_document(doc);
    parsed_links(&scanned)
        .filter_map(|(_, text, parsed)| match parsed {
            Parsed::Event(event) => DesiredEvent::from_event(text.clone(), event),
            Parsed::Task(_) => None,
        })
        .collect()
}

fn handle_sync(args: SyncArgs, settings: &Settings) -> Result<()> {
    let doc = read_document(&args.file)?;
    let scope = ScopeKey {
        project: args
            .project
            .unwrap_or_else(|| settings.sync.default_project.clone()),
        title: args
            .file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let existing: Vec<CalendarEvent> = match &args.existing {
        Some(path) => {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing calendar events from {:?}", path))?
        }
        None => Vec::new(),
    };
    let actions: Vec<SyncAction> = plan_sync(&existing, &desired_events(&doc));
    tracing::info!(%scope, actions = actions.len(), "planned calendar sync");
    print_json(&actions)
}
