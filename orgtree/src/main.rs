use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use clap::{Args, Parser, Subcommand};
use orgtree::{
    AgendaItem, AgendaRange, Document, DocumentParser, NomParser, PlanningKind, PositionId,
    RepeatConfig, RepeatStamp, Repeater, Timestamp, Timing, format_document, parse_timing, project,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Outline, agenda and repeater tooling for Org documents",
    version
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the heading outline of one or more Org files.
    Outline(OutlineArgs),

    /// List dated occurrences, repeaters expanded, within a day range.
    Agenda(AgendaArgs),

    /// Shift a repeating timestamp.
    Shift(ShiftArgs),

    /// Check property restrictions and priority cookies.
    Validate(ValidateArgs),

    /// Rewrite Org files in canonical form.
    Format(FormatArgs),
}

#[derive(Debug, Args)]
struct OutlineArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit the parsed documents as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// First day of the agenda (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last day of the agenda, inclusive. Defaults to `--from`.
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ShiftArgs {
    /// Timestamp with a repeater cookie, e.g. "<2024-01-31 Wed +1m>".
    timestamp: String,
    #[command(flatten)]
    target: ShiftTarget,
    /// Clamp month repeats to the last day of shorter months.
    #[arg(long)]
    clamp: bool,
    /// Carry overflowing days into the following month.
    #[arg(long)]
    shift_by_days: bool,
    /// Keep the day of month, skipping months that lack it.
    #[arg(long)]
    fixed_date: bool,
}

#[derive(Debug, Args)]
#[group(multiple = false)]
struct ShiftTarget {
    /// Apply the repeat interval this many times.
    #[arg(long)]
    count: Option<u32>,
    /// Latest occurrence at or before this instant (YYYY-MM-DD [HH:MM]).
    #[arg(long, value_parser = parse_instant)]
    until: Option<NaiveDateTime>,
    /// Earliest occurrence strictly after this instant.
    #[arg(long, value_parser = parse_instant)]
    after: Option<NaiveDateTime>,
    /// Instant `.+` and `++` repeaters measure from. Defaults to now.
    #[arg(long, value_parser = parse_instant)]
    reference: Option<NaiveDateTime>,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Outline(args) => handle_outline(args),
        Commands::Agenda(args) => handle_agenda(args),
        Commands::Shift(args) => handle_shift(args),
        Commands::Validate(args) => handle_validate(args),
        Commands::Format(args) => handle_format(args),
    }
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_documents(inputs: &[PathBuf]) -> Result<Vec<(PathBuf, Document)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let parser = NomParser;
    let mut parsed = Vec::with_capacity(expanded.len());
    for path in expanded {
        debug!(path = ?path, "parsing");
        let document = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        parsed.push((path, document));
    }
    Ok(parsed)
}

fn handle_outline(args: OutlineArgs) -> Result<()> {
    let OutlineArgs { inputs, json } = args;
    let parsed = load_documents(&inputs)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a Document,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, document)| JsonOutput {
                path: path.display().to_string(),
                document,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    for (idx, (path, document)) in parsed.iter().enumerate() {
        if parsed.len() > 1 {
            println!("== {} ==", path.display());
        }
        for line in outline_lines(document) {
            println!("{line}");
        }
        if parsed.len() > 1 && idx + 1 < parsed.len() {
            println!();
        }
    }
    Ok(())
}

/// One line per heading, indented by depth, carrying inherited and own tags.
fn outline_lines(document: &Document) -> Vec<String> {
    let mut lines = Vec::new();
    for (id, node) in document.headings() {
        let Some(heading) = node.heading.as_ref() else {
            continue;
        };
        let mut line = "  ".repeat(usize::from(heading.level.saturating_sub(1)));
        if let Some(keyword) = &heading.keyword {
            line.push_str(keyword);
            line.push(' ');
        }
        if heading.priority.is_set() {
            line.push_str(&format!("[#{}] ", heading.priority));
        }
        line.push_str(&heading.text);
        let tags = document.all_tags(id);
        if !tags.is_empty() {
            line.push_str(&format!(" {}", join_tags(tags.iter().map(|t| t.as_str()))));
        }
        lines.push(line);
    }
    lines
}

fn join_tags<'a>(tags: impl Iterator<Item = &'a str>) -> String {
    format!(":{}:", tags.collect::<Vec<_>>().join(":"))
}

fn handle_agenda(args: AgendaArgs) -> Result<()> {
    let AgendaArgs {
        inputs,
        from,
        to,
        json,
    } = args;

    let from = from.unwrap_or_else(|| Local::now().date_naive());
    let to = to.unwrap_or(from);
    if to < from {
        anyhow::bail!("--to {to} is before --from {from}");
    }
    let range = AgendaRange::new(from, to);

    let parsed = load_documents(&inputs)?;
    let mut items: Vec<(String, AgendaItem)> = Vec::new();
    for (path, document) in &parsed {
        let projected =
            project(document, &range).with_context(|| format!("expanding {:?}", path))?;
        debug!(path = ?path, items = projected.len(), "projected agenda");
        items.extend(
            projected
                .into_iter()
                .map(|item| (path.display().to_string(), item)),
        );
    }
    items.sort_by_key(|(_, item)| item.occurrence.start);

    if items.is_empty() {
        eprintln!("No agenda items between {from} and {to}.");
        return Ok(());
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonItem<'a> {
            path: &'a str,
            #[serde(flatten)]
            item: &'a AgendaItem,
        }

        let payload: Vec<JsonItem<'_>> = items
            .iter()
            .map(|(path, item)| JsonItem { path, item })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (_, item) in &items {
            println!("{}", agenda_line(item));
        }
    }
    Ok(())
}

fn agenda_line(item: &AgendaItem) -> String {
    let stamp = &item.occurrence;
    let time = stamp
        .time()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_default();
    let kind = match item.kind {
        PlanningKind::Scheduled => "SCHEDULED",
        PlanningKind::Deadline => "DEADLINE",
        PlanningKind::Closed => "CLOSED",
        PlanningKind::Event => "EVENT",
    };
    let keyword = item.keyword.as_deref().unwrap_or("");
    let tags = if item.tags.is_empty() {
        String::new()
    } else {
        format!(" {}", join_tags(item.tags.iter().map(|t| t.as_str())))
    };
    format!(
        "{} {:<5} {:<9} {:<8} {}{}",
        stamp.date(),
        time,
        kind,
        keyword,
        item.title,
        tags
    )
}

fn handle_shift(args: ShiftArgs) -> Result<()> {
    let shifted = shift_timestamp(&args)?;
    println!("{shifted}");
    Ok(())
}

fn shift_timestamp(args: &ShiftArgs) -> Result<Timestamp> {
    let raw = args.timestamp.trim();
    let text = if raw.starts_with(['<', '[']) {
        raw.to_string()
    } else {
        format!("<{raw}>")
    };
    let stamp = match parse_timing(&text).with_context(|| format!("reading {raw:?}"))? {
        Timing::Timestamp(ts) => ts,
        other => anyhow::bail!("expected a single timestamp, got {other}"),
    };

    let config = repeat_config(args);
    config.validate()?;
    let stamp = RepeatStamp::new(stamp, config);
    let target = &args.target;
    let shifted = if let Some(n) = target.count {
        stamp.shift_n(n)?
    } else if let Some(until) = target.until {
        stamp.shift_until(until)?
    } else if let Some(after) = target.after {
        stamp.shift_until_after(after)?
    } else {
        stamp.shift(target.reference)?
    };
    Ok(shifted.into_inner())
}

/// Explicit policy flags replace the default policy entirely.
fn repeat_config(args: &ShiftArgs) -> RepeatConfig {
    if !(args.clamp || args.shift_by_days || args.fixed_date) {
        return RepeatConfig::DEFAULT;
    }
    RepeatConfig {
        clamp_to_end_of_month: args.clamp,
        shift_by_days: args.shift_by_days,
        fixed_date: args.fixed_date,
    }
}

fn parse_instant(s: &str) -> Result<NaiveDateTime, String> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN)))
        .map_err(|_| format!("expected YYYY-MM-DD or YYYY-MM-DD HH:MM, got {s:?}"))
}

fn handle_validate(args: ValidateArgs) -> Result<()> {
    let parsed = load_documents(&args.inputs)?;
    let mut problems = 0;
    for (path, document) in &parsed {
        for problem in validation_problems(document) {
            println!("{}: {problem}", path.display());
            problems += 1;
        }
    }
    if problems > 0 {
        anyhow::bail!("{problems} problem(s) found");
    }
    eprintln!("{} file(s) valid", parsed.len());
    Ok(())
}

fn validation_problems(document: &Document) -> Vec<String> {
    let title = |id: PositionId| {
        document
            .node(id)
            .map(|n| n.title().to_string())
            .unwrap_or_default()
    };
    let mut out: Vec<String> = document
        .validate_properties()
        .into_iter()
        .map(|(id, err)| format!("{id} {:?}: {err}", title(id)))
        .collect();
    out.extend(
        document
            .validate_priorities()
            .into_iter()
            .map(|(id, err)| format!("{id} {:?}: {err}", title(id))),
    );
    out
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let parsed = load_documents(&inputs)?;
    let multiple = parsed.len() > 1;

    for (idx, (path, document)) in parsed.iter().enumerate() {
        let formatted = format_document(document);
        if in_place {
            fs::write(path, formatted.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
            debug!(path = ?path, "formatted in place");
            continue;
        }
        if multiple {
            if idx > 0 {
                println!();
            }
            println!("== {} ==", path.display());
        }
        print!("{formatted}");
    }
    Ok(())
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = ?canonical, "scanning directory");
            for file in collect_org_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org_file(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn is_org_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "org")
}

fn collect_org_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_org_file(&canonical) {
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgtree::parse_document;

    fn shift_args(timestamp: &str) -> ShiftArgs {
        ShiftArgs {
            timestamp: timestamp.to_string(),
            target: ShiftTarget {
                count: None,
                until: None,
                after: None,
                reference: None,
            },
            clamp: false,
            shift_by_days: false,
            fixed_date: false,
        }
    }

    #[test]
    fn expand_inputs_collects_org_files_recursively() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("projects/work");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(tmp.path().join("inbox.org"), "* Inbox").expect("write inbox");
        fs::write(nested.join("plan.org"), "* Plan").expect("write plan");
        fs::write(nested.join("notes.txt"), "not org").expect("write notes");

        let found = expand_inputs(&[tmp.path().to_path_buf()]).expect("expand");
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();

        assert_eq!(names.len(), 2);
        assert!(names.contains(&"inbox.org".to_string()));
        assert!(names.contains(&"plan.org".to_string()));
    }

    #[test]
    fn expand_inputs_deduplicates_overlapping_inputs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("inbox.org");
        fs::write(&file, "* Inbox").expect("write inbox");

        let found = expand_inputs(&[tmp.path().to_path_buf(), file]).expect("expand");

        assert_eq!(found.len(), 1);
    }

    #[test]
    fn expand_inputs_rejects_non_org_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("notes.md");
        fs::write(&file, "# notes").expect("write notes");

        assert!(expand_inputs(&[file]).is_err());
    }

    #[test]
    fn parse_instant_accepts_dates_and_times() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
        assert_eq!(parse_instant("2024-03-01"), Ok(day.and_time(NaiveTime::MIN)));
        assert_eq!(
            parse_instant("2024-03-01 09:30"),
            Ok(day.and_hms_opt(9, 30, 0).expect("time"))
        );
        assert!(parse_instant("March 1st").is_err());
    }

    #[test]
    fn shift_applies_count_with_default_policy() {
        let mut args = shift_args("2024-01-15 Mon +1w");
        args.target.count = Some(2);

        let shifted = shift_timestamp(&args).expect("shift");

        assert_eq!(shifted.date(), NaiveDate::from_ymd_opt(2024, 1, 29).expect("date"));
        assert!(shifted.active);
    }

    #[test]
    fn shift_with_clamp_flag_lands_on_month_end() {
        let mut args = shift_args("<2023-01-31 Tue +1m>");
        args.clamp = true;
        args.target.count = Some(1);

        let shifted = shift_timestamp(&args).expect("shift");

        assert_eq!(shifted.date(), NaiveDate::from_ymd_opt(2023, 2, 28).expect("date"));
    }

    #[test]
    fn shift_after_finds_first_later_occurrence() {
        let mut args = shift_args("<2024-01-01 Mon 08:00 +1d>");
        args.target.after = Some(parse_instant("2024-01-10 12:00").expect("instant"));

        let shifted = shift_timestamp(&args).expect("shift");

        assert_eq!(
            shifted.start,
            parse_instant("2024-01-11 08:00").expect("instant")
        );
    }

    #[test]
    fn shift_rejects_exclusive_policies_and_ranges() {
        let mut args = shift_args("<2024-01-31 Wed +1m>");
        args.shift_by_days = true;
        args.fixed_date = true;
        assert!(shift_timestamp(&args).is_err());

        let range = shift_args("<2024-01-01 Mon>--<2024-01-03 Wed>");
        assert!(shift_timestamp(&range).is_err());
    }

    #[test]
    fn outline_lines_indent_and_inherit_tags() {
        let document = parse_document(
            "#+FILETAGS: :home:\n* TODO [#A] Chores :weekly:\n** Laundry\n",
        )
        .expect("parse");

        let lines = outline_lines(&document);

        assert_eq!(
            lines,
            vec![
                "TODO [#A] Chores :home:weekly:".to_string(),
                "  Laundry :home:weekly:".to_string(),
            ]
        );
    }

    #[test]
    fn validation_reports_restricted_values_and_priorities() {
        let document = parse_document(
            "#+PRIORITIES: A C B\n\
             * Project\n\
             :PROPERTIES:\n\
             :Effort_ALL: 1h 2h\n\
             :END:\n\
             ** [#D] Task\n\
             :PROPERTIES:\n\
             :Effort: 3h\n\
             :END:\n",
        )
        .expect("parse");

        let problems = validation_problems(&document);

        assert_eq!(problems.len(), 2, "{problems:?}");
        assert!(problems.iter().all(|p| p.contains("\"Task\"")));
    }

    #[test]
    fn agenda_line_shows_date_kind_and_tags() {
        let document = parse_document(
            "* TODO Water plants :garden:\nSCHEDULED: <2024-05-06 Mon 07:30 +1w>\n",
        )
        .expect("parse");
        let day = NaiveDate::from_ymd_opt(2024, 5, 13).expect("date");

        let items = project(&document, &AgendaRange::day(day)).expect("project");

        assert_eq!(items.len(), 1);
        assert_eq!(
            agenda_line(&items[0]),
            "2024-05-13 07:30 SCHEDULED TODO     Water plants :garden:"
        );
    }
}
