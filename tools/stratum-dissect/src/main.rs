//! Stratum dissector for minesploit relay captures.

mod capture;
mod dissect;

use anyhow::{Context, Result};
use capture::{CaptureReader, Source};
use clap::Parser;
use colored::Colorize;
use dissect::{Dissector, Kind};
use std::path::PathBuf;
use time::OffsetDateTime;

/// Pretty-print a Stratum capture written by `minesploit sniff --capture`
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON-lines capture file
    input: PathBuf,

    /// Only show messages sent by this side
    #[arg(short = 's', long, value_enum)]
    source: Option<Source>,

    /// Only show this method (e.g. mining.submit), including its responses
    #[arg(short = 'm', long)]
    method: Option<String>,

    /// Print the full JSON message under each line
    #[arg(short = 'j', long)]
    json: bool,

    /// Use absolute timestamps instead of relative (seconds from start)
    #[arg(short = 'a', long)]
    absolute_time: bool,

    /// Force color output even when not connected to a TTY
    #[arg(long)]
    force_color: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.force_color {
        colored::control::set_override(true);
    } else if args.no_color {
        colored::control::set_override(false);
    }

    let reader = CaptureReader::open(&args.input)
        .with_context(|| format!("Failed to open capture file: {:?}", args.input))?;

    let mut dissector = Dissector::new();
    let mut start: Option<OffsetDateTime> = None;
    let mut shown = 0usize;

    for record in reader {
        let record = record?;
        let origin = *start.get_or_insert(record.timestamp);

        // Dissect everything so request ids are tracked even when filtered out
        let dissected = dissector.dissect(&record);

        if args.source.is_some_and(|s| s != record.source) {
            continue;
        }
        if let Some(method) = &args.method {
            if dissected.method.as_deref() != Some(method.as_str()) {
                continue;
            }
        }

        let when = if args.absolute_time {
            record.timestamp.to_string()
        } else {
            format!("{:>10.3}", (record.timestamp - origin).as_seconds_f64())
        };
        let marker = match dissected.kind {
            Kind::Request => "→",
            Kind::Notification => "•",
            Kind::Response => "←",
        };
        println!("{} {} {}", when.dimmed(), marker, dissected);

        if args.json {
            println!("{}", serde_json::to_string_pretty(&record.message)?.dimmed());
        }
        shown += 1;
    }

    eprintln!("{} messages shown", shown);
    Ok(())
}
