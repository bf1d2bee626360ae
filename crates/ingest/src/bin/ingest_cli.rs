use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use budget_core::{SourceCursor, SourceFormat, TokenUsage};
use ingest::{SourceHandle, StreamParser, detect_format};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("usage: ingest_cli <path|-> [claude|codex]");
        std::process::exit(2);
    }

    let path = &args[1];
    let format = match args.get(2).map(String::as_str) {
        Some("claude") => SourceFormat::ClaudeJsonl,
        Some("codex") => SourceFormat::CodexJsonl,
        Some(other) => {
            eprintln!("unknown format: {}", other);
            std::process::exit(2);
        }
        None if path == "-" => SourceFormat::ClaudeJsonl,
        None => detect_format(Path::new(path)),
    };
    let reader: Box<dyn BufRead> = if path == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(path).unwrap_or_else(|err| {
            eprintln!("failed to open {}: {}", path, err);
            std::process::exit(1);
        });
        Box::new(BufReader::new(file))
    };

    let handle = SourceHandle {
        id: path.clone(),
        path: PathBuf::from(path),
        format,
    };
    let mut parser = StreamParser::new(&handle, &SourceCursor::default());
    let mut totals = TokenUsage::default();
    let mut events = 0u64;
    let mut errors = 0u64;
    for line in reader.lines() {
        let line = line.unwrap_or_else(|err| {
            eprintln!("failed to read {}: {}", path, err);
            std::process::exit(1);
        });
        let parsed = parser.parse_lines([line]);
        errors += parsed.errors.len() as u64;
        for event in parsed.events {
            events += 1;
            totals = totals.saturating_add(event.usage);
        }
    }

    println!("format {}", format);
    println!("events {}", events);
    println!("parse_errors {}", errors);
    println!("input_tokens {}", totals.input_tokens);
    println!("output_tokens {}", totals.output_tokens);
    println!("cache_read_tokens {}", totals.cache_read_tokens);
    println!("cache_creation_tokens {}", totals.cache_creation_tokens);
    println!("counted_tokens {}", totals.counted_tokens());
    if let Some(model) = parser.last_model() {
        println!("last_model {}", model);
    }
}
