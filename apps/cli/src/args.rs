use std::env;
use std::path::PathBuf;

#[derive(Debug, Default, PartialEq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub status: bool,
}

pub fn parse_args() -> Result<CliArgs, String> {
    parse_from(env::args().skip(1))
}

fn parse_from(args: impl IntoIterator<Item = String>) -> Result<CliArgs, String> {
    let mut args = args.into_iter();
    let mut parsed = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| "missing value for --config".to_string())?;
                parsed.config = Some(PathBuf::from(value));
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| "missing value for --data-dir".to_string())?;
                parsed.data_dir = Some(PathBuf::from(value));
            }
            "--status" => {
                parsed.status = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                return Err(format!("unknown argument: {arg}"));
            }
        }
    }

    Ok(parsed)
}

pub fn print_help() {
    println!(
        "Budget Monitor\n\n\
Usage:\n  budget-monitor [--config <path>] [--data-dir <path>] [--status]\n\n\
Options:\n  --config <path>    Config file (default: <data dir>/config.toml)\n  --data-dir <path>  Directory for the database and default config\n  --status           Print live status and budget verdict as JSON, then exit\n  -h, --help         Show this help message\n"
    );
}
