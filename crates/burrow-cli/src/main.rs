//! burrow — headless driver for the burrow engine.
//!
//! Scans one directory through the background scheduler, the same way an
//! interactive front end would, and prints the visible entries.
//!
//! ```text
//! burrow [--flat N] [--all] [PATH]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use burrow_core::{Config, DirectoryEntry, Session};

const DEFAULT_LOG: &str = "/tmp/burrow.log";

/// Command line options.
#[derive(Debug, PartialEq, Eq)]
struct Options {
    path: Option<PathBuf>,
    flat: Option<usize>,
    all: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Options> {
    let mut options = Options {
        path: None,
        flat: None,
        all: false,
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--all" | "-a" => options.all = true,
            "--flat" => {
                let depth = args.next().context("--flat needs a depth")?;
                let depth = depth
                    .parse()
                    .with_context(|| format!("invalid depth: {depth}"))?;
                options.flat = Some(depth);
            }
            flag if flag.starts_with('-') => bail!("unknown option: {flag}"),
            _ if options.path.is_some() => bail!("only one path may be given"),
            _ => options.path = Some(PathBuf::from(arg)),
        }
    }
    Ok(options)
}

fn config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("burrow")
            .join("config.toml"),
    )
}

fn load_config(options: &Options) -> anyhow::Result<Config> {
    let mut config = match config_path().filter(|p| p.exists()) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    if options.all {
        config.browse.show_hidden = true;
    }
    if let Some(depth) = options.flat {
        config.browse.flat_depth = depth;
    }
    Ok(config)
}

/// Logs go to a file so they never mix with the listing.
fn init_logging() -> anyhow::Result<()> {
    let path = std::env::var_os("BURROW_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .init();
    Ok(())
}

/// One line per visible child: name, padding, info string.
fn render_listing(dir: &DirectoryEntry) -> Vec<String> {
    let rows: Vec<(String, String)> = dir
        .children()
        .iter()
        .map(|child| {
            let mut name = child.meta().display_name().to_string();
            if child.is_directory() {
                name.push('/');
            }
            (name, child.infostring())
        })
        .collect();
    let width = rows.iter().map(|(name, _)| name.chars().count()).max().unwrap_or(0);
    rows.into_iter()
        .map(|(name, info)| format!("{name:<width$} {info}").trim_end().to_string())
        .collect()
}

fn run(path: &Path, config: Config) -> anyhow::Result<Vec<String>> {
    let mut session = Session::init(config);
    let dir = session
        .open_tab(path)
        .with_context(|| format!("cannot open {}", path.display()))?;

    let mut ticks = 0u64;
    while session.has_work() {
        session.work();
        ticks += 1;
    }
    tracing::info!("{} loaded in {ticks} ticks", path.display());

    dir.borrow_mut().sort_if_outdated();
    let lines = render_listing(&dir.borrow());
    session.teardown();
    Ok(lines)
}

fn main() -> anyhow::Result<()> {
    let options = parse_args(std::env::args().skip(1))?;
    init_logging()?;

    let config = load_config(&options)?;
    let path = match options.path {
        Some(path) => path,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    for line in run(&path, config)? {
        println!("{line}");
    }
    Ok(())
}
