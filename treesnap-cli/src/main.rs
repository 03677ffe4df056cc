use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use treesnap_core::{ApplyOptions, CopyOptions, MinimizeOptions, ScanOptions};

#[derive(Parser)]
#[command(name = "treesnap", version, about = "Capture, minimize, restore and cheaply copy directory trees")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Scan a tree and write its gzip-compressed mtree manifest
    Generate {
        root: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        /// Add every file's content to this reference store
        #[arg(long)]
        reference_store: Option<PathBuf>,
        /// Minimize the tree after the manifest is written
        #[arg(long, default_value_t = false)]
        minimize: bool,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long, default_value_t = false)]
        progress: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove symlinks, empty files and empty directories from a tree
    Minimize {
        root: PathBuf,
        /// Also remove the root .ref anchor
        #[arg(long, default_value_t = false)]
        remove_anchor: bool,
    },
    /// Rebuild a tree from a manifest and a reference store
    Apply {
        manifest: PathBuf,
        dest: PathBuf,
        reference_store: Option<PathBuf>,
        /// Do not re-create recorded hard links
        #[arg(long, default_value_t = false)]
        no_hard_links: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Copy a tree, hard-linking files where possible
    CheapCopy {
        #[arg(long, default_value_t = false)]
        usrmerge: bool,
        /// Copy file contents instead of hard-linking
        #[arg(long, default_value_t = false)]
        copy: bool,
        source: PathBuf,
        dest: PathBuf,
    },
    /// Compare a tree against a manifest
    Verify { manifest: PathBuf, root: PathBuf },
}

fn init_logging() {
    let format = tracing_subscriber::fmt::format().without_time().with_target(false).compact();
    let filter = EnvFilter::builder().with_default_directive(LevelFilter::WARN.into()).from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}

/// Summaries go to stdout as JSON with `--json`, otherwise to stderr as one
/// `key: value` line per field.
fn print_summary<T: Serialize>(summary: &T, json: bool) -> Result<()> {
    let value = serde_json::to_value(summary)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    match value {
        serde_json::Value::Object(fields) => {
            for (key, v) in fields {
                match v {
                    serde_json::Value::Object(inner) => {
                        for (k, v) in inner {
                            eprintln!("{}.{}: {}", key, k, v);
                        }
                    }
                    serde_json::Value::Null => {}
                    v => eprintln!("{}: {}", key, v),
                }
            }
        }
        v => eprintln!("{}", v),
    }
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Generate { root, output, reference_store, minimize, exclude, progress, json } => {
            let opts = ScanOptions { reference_store, exclude, progress, minimize, ..ScanOptions::default() };
            let summary = treesnap_core::generate(&root, &output, &opts)?;
            print_summary(&summary, json)?;
        }
        Cmd::Minimize { root, remove_anchor } => {
            let summary = treesnap_core::minimize(&root, &MinimizeOptions { keep_anchor: !remove_anchor })?;
            print_summary(&summary, false)?;
        }
        Cmd::Apply { manifest, dest, reference_store, no_hard_links, json } => {
            let opts = ApplyOptions { reference_store, hard_links: !no_hard_links };
            let summary = treesnap_core::apply(&manifest, &dest, &opts)?;
            print_summary(&summary, json)?;
        }
        Cmd::CheapCopy { usrmerge, copy, source, dest } => {
            let opts = CopyOptions { usrmerge, force_copy: copy };
            let summary = treesnap_core::cheap_copy(&source, &dest, &opts)?;
            print_summary(&summary, false)?;
        }
        Cmd::Verify { manifest, root } => {
            let report = treesnap_core::verify(&manifest, &root)?;
            if !report.is_ok() {
                for m in &report.mismatches {
                    println!("{}: {}", m.path, m.what);
                }
                bail!("{} mismatches against {}", report.mismatches.len(), manifest.display());
            }
            println!("OK");
        }
    }
    Ok(())
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
