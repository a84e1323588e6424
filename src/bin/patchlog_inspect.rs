//! Read-only inspector for patch log regions.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use patchwork::patch::log::{read_region_header, scan_region, LogBlockView, RegionHeader};
use patchwork::primitives::io::{FileIo, StdFileIo};
use patchwork::{BlockId, PatchOp, PatchworkError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "patchlog-inspect",
    version,
    about = "Inspect the on-disk patch log of a write-back region",
    disable_help_subcommand = true
)]
struct Cli {
    /// Path of the patch log file.
    log: PathBuf,

    /// Tracing filter directive.
    #[arg(long, env = "PATCHWORK_LOG", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the region header.
    Header,
    /// List occupied log blocks, oldest first.
    Blocks,
    /// Dump logged patches, optionally for a single block.
    Patches {
        #[arg(long)]
        block: Option<u64>,
        /// Show copy payloads as hex.
        #[arg(long)]
        hex: bool,
    },
    /// Summarize patch runs per block version.
    Summary,
}

fn print_section(title: &str) {
    println!();
    println!("─── {} {}", title, "─".repeat(55usize.saturating_sub(title.len())));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn load(path: &PathBuf) -> Result<(StdFileIo, Vec<LogBlockView>, RegionHeader)> {
    if !path.exists() {
        return Err(PatchworkError::InvalidOwned(format!(
            "{} does not exist",
            path.display()
        )));
    }
    let io = StdFileIo::open(path)?;
    let header = read_region_header(&io)?;
    let mut views = scan_region(&io, &header)?;
    views.sort_by_key(|view| view.log_seq);
    Ok((io, views, header))
}

fn describe(op: &PatchOp, hex_payload: bool) -> String {
    match op {
        PatchOp::Copy { dest_offset, data } => {
            if hex_payload {
                format!("copy {} bytes @{} [{}]", data.len(), dest_offset, hex::encode(data))
            } else {
                format!("copy {} bytes @{}", data.len(), dest_offset)
            }
        }
        PatchOp::Move {
            dest_offset,
            src_offset,
            len,
        } => format!("move {len} bytes {src_offset} -> {dest_offset}"),
        PatchOp::LeafRemove { timestamp, key } => {
            format!("leaf remove key={} ts={}", hex::encode(key), timestamp.0)
        }
        PatchOp::LeafErasePresence { key } => {
            format!("leaf erase key={}", hex::encode(key))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let (io, views, header) = load(&cli.log)?;
    match cli.command {
        Command::Header => {
            print_section("Region");
            print_field("File Size", format!("{} bytes", io.len()?));
            print_field("Block Size", header.config.block_size);
            print_field("Log Blocks", header.config.log_blocks);
            print_field("Max Dirty Blocks", header.config.max_dirty_blocks);
            print_field("Salt", format!("{:#018x}", header.salt));
            print_field("Occupied", views.len());
        }
        Command::Blocks => {
            print_section("Log Blocks");
            for view in &views {
                println!(
                    "  slot {:>5}  seq {:>8}  used {:>6}  patches {:>5}",
                    view.slot,
                    view.log_seq,
                    view.used,
                    view.patches.len()
                );
            }
        }
        Command::Patches { block, hex } => {
            print_section("Patches");
            for view in &views {
                for patch in &view.patches {
                    if block.is_some_and(|id| BlockId(id) != patch.block_id) {
                        continue;
                    }
                    println!(
                        "  [slot {}] block {} seq {} #{}: {}",
                        view.slot,
                        patch.block_id,
                        patch.block_seq,
                        patch.counter.0,
                        describe(&patch.op, hex)
                    );
                }
            }
        }
        Command::Summary => {
            let mut runs: BTreeMap<(BlockId, u64), Vec<u32>> = BTreeMap::new();
            for patch in views.iter().flat_map(|view| view.patches.iter()) {
                runs.entry((patch.block_id, patch.block_seq.0))
                    .or_default()
                    .push(patch.counter.0);
            }
            print_section("Runs");
            let mut partial = 0usize;
            for ((block, seq), mut counters) in runs {
                counters.sort_unstable();
                let contiguous = counters
                    .iter()
                    .enumerate()
                    .all(|(i, counter)| *counter as usize == i + 1);
                if !contiguous {
                    partial += 1;
                }
                println!(
                    "  block {:>8} seq {:>8}: {} patches{}",
                    block,
                    seq,
                    counters.len(),
                    if contiguous { "" } else { " (partial)" }
                );
            }
            print_field("Partial Runs", partial);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = patchwork::logging::init_logging(&cli.log_level) {
        eprintln!("error: {err}");
        process::exit(2);
    }
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
