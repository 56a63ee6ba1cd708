use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use adrescue::cartridge::CartridgeType;
use adrescue::sink::DirectorySink;
use adrescue::tape::{BlockMap, FULL_SECTION_SIZE};
use adrescue::{extract_dumps, gaps};

#[derive(Parser)]
#[command(name = "adrescue", version, about = "Recover Retrospect backups from OnStream ADR tape dumps")]
struct Cli {
    /// Log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Cartridge {
    Adr30,
    Adr50,
}

impl From<Cartridge> for CartridgeType {
    fn from(c: Cartridge) -> Self {
        match c {
            Cartridge::Adr30 => CartridgeType::Adr30,
            Cartridge::Adr50 => CartridgeType::Adr50,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract files and snapshots from one or more dump files
    Extract {
        /// Raw dump files, in capture order
        #[arg(required = true, num_args = 1..)]
        dumps: Vec<PathBuf>,
        #[arg(short, long, value_enum)]
        cartridge: Cartridge,
        /// Output directory for recovered files
        #[arg(short, long)]
        output: PathBuf,
        /// Output directory for snapshot metadata (default: <output>.snapshots)
        #[arg(long)]
        snapshot_output: Option<PathBuf>,
    },
    /// Report contiguous runs of missing tape blocks
    Gaps {
        #[arg(required = true, num_args = 1..)]
        dumps: Vec<PathBuf>,
        #[arg(short, long, value_enum)]
        cartridge: Cartridge,
        /// Emit the report as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Frame census of a single dump file
    Info {
        dump: PathBuf,
        #[arg(short, long, value_enum)]
        cartridge: Cartridge,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .init();

    match cli.command {
        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { dumps, cartridge, output, snapshot_output } => {
            let snapshot_output = snapshot_output.unwrap_or_else(|| {
                let mut p = output.clone().into_os_string();
                p.push(".snapshots");
                PathBuf::from(p)
            });

            let mut files = DirectorySink::new(&output)?;
            let mut snapshots = DirectorySink::new(&snapshot_output)?;
            let summary = extract_dumps(&dumps, cartridge.into(), &mut files, &mut snapshots)?;

            println!("── Extraction ───────────────────────────────────────────");
            println!("  Cartridge:        {}", summary.cartridge);
            println!("  Frames captured:  {}", summary.frames_captured);
            println!("  Frames missing:   {} (in {} gap(s))", summary.frames_missing, summary.gap_count);
            println!("  Write-stop:       {}", summary.write_stop_frames);
            println!("  Rejected frames:  {}", summary.rejected_frames);
            println!("  Duplicates:       {}", summary.duplicate_frames);
            println!("  Chunks parsed:    {}", summary.parse.chunks_parsed);
            println!("  Bytes skipped:    {}", summary.parse.bytes_skipped);
            println!("  Directories:      {}", summary.parse.directories_created);
            println!("  Files:            {} → {}", summary.parse.files_written, output.display());
            println!("  Snapshots:        {} → {}", summary.parse.snapshots_written, snapshot_output.display());
            if summary.parse.forced_closes > 0 || summary.parse.size_mismatches > 0 {
                println!(
                    "  ⚠ {} forced close(s), {} size mismatch(es) — see the log",
                    summary.parse.forced_closes, summary.parse.size_mismatches
                );
            }
        }

        // ── Gaps ─────────────────────────────────────────────────────────────
        Commands::Gaps { dumps, cartridge, json } => {
            let map = BlockMap::load(&dumps, cartridge.into())?;
            let report = gaps::report(&map)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}: {} frame(s) captured, {} missing in {} gap(s)",
                    report.cartridge, report.frames_present, report.frames_missing, report.gaps.len());
                for gap in &report.gaps {
                    println!(
                        "  track {:>2} x {:>5}  ..  track {:>2} x {:>5}   {:>7} block(s){}",
                        gap.start_track, gap.start_x, gap.end_track, gap.end_x, gap.block_count,
                        if gap.open_ended { "  (open at end of tape)" } else { "" }
                    );
                }
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { dump, cartridge } => {
            let size = std::fs::metadata(&dump)?.len();
            let map = BlockMap::load(&[&dump], cartridge.into())?;
            println!("── Dump ─────────────────────────────────────────────────");
            println!("  Path:             {}", dump.display());
            println!("  File size:        {} B ({} full frame(s))", size, size / FULL_SECTION_SIZE as u64);
            println!("  Cartridge:        {}", CartridgeType::from(cartridge));
            println!("  Indexed frames:   {}", map.len());
            println!("  Write-stop:       {}", map.write_stop_frames);
            println!("  Rejected ids:     {}", map.rejected_frames);
            println!("  Duplicate ids:    {}", map.duplicate_frames);
        }
    }

    Ok(())
}
