use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use btrdump_core::{
	BtrfsImage, DumpConfig, DumpEngine, DumpReport, FixupStrategy, Progress, RestoreConfig,
	RestoreEngine, RestoreReport,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser, Debug)]
#[command(name = "btrdump", version, about = "Capture and restore btrfs metadata images")]
struct Cli {
	/// Print the run report as JSON on stdout
	#[arg(long, global = true)]
	json: bool,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Capture a filesystem's metadata into a container
	Create {
		/// Worker threads (1-32)
		#[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..=32))]
		threads: Option<u64>,
		/// Compression level (0-9, 0 stores items uncompressed)
		#[arg(short = 'c', long = "compress", default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=9))]
		level: u32,
		/// Walk the trees instead of the extent tree (for damaged filesystems)
		#[arg(short = 'w', long)]
		walk_trees: bool,
		/// Skip the free space cache data extents
		#[arg(long)]
		no_space_cache: bool,
		/// Source device or image
		source: PathBuf,
		/// Container to write, `-` for stdout
		target: String,
	},
	/// Write a container's blocks back onto a device or image
	Restore {
		/// Worker threads (1-32)
		#[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..=32))]
		threads: Option<u64>,
		/// Use the compatibility superblock rewrite (single synthetic chunk)
		#[arg(short = 'o', long = "compat", conflicts_with = "verbatim")]
		compat: bool,
		/// Write blocks exactly as stored, without device fixups
		#[arg(long)]
		verbatim: bool,
		/// Container to read, `-` for stdin
		source: String,
		/// Target device or image file
		target: PathBuf,
	},
}

fn main() -> Result<()> {
	// stdout may carry the container, so logs go to stderr
	tracing_subscriber::fmt().with_writer(io::stderr).init();

	let cli = Cli::parse();
	tracing::debug!("{:?}", cli);
	match cli.command {
		Commands::Create { threads, level, walk_trees, no_space_cache, source, target } => {
			let config = DumpConfig {
				threads: threads.map(|t| t as usize),
				compress_level: level,
				walk_trees,
				capture_space_cache: !no_space_cache,
			};

			let to_stdout = target == "-";
			if to_stdout && cli.json {
				bail!("--json cannot be used while the container is written to stdout");
			}

			let report = if to_stdout {
				run_dump(&source, BufWriter::new(io::stdout().lock()), config)?
			} else {
				let file = File::create(&target).with_context(|| format!("creating {}", target))?;
				run_dump(&source, BufWriter::new(file), config)?
			};

			if cli.json {
				println!("{}", serde_json::to_string_pretty(&report)?);
			} else {
				print_dump_summary(&report, &target);
			}
		}
		Commands::Restore { threads, compat, verbatim, source, target } => {
			let fixup = if verbatim {
				FixupStrategy::Verbatim
			} else if compat {
				FixupStrategy::Compat
			} else {
				FixupStrategy::Current
			};
			let config = RestoreConfig { threads: threads.map(|t| t as usize), fixup };

			let report = if source == "-" {
				run_restore(BufReader::new(io::stdin().lock()), &target, config)?
			} else {
				let file = File::open(&source).with_context(|| format!("opening {}", source))?;
				run_restore(BufReader::new(file), &target, config)?
			};

			if cli.json {
				println!("{}", serde_json::to_string_pretty(&report)?);
			} else {
				print_restore_summary(&report, &target);
			}
		}
	}
	Ok(())
}

fn run_dump<W: Write>(source: &Path, out: W, config: DumpConfig) -> Result<DumpReport> {
	let image = BtrfsImage::open(source).with_context(|| format!("opening {}", source.display()))?;
	let mut engine = DumpEngine::new(image, config, out)?;
	let bar = spinner();
	if let Some(bar) = bar.clone() {
		engine.set_progress_callback(move |p| bar.set_message(progress_message(&p)));
	}

	let result = engine.run().with_context(|| format!("dumping {}", source.display()));
	if let Some(bar) = bar {
		bar.finish_and_clear();
	}
	let (report, _out) = result?;
	Ok(report)
}

fn run_restore<R: Read>(input: R, target: &Path, config: RestoreConfig) -> Result<RestoreReport> {
	let mut engine = RestoreEngine::new(input, target, config)?;
	let bar = spinner();
	if let Some(bar) = bar.clone() {
		engine.set_progress_callback(move |p| bar.set_message(progress_message(&p)));
	}

	let result = engine.run().with_context(|| format!("restoring onto {}", target.display()));
	if let Some(bar) = bar {
		bar.finish_and_clear();
	}
	result
}

/// A spinner on stderr, only when someone is watching
fn spinner() -> Option<ProgressBar> {
	if !atty::is(atty::Stream::Stderr) {
		return None;
	}
	let bar = ProgressBar::new_spinner();
	let style = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
		.unwrap_or_else(|_| ProgressStyle::default_spinner());
	bar.set_style(style);
	bar.enable_steady_tick(Duration::from_millis(120));
	Some(bar)
}

fn progress_message(p: &Progress) -> String {
	format!(
		"{:?}: {} ({} clusters, {} items, {} MiB)",
		p.stage,
		p.current_operation,
		p.clusters,
		p.items,
		p.bytes / (1024 * 1024)
	)
}

fn print_dump_summary(report: &DumpReport, target: &str) {
	let lines = [
		"✅ Metadump created".to_string(),
		format!("📁 Filesystem: {} (generation {})", report.fsid, report.generation),
		format!("📊 Used: {} of {} bytes", report.bytes_used, report.total_bytes),
		format!("🌲 Tree blocks: {} ({} byte nodes)", report.tree_blocks, report.nodesize),
		format!("💾 Data extents: {} ({} bytes)", report.data_extents, report.data_bytes),
		format!("📦 Clusters: {}, items: {}", report.clusters, report.items),
		format!("📈 Container size: {} bytes", report.container_bytes),
	];
	// keep the container stream clean
	if target == "-" {
		lines.iter().for_each(|line| eprintln!("{}", line));
	} else {
		lines.iter().for_each(|line| println!("{}", line));
	}
}

fn print_restore_summary(report: &RestoreReport, target: &Path) {
	println!("✅ Restored onto {}", target.display());
	if let (Some(fsid), Some(devid)) = (report.fsid, report.devid) {
		println!("📁 Filesystem: {} (device {})", fsid, devid);
	}
	println!("🔧 Fixups: {:?}", report.fixup);
	println!("📦 Clusters: {}, items: {}", report.clusters, report.items);
	println!("💾 Bytes written: {}", report.bytes_written);
	println!("🔄 Chunk leaves rewritten: {}", report.chunk_leaves_rewritten);
	println!("🪞 Backup superblocks: {}", report.backup_supers);
	if !report.end_marker_seen {
		println!("⚠️  Container had no end-of-stream marker; it may be truncated");
	}
}
