use std::{
    env::temp_dir,
    path::{Path, PathBuf},
    time::Instant,
};

use clap::{error::ErrorKind, CommandFactory, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use paio_engine::{
    Communicator, Dataset, DatasetOptions, ExtType, FormatVariant, GroupComm, Layout, LocalFile,
    LocalGroup, MemType, Selector, Var,
};
use tracing_subscriber::EnvFilter;

const FILENAME: &str = "paio_bench.data";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Put the benchmark file in this directory. If not set, will default to the system's
    /// temporary directory. This directory must already exist.
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// The number of in-process ranks committing collectively.
    #[arg(short, long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..256))]
    ranks: u32,

    /// The grid is dim x dim 8-byte elements; each request covers one full line of it.
    #[arg(long, default_value_t = 512, value_parser = clap::value_parser!(i64).range(1..16385))]
    dim: i64,

    /// The number of post-and-commit rounds to run.
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    rounds: u64,

    /// Post one request per column instead of per row, so every request in a round
    /// interleaves with every other and the committer has to merge the batch.
    #[arg(short, long)]
    columns: bool,

    /// Read the grid back after the last round and check every element.
    #[arg(long)]
    verify: bool,
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let directory = check_directory_or_use_temp_dir(&args.directory);
    let path = directory.join(FILENAME);
    LocalFile::create(&path)?;
    let layout = grid_layout(args.dim);

    println!(
        "Posting {} rounds of {} {} requests over {} ranks...",
        args.rounds,
        args.dim,
        if args.columns { "column" } else { "row" },
        args.ranks,
    );
    let pb = ProgressBar::new(args.rounds);
    pb.set_style(get_progress_bar_style());

    let started = Instant::now();
    std::thread::scope(|s| {
        for comm in LocalGroup::new(args.ranks as usize) {
            let path = path.clone();
            let layout = layout.clone();
            let pb = pb.clone();
            let args = &args;
            s.spawn(move || run_rank(comm, layout, &path, args, pb));
        }
    });
    let elapsed = started.elapsed();
    pb.finish_with_message("done");

    let total_bytes = args.rounds * (args.dim * args.dim * 8) as u64;
    println!(
        "Moved {total_bytes} bytes in {elapsed:.2?} ({:.1} MiB/s)",
        total_bytes as f64 / elapsed.as_secs_f64() / (1024.0 * 1024.0),
    );
    Ok(())
}

fn check_directory_or_use_temp_dir(directory: &Option<PathBuf>) -> PathBuf {
    // Check directory exists. Or use temp_dir.
    if let Some(directory) = directory.as_deref() {
        if directory.is_dir() {
            directory.to_path_buf()
        } else {
            let mut cmd = Args::command();
            cmd.error(
                ErrorKind::ValueValidation,
                format!("Directory {directory:?} does not exist, or is not a directory"),
            )
            .exit();
        }
    } else {
        temp_dir()
    }
}

fn get_progress_bar_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .unwrap()
        .progress_chars("##-")
}

fn grid_layout(dim: i64) -> Layout {
    Layout::builder(8)
        .var("grid", ExtType::I64, &[dim, dim])
        .build(FormatVariant::Offset64)
        .unwrap()
}

/// Every element of a line carries the line number, so a read-back can
/// tell exactly which request produced it.
fn line_bytes(line: i64, dim: i64) -> Vec<u8> {
    (0..dim).flat_map(|_| line.to_ne_bytes()).collect()
}

fn run_rank(comm: GroupComm, layout: Layout, path: &Path, args: &Args, pb: ProgressBar) {
    let rank = comm.rank();
    let size = comm.size();
    let fio = LocalFile::open(path).unwrap();
    let mut ds = Dataset::new(
        layout,
        0,
        Box::new(fio),
        Box::new(comm),
        DatasetOptions::default(),
    );
    let grid = ds.var("grid").unwrap().clone();

    for _ in 0..args.rounds {
        // Round-robin the lines over the ranks.
        for line in (rank as i64..args.dim).step_by(size) {
            let data = line_bytes(line, args.dim);
            if args.columns {
                ds.write_subarray(&grid, &[0, line], &[args.dim, 1], data, MemType::I64)
            } else {
                ds.write_subarray(&grid, &[line, 0], &[1, args.dim], data, MemType::I64)
            }
            .unwrap();
        }
        let out = ds.wait_all(Selector::All).unwrap();
        assert!(out.status.is_ok());
        if rank == 0 {
            pb.inc(1);
        }
    }

    if args.verify {
        verify_grid(&mut ds, &grid, rank, args);
    }
}

/// Rank 0 reads the whole grid back inside one more collective round and
/// checks that every element carries its line number.
fn verify_grid(ds: &mut Dataset, grid: &Var, rank: usize, args: &Args) {
    if rank == 0 {
        let dest = vec![0u8; (args.dim * args.dim * 8) as usize];
        ds.read_subarray(grid, &[0, 0], &[args.dim, args.dim], dest, MemType::I64)
            .unwrap();
    }
    let out = ds.wait_all(Selector::All).unwrap();
    assert!(out.status.is_ok());
    if rank == 0 {
        let buf = out.completions[0].buf.as_ref().unwrap();
        for r in 0..args.dim {
            for c in 0..args.dim {
                let at = ((r * args.dim + c) * 8) as usize;
                let got = i64::from_ne_bytes(buf[at..at + 8].try_into().unwrap());
                let want = if args.columns { c } else { r };
                assert_eq!(got, want, "element ({r},{c})");
            }
        }
        println!("verify: all {} elements match", args.dim * args.dim);
    }
}
