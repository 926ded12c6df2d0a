use std::{
    env::temp_dir,
    path::{Path, PathBuf},
    time::Instant,
};

use afio_file::{
    AlignedBuffer, AsyncFile, AsyncFileConfig, IoThread, Job, OpenFlags, OpenParams, Page,
    Request,
};
use anyhow::Context;
use clap::{error::ErrorKind, CommandFactory, Parser};
use crossbeam_channel::Receiver;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const FILENAME_PREFIX: &str = "afio_bench_";
const ALIGN: usize = 4096;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Prefix filenames with this directory. If not set, will default to the system's temporary
    /// directory. Missing directories are created.
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// The number of files to initialise and then read back.
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    nrfiles: u32,

    /// The size of each file, in bytes. Must be a multiple of the block size.
    #[arg(short, long, default_value_t = 1024 * 1024, value_parser = clap::value_parser!(u64).range(1..))]
    filesize: u64,

    /// The page size in bytes, used both to initialise and to read the files.
    #[arg(short, long, default_value_t = 4096, value_parser = clap::value_parser!(u32).range(1..))]
    blocksize: u32,

    /// The number of I/O threads.
    #[arg(short = 't', long, default_value_t = 4, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..1024))]
    nr_io_threads: usize,

    /// Disable write coalescing.
    #[arg(long)]
    no_coalescing: bool,

    /// Open the files with direct I/O when reading them back.
    #[arg(long)]
    direct: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if args.filesize % args.blocksize as u64 != 0 {
        Args::command()
            .error(
                ErrorKind::ValueValidation,
                format!(
                    "filesize {} is not a multiple of blocksize {}",
                    args.filesize, args.blocksize
                ),
            )
            .exit();
    }

    let directory = args.directory.clone().unwrap_or_else(temp_dir);
    let filenames: Vec<PathBuf> = (0..args.nrfiles)
        .map(|i| directory.join(format!("{FILENAME_PREFIX}{i}")))
        .collect();

    let config = AsyncFileConfig {
        write_buffer_size: if args.no_coalescing {
            0
        } else {
            AsyncFileConfig::default().write_buffer_size
        },
        ..Default::default()
    };
    let files = (0..filenames.len())
        .map(|_| AsyncFile::new(config.clone()).map(Some))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let (completions_tx, completions) = crossbeam_channel::unbounded();
    let io_threads = (0..args.nr_io_threads)
        .map(|i| IoThread::spawn(format!("afio-io-{i}"), completions_tx.clone()))
        .collect::<std::io::Result<Vec<_>>>()
        .context("failed to start I/O threads")?;
    let mut bench = Bench {
        io_threads,
        completions,
        files,
    };

    let start = Instant::now();
    initialise_files(&mut bench, &filenames, args.filesize, args.blocksize)?;
    report("initialised", &filenames, args.filesize, start);

    let start = Instant::now();
    read_files(&mut bench, &filenames, &args)?;
    report("read", &filenames, args.filesize, start);
    Ok(())
}

fn report(what: &str, filenames: &[PathBuf], filesize: u64, start: Instant) {
    let elapsed = start.elapsed();
    let total_bytes = filesize * filenames.len() as u64;
    let gb_per_sec = total_bytes as f64 / elapsed.as_secs_f64() / 1e9;
    println!(
        "{what} {} files ({total_bytes} bytes) in {elapsed:.2?}: {gb_per_sec:.3} GB/s",
        filenames.len()
    );
}

/// Round-robins one request per file across the I/O threads.
struct Bench {
    io_threads: Vec<IoThread>,
    completions: Receiver<Job>,
    /// Indexed by `user_data`. `None` while the executor is travelling with a job.
    files: Vec<Option<AsyncFile>>,
}

impl Bench {
    /// Runs `make_request(i)` against every file `i`, and returns the finished requests in file
    /// order. Fails on the first request that reports an error.
    fn run_phase(
        &mut self,
        name: &str,
        mut make_request: impl FnMut(u64) -> Request,
    ) -> anyhow::Result<Vec<Request>> {
        let n_files = self.files.len();
        for (i, slot) in self.files.iter_mut().enumerate() {
            let file = slot.take().context("file is already in flight")?;
            let request = make_request(i as u64);
            let io_thread = &self.io_threads[i % self.io_threads.len()];
            if io_thread.push(Job::new(file, request)).is_err() {
                anyhow::bail!("I/O thread {} has stopped", io_thread.name());
            }
        }

        let pb = ProgressBar::new(n_files as _);
        pb.set_style(get_progress_bar_style());
        pb.set_message(name.to_string());
        let mut requests: Vec<Option<Request>> = (0..n_files).map(|_| None).collect();
        for _ in 0..n_files {
            let job = self.completions.recv()?;
            let i = job.request.user_data as usize;
            debug!(phase = name, file = i, "request complete");
            job.request
                .result()
                .with_context(|| format!("{name} of file {i} failed"))?;
            self.files[i] = Some(job.file);
            requests[i] = Some(job.request);
            pb.inc(1);
        }
        pb.finish_with_message(format!("{name}: done"));
        requests
            .into_iter()
            .map(|request| request.context("missing completion"))
            .collect()
    }
}

fn get_progress_bar_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .unwrap()
        .progress_chars("##-")
}

/// The byte at `offset` of every file.
fn expected_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn initialise_files(
    bench: &mut Bench,
    filenames: &[PathBuf],
    filesize: u64,
    blocksize: u32,
) -> anyhow::Result<()> {
    info!(n_files = filenames.len(), filesize, blocksize, "initialising files");
    let flags = OpenFlags::CREATE_IF_NONE
        | OpenFlags::TRUNCATE
        | OpenFlags::WRITE_ONLY
        | OpenFlags::INIT
        | OpenFlags::READ_SIZE;
    let requests = bench.run_phase("initialise", |i| {
        let params = OpenParams::new(&filenames[i as usize], flags)
            .file_size(filesize)
            .page_size(blocksize)
            .page_filler(move |_: u64, index: u32, page: &mut [u8]| {
                let start = index as u64 * blocksize as u64;
                for (j, byte) in page.iter_mut().enumerate() {
                    *byte = expected_byte(start + j as u64);
                }
            });
        Request::open(params, i)
    })?;
    for (request, filename) in requests.iter().zip(filenames) {
        anyhow::ensure!(
            request.file_size == Some(filesize),
            "{filename:?} has size {:?} after initialisation",
            request.file_size
        );
    }
    bench.run_phase("close", Request::close)?;
    Ok(())
}

fn read_files(bench: &mut Bench, filenames: &[PathBuf], args: &Args) -> anyhow::Result<()> {
    let mut flags = OpenFlags::READ_ONLY | OpenFlags::CHECK_SIZE;
    if args.direct {
        flags |= OpenFlags::DIRECT;
    }
    bench.run_phase("open", |i| {
        let params = OpenParams::new(&filenames[i as usize], flags).file_size(args.filesize);
        Request::open(params, i)
    })?;

    let blocksize = args.blocksize as usize;
    let n_pages = args.filesize / blocksize as u64;
    let requests = bench.run_phase("read", |i| {
        let pages = (0..n_pages)
            .map(|p| Page::new(AlignedBuffer::zeroed(blocksize, ALIGN), p * blocksize as u64))
            .collect();
        Request::read(pages, i)
    })?;
    for (request, filename) in requests.into_iter().zip(filenames) {
        anyhow::ensure!(
            request.bytes_read == args.filesize,
            "read {} bytes from {filename:?}",
            request.bytes_read
        );
        verify(filename, request.into_pages())?;
    }
    bench.run_phase("close", Request::close)?;
    Ok(())
}

fn verify(filename: &Path, pages: Vec<Page>) -> anyhow::Result<()> {
    for page in pages {
        for (j, &byte) in page.buf.as_slice().iter().enumerate() {
            let offset = page.offset + j as u64;
            anyhow::ensure!(
                byte == expected_byte(offset),
                "{filename:?}: unexpected byte {byte} at offset {offset}"
            );
        }
    }
    Ok(())
}
