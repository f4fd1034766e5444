use std::{error::Error, fs, path::PathBuf};

use clap::Parser;
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use log::{error, info};
use volume_stack::{StrategyKind, VolumeDescriptor, VolumeLoader, VolumeSamples, first_mismatch};
use web_time::Instant;

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
enum ArgStrategy {
    All,
    Managed,
    Native,
    TransientStack,
    OsHeap,
    Mapped,
    Sliced,
}

impl ArgStrategy {
    fn kinds(self) -> Vec<StrategyKind> {
        match self {
            ArgStrategy::All => StrategyKind::ALL.to_vec(),
            ArgStrategy::Managed => vec![StrategyKind::ManagedArray],
            ArgStrategy::Native => vec![StrategyKind::NativeUnmanaged],
            ArgStrategy::TransientStack => vec![StrategyKind::TransientStack],
            ArgStrategy::OsHeap => vec![StrategyKind::OsHeap],
            ArgStrategy::Mapped => vec![StrategyKind::MemoryMapped],
            ArgStrategy::Sliced => vec![StrategyKind::SlicedArray],
        }
    }
}

#[derive(Parser, Debug)]
struct Args {
    /// Path to the stacked volume file
    path: PathBuf,
    /// Bytes to skip before the first sample
    #[arg(long, default_value_t = 1024)]
    header: u64,
    #[arg(long, default_value_t = 126)]
    width: usize,
    #[arg(long, default_value_t = 126)]
    height: usize,
    #[arg(long, default_value_t = 125)]
    depth: usize,
    #[arg(long, default_value_t = 2)]
    bytes_per_sample: usize,
    /// Strategy to load with, every strategy is cross-checked with `all`
    #[arg(long, value_enum, default_value = "all")]
    strategy: ArgStrategy,
    /// Directory to write the slices to as 16-bit PNG files
    #[arg(long)]
    export: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error + Sync + Send>> {
    let env = env_logger::Env::default().filter_or("RUST_LOG", "info");
    let logger = env_logger::Builder::from_env(env).build();
    let level = logger.filter();
    let multi_progress = MultiProgress::new();
    LogWrapper::new(multi_progress.clone(), logger).try_init()?;
    log::set_max_level(level);

    let args = Args::parse();

    let descriptor = VolumeDescriptor::new(
        args.header,
        args.width,
        args.height,
        args.depth,
        args.bytes_per_sample,
    )?;
    let loader = VolumeLoader::open(&args.path).inspect_err(|err| error!("{err}"))?;
    info!(
        "dimensions: {}x{}x{}, header {} bytes",
        descriptor.depth(),
        descriptor.height(),
        descriptor.width(),
        descriptor.header_size()
    );

    let mut reference: Option<(StrategyKind, Box<dyn VolumeSamples>)> = None;
    for kind in args.strategy.kinds() {
        let t0 = Instant::now();
        let volume = loader
            .load_kind(kind, &descriptor)
            .inspect_err(|err| error!("{kind}: load failed: {err}"))?;
        info!("{kind}: {} samples in {:?}", volume.sample_count(), t0.elapsed());

        match &reference {
            Some((reference_kind, reference_volume)) => {
                if let Some(mismatch) = first_mismatch(reference_volume, &volume) {
                    error!("{kind} disagrees with {reference_kind}: {mismatch}");
                    return Err(format!("{kind} disagrees with {reference_kind}").into());
                }
            }
            None => reference = Some((kind, volume)),
        }
    }

    if let Some(dest_path) = args.export {
        fs::create_dir_all(&dest_path)?;
        let t0 = Instant::now();
        let progress = multi_progress.add(ProgressBar::new(descriptor.depth() as u64));
        for slice in loader.lazy_slices(&descriptor)? {
            let slice = slice?;
            let out_path = dest_path.join(format!("slice_{:05}.png", slice.index() + 1));
            slice.save(&out_path)?;
            progress.inc(1);
        }
        progress.finish();
        multi_progress.remove(&progress);
        info!("exported {} slices in {:?}", descriptor.depth(), t0.elapsed());
    }

    Ok(())
}
