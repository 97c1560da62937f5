mod cluster;
mod feature;
mod flows;
mod hierarchy;
mod index;

#[cfg(test)]
mod test;

pub use cluster::*;
pub use feature::*;
pub use flows::*;
pub use hierarchy::*;
pub use index::*;

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use log::info;
use ordered_float::NotNan;

pub type Cost = NotNan<f64>;

/// Absolute tolerance shared by every floating-point comparison in the
/// pipeline: nearest-neighbor search, node splits, seeding, and the merge
/// queue all treat costs closer than this as equal.
pub const EPSILON_ALLOWANCE: f64 = 1e-10;

const USAGE: &str = "\
usage: flowsum --devices <path> --flows <path> [options]

options:
    --devices <path>          device label hierarchy file
    --flows <path>            flows file (prefix or range records)
    --out <dir>               output directory (default: out)
    --k <n>                   stop once n clusters remain (default: 1)
    --threads <n>             worker pool size, 0 = hardware default
    --no-parallel-init        seed nearest neighbors on one thread
    --parallel-index-remove   fan subset removal out over the pool
    --no-index                use the linear-scan clusterer
    --no-hr-clusters          skip the human-readable clusters file
    --override                clear a non-empty output directory
";

struct Args {
    devices: PathBuf,
    flows: PathBuf,
    out: PathBuf,
    k: usize,
    threads: usize,
    parallel_init: bool,
    parallel_index_remove: bool,
    use_index: bool,
    hr_clusters: bool,
    override_out: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = pico_args::Arguments::from_env();

    if args.contains("--help") || args.contains("-h") {
        print!("{USAGE}");
        std::process::exit(0);
    }

    let parsed = Args {
        devices: args.value_from_str("--devices")?,
        flows: args.value_from_str("--flows")?,
        out: args
            .opt_value_from_str("--out")?
            .unwrap_or_else(|| "out".into()),
        k: args.opt_value_from_str("--k")?.unwrap_or(1),
        threads: args.opt_value_from_str("--threads")?.unwrap_or(0),
        parallel_init: !args.contains("--no-parallel-init"),
        parallel_index_remove: args.contains("--parallel-index-remove"),
        use_index: !args.contains("--no-index"),
        hr_clusters: !args.contains("--no-hr-clusters"),
        override_out: args.contains("--override"),
    };

    let rest = args.finish();
    if !rest.is_empty() {
        anyhow::bail!("unexpected arguments: {rest:?}");
    }
    Ok(parsed)
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprint!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    if args.out.exists() && args.out.read_dir()?.next().is_some() {
        if !args.override_out {
            eprintln!(
                "the output directory {} is not empty and --override is not set",
                args.out.display()
            );
            return Ok(ExitCode::from(1));
        }
        info!(
            "output directory {} is not empty, cleaning up",
            args.out.display()
        );
        fs::remove_dir_all(&args.out)?;
    }
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()
            .context("failed to size the worker pool")?;
    }

    let hierarchy: LabelHierarchy = fs::read_to_string(&args.devices)
        .with_context(|| format!("failed to read {}", args.devices.display()))?
        .parse()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("failed to parse {}", args.devices.display()))?;
    info!("loaded {} device labels", hierarchy.len());

    let flows_text = fs::read_to_string(&args.flows)
        .with_context(|| format!("failed to read {}", args.flows.display()))?;
    let flow_file = parse_flows(&flows_text, &hierarchy)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("failed to parse {}", args.flows.display()))?;

    match flow_file {
        FlowFile::Prefix(flows) => {
            info!("clustering {} prefix flows", flows.len());
            let feature = (
                Ipv4PrefixFeature,
                DagFeature::new(&hierarchy),
                DagFeature::new(&hierarchy),
            );
            infer(args, &hierarchy, &feature, &flows)?;
        }
        FlowFile::Range(flows) => {
            info!("clustering {} range flows", flows.len());
            let feature = (
                IpRangeFeature,
                DagFeature::new(&hierarchy),
                DagFeature::new(&hierarchy),
            );
            infer(args, &hierarchy, &feature, &flows)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn infer<F>(
    args: &Args,
    hierarchy: &LabelHierarchy,
    feature: &F,
    flows: &[F::Label],
) -> anyhow::Result<()>
where
    F: Feature,
    F::Label: FlowLabel,
{
    let dendrogram = if args.use_index {
        IndexedClusterer {
            parallel_init: args.parallel_init,
            parallel_remove: args.parallel_index_remove,
        }
        .cluster(feature, flows, args.k)
    } else {
        LinearClusterer {
            parallel_init: args.parallel_init,
        }
        .cluster(feature, flows, args.k)
    };

    let parents_path = args.out.join("parents.txt");
    let mut out = BufWriter::new(
        fs::File::create(&parents_path)
            .with_context(|| format!("failed to create {}", parents_path.display()))?,
    );
    write_parents(&mut out, &dendrogram.parents)?;
    out.flush()?;

    let clusters_path = args.out.join("clusters.txt");
    let mut out = BufWriter::new(
        fs::File::create(&clusters_path)
            .with_context(|| format!("failed to create {}", clusters_path.display()))?,
    );
    write_clusters(&mut out, &dendrogram.clusters)?;
    out.flush()?;

    if args.hr_clusters {
        let hr_path = args.out.join("hr_clusters.txt");
        let mut out = BufWriter::new(
            fs::File::create(&hr_path)
                .with_context(|| format!("failed to create {}", hr_path.display()))?,
        );
        write_hr_clusters(&mut out, &dendrogram.clusters, hierarchy)?;
        out.flush()?;
    }

    info!(
        "wrote {} clusters to {}",
        dendrogram.len(),
        args.out.display()
    );
    Ok(())
}
