//! A salted pipeline: daily listening streams aggregated per artist over an ISO
//! week, and a toy model trained and evaluated with tunable parameters.
//!
//! Run it twice: the second run finds every target and does nothing. Bump a
//! version with `--streams-version` or change `--gamma` and only the affected
//! tasks run again, writing to new salted paths.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use chrono::NaiveDate;
use clap::Parser;
use saltgraph::{
    DateInterval, Params, Requires, RunContext, Runner, Settings, TargetSpec, Task,
    collision_probability,
};

#[derive(Parser, Debug)]
#[command(about = "Salted task graph demo")]
struct Args {
    /// Output directory.
    #[arg(long)]
    root: Option<Utf8PathBuf>,

    /// JSON settings file.
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    /// Any day of the week to aggregate.
    #[arg(long, default_value = "2018-03-07")]
    week: NaiveDate,

    #[arg(long, default_value = "1.0")]
    streams_version: String,

    /// Insignificant: doesn't change any salted version.
    #[arg(long, default_value_t = 4)]
    workers: u32,

    #[arg(long, default_value_t = 100.0)]
    c: f64,

    #[arg(long, default_value_t = 1.0)]
    gamma: f64,

    #[arg(long, default_value = "rbf")]
    kernel: String,

    /// Only report what would run.
    #[arg(long)]
    dry_run: bool,

    /// Write a Mermaid diagram of the run here.
    #[arg(long)]
    mermaid: Option<Utf8PathBuf>,

    /// Write a JSON summary of the run here.
    #[arg(long)]
    json: Option<Utf8PathBuf>,
}

const ARTISTS: [(&str, &str); 3] = [
    ("Scott", "Python on my mind"),
    ("Sally", "What I like about R"),
    ("Scott", "Borrow checker blues"),
];

struct Streams {
    date: NaiveDate,
    version: String,
}

impl Task for Streams {
    fn kind(&self) -> &str {
        "Streams"
    }

    fn code_version(&self) -> &str {
        &self.version
    }

    fn params(&self) -> Params {
        Params::new().significant("date", self.date)
    }

    fn output(&self) -> Option<TargetSpec> {
        Some(TargetSpec::new("stream/{date}-{salt}.tsv"))
    }

    fn run(&self, ctx: &RunContext) -> anyhow::Result<()> {
        // Stand-in for an external data source.
        ctx.target()?.write_with(|file| -> anyhow::Result<()> {
            writeln!(file, "artist\ttrack")?;
            for (artist, track) in ARTISTS {
                writeln!(file, "{artist}\t{track}")?;
            }
            Ok(())
        })
    }
}

struct AggregateArtists {
    interval: DateInterval,
    streams_version: String,
    workers: u32,
}

impl Task for AggregateArtists {
    fn kind(&self) -> &str {
        "AggregateArtists"
    }

    fn code_version(&self) -> &str {
        "1.2 - bugfix"
    }

    fn params(&self) -> Params {
        Params::new()
            .significant("date_interval", self.interval)
            .insignificant("workers", self.workers)
    }

    fn requires(&self) -> Requires {
        self.interval
            .dates()
            .map(|date| {
                Requires::task(Streams {
                    date,
                    version: self.streams_version.clone(),
                })
            })
            .collect()
    }

    fn output(&self) -> Option<TargetSpec> {
        Some(TargetSpec::new("artist_streams_{date_interval}-{salt}.tsv"))
    }

    fn run(&self, ctx: &RunContext) -> anyhow::Result<()> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();

        for input in ctx.inputs().iter().flatten() {
            let text = input
                .read_to_string()
                .with_context(|| format!("reading {}", input.path()))?;

            for line in text.lines().skip(1) {
                if let Some((artist, _)) = line.split_once('\t') {
                    *counts.entry(artist.to_string()).or_default() += 1;
                }
            }
        }

        ctx.target()?.write_with(|file| -> anyhow::Result<()> {
            writeln!(file, "artist\tcount")?;
            for (artist, count) in &counts {
                writeln!(file, "{artist}\t{count}")?;
            }
            Ok(())
        })
    }
}

#[derive(Clone)]
struct Svc {
    c: f64,
    gamma: f64,
    kernel: String,
}

impl Svc {
    fn params(&self) -> Params {
        Params::new()
            .significant("c", self.c)
            .significant("gamma", self.gamma)
            .significant("kernel", self.kernel.as_str())
    }
}

struct TrainDigits(Svc);

impl Task for TrainDigits {
    fn kind(&self) -> &str {
        "TrainDigits"
    }

    fn code_version(&self) -> &str {
        "1.0"
    }

    fn params(&self) -> Params {
        self.0.params()
    }

    fn output(&self) -> Option<TargetSpec> {
        Some(TargetSpec::new("model-{salt}.json"))
    }

    fn run(&self, ctx: &RunContext) -> anyhow::Result<()> {
        let Svc { c, gamma, kernel } = &self.0;
        let model = serde_json::json!({
            "kernel": kernel,
            "c": c,
            "gamma": gamma,
            "weight": (c.ln() / (1.0 + gamma)).tanh(),
        });

        ctx.target()?.write_with(|file| -> anyhow::Result<()> {
            serde_json::to_writer_pretty(&mut *file, &model)?;
            Ok(())
        })
    }
}

struct PredictDigits(Svc);

impl Task for PredictDigits {
    fn kind(&self) -> &str {
        "PredictDigits"
    }

    fn code_version(&self) -> &str {
        "1.0"
    }

    fn params(&self) -> Params {
        self.0.params()
    }

    fn requires(&self) -> Requires {
        Requires::task(TrainDigits(self.0.clone()))
    }

    fn output(&self) -> Option<TargetSpec> {
        Some(TargetSpec::new("accuracy-{salt}.txt"))
    }

    fn run(&self, ctx: &RunContext) -> anyhow::Result<()> {
        let model = ctx.input(0).context("model not resolved")?;
        let model: serde_json::Value = serde_json::from_reader(model.open()?)?;
        let weight = model["weight"].as_f64().context("model has no weight")?;

        ctx.target()?.write_with(|file| -> anyhow::Result<()> {
            write!(file, "Accuracy: {:.3}", 0.5 + weight.abs() / 2.0)?;
            Ok(())
        })
    }
}

fn main() -> anyhow::Result<()> {
    saltgraph::init_logging()?;

    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    let mut settings = settings.with_env()?;
    if let Some(root) = args.root {
        settings = settings.root(root);
    }

    let interval = DateInterval::week_of(args.week).context("week out of range")?;
    let svc = Svc {
        c: args.c,
        gamma: args.gamma,
        kernel: args.kernel,
    };

    let roots: Vec<Arc<dyn Task>> = vec![
        Arc::new(AggregateArtists {
            interval,
            streams_version: args.streams_version,
            workers: args.workers,
        }),
        Arc::new(PredictDigits(svc)),
    ];

    let runner = Runner::new(settings);
    let report = if args.dry_run {
        runner.dry_run(roots)?
    } else {
        runner.build(roots)?
    };

    print!("{report}");
    println!(
        "salt collision chance over {} tasks at {} chars: {:.2e}",
        report.entries().len(),
        runner.settings().salt_len,
        collision_probability(report.entries().len() as u64, runner.settings().salt_len)
    );

    if let Some(path) = args.mermaid {
        std::fs::write(&path, report.render_mermaid())?;
    }

    if let Some(path) = args.json {
        std::fs::write(&path, report.to_json()?)?;
    }

    Ok(())
}
