use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use madx_model::engine::EngineConfig;
use madx_model::worker::worker_main::{run_worker_process, WorkerArgs};
use madx_model::{logger, Model, Settings, Summary, Table, TableRequest};

#[derive(Parser)]
#[command(name = "madx_model", version, about = "Query accelerator models through an isolated engine worker")]
struct Cli {
    /// Settings file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Model to load
    #[arg(long)]
    model: Option<String>,
    /// Optics to apply instead of the model default
    #[arg(long)]
    optics: Option<String>,
    /// Append every engine statement to this file
    #[arg(long)]
    history: Option<PathBuf>,
    /// Record engine interactions without running the engine
    #[arg(long)]
    dry_run: bool,
    /// Knob to set after the optics, as NAME=SCALE (repeatable)
    #[arg(long = "knob", value_name = "NAME=SCALE", value_parser = parse_knob)]
    knobs: Vec<(String, f64)>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Sequences declared in the engine
    Sequences,
    /// Optics declared by the model
    Optics,
    /// Named ranges of a sequence
    Ranges {
        #[arg(long)]
        sequence: Option<String>,
    },
    Twiss(TableCli),
    Survey(TableCli),
    /// Aperture over the full sequence or a named range
    Aperture(TableCli),
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args)]
struct TableCli {
    #[arg(long)]
    sequence: Option<String>,
    /// Comma separated column names
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,
    #[arg(long)]
    range: Option<String>,
    /// Also write the table to this TFS file
    #[arg(long)]
    output: Option<PathBuf>,
}

impl TableCli {
    fn request(self, mut request: TableRequest) -> TableRequest {
        if let Some(sequence) = self.sequence {
            request = request.sequence(sequence);
        }
        if !self.columns.is_empty() {
            request = request.columns(self.columns);
        }
        if let Some(range) = self.range {
            request = request.range(range);
        }
        if let Some(output) = self.output {
            request = request.output(output);
        }
        request
    }
}

fn parse_knob(s: &str) -> Result<(String, f64), String> {
    let (name, scale) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=SCALE, got '{s}'"))?;
    let scale = scale
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid scale '{scale}': {e}"))?;
    if !scale.is_finite() {
        return Err(format!("scale must be finite, got '{scale}'"));
    }
    Ok((name.trim().to_string(), scale))
}

fn table_json((table, summary): (Table, Summary)) -> serde_json::Value {
    json!({ "summary": summary, "table": table })
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if cli.dry_run {
        settings.engine = EngineConfig::DryRun;
    }
    if let Err(e) = logger::init(&settings.log.level, settings.log.file.as_deref()) {
        eprintln!("Failed to set up logging: {e}");
    }

    let name = cli.model.context("--model is required")?;
    let options = settings.model_options(cli.optics, cli.history);
    let mut model = Model::open(&settings.store, &name, options)
        .with_context(|| format!("failed to open model '{name}'"))?;
    for (knob, scale) in &cli.knobs {
        model.set_knob(knob, *scale)?;
    }

    let output = match cli.command {
        Cmd::Sequences => json!(model.get_sequences()?),
        Cmd::Optics => json!(model.list_optics()),
        Cmd::Ranges { sequence } => {
            let sequence = sequence.unwrap_or_else(|| model.descriptor().default.sequence.clone());
            json!(model.list_ranges(&sequence)?)
        }
        Cmd::Twiss(args) => table_json(model.twiss(&args.request(TableRequest::twiss()))?),
        Cmd::Survey(args) => table_json(model.survey(&args.request(TableRequest::survey()))?),
        Cmd::Aperture(args) => table_json(model.aperture(&args.request(TableRequest::aperture()))?),
        Cmd::Worker(_) => bail!("worker is not a model command"),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    model.close()?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Worker mode: stdout carries protocol frames, so it must be handled
    // before anything could print to it.
    if let Cmd::Worker(args) = &cli.command {
        if let Err(e) = logger::init(&args.log_level, None) {
            eprintln!("[WORKER] Failed to set up logging: {e}");
        }
        std::process::exit(run_worker_process(args));
    }

    if let Err(e) = run(cli) {
        log::error!("{e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
