mod options;

use anyhow::{anyhow, Error as AnyError};
use clap::Parser;
use options::{Cli, Command as CliCmd, ModelArgs, XyAlt};
use propah::{
    batch::{evaluate_points_parallel, BatchParams, PointOutcome},
    links::read_links,
    LinkGeometry, LosModel, PathLossModel, RegressionCoefficients, RegressionModel,
    SearchGeometry,
};
use serde::Serialize;
use std::{fs, io::Write, sync::atomic::AtomicBool};
use terrain::{
    ElevationSample, HttpClient, ProfileBuffer, RemoteTiles, Resolver, ReqwestClient,
    TerrainError, TileMode, TileStore,
};

fn main() -> Result<(), AnyError> {
    let cli = Cli::parse();

    env_logger::init();

    let start = cli.start;
    match &cli.cmd {
        CliCmd::Csv => {
            let dest = require_dest(&cli)?;
            print_csv(&profile(&cli, dest)?, start, dest)?;
        }
        CliCmd::Json => {
            let dest = require_dest(&cli)?;
            print_json(&profile(&cli, dest)?)?;
        }
        CliCmd::Loss(args) => {
            let dest = require_dest(&cli)?;
            let buf = profile(&cli, dest)?;
            let model = load_model(args)?;
            let loss = model.loss(&buf, &LinkGeometry::new(start.1, dest.1))?;
            println!("{loss}");
        }
        CliCmd::Links {
            file,
            model,
            max_loss,
        } => print_links(&cli, file, model, *max_loss)?,
    }

    Ok(())
}

fn require_dest(cli: &Cli) -> Result<XyAlt, AnyError> {
    cli.dest
        .ok_or_else(|| anyhow!("--dest is required for this command"))
}

fn build_store(cli: &Cli) -> Result<TileStore, TerrainError> {
    let resolver = match &cli.url_template {
        Some(template) => {
            let client: Box<dyn HttpClient> = Box::new(ReqwestClient::new()?);
            Resolver::Remote(RemoteTiles::new(&cli.tile_dir, template, client)?)
        }
        None => Resolver::local(&cli.tile_dir),
    };
    let mut builder = TileStore::builder()
        .tile_size(cli.tile_size)
        .resolver(resolver)
        .capacity(cli.capacity)
        .mode(if cli.memmap {
            TileMode::MemMap
        } else {
            TileMode::InMem
        });
    if let Some(dir) = &cli.flatten_dir {
        builder = builder.flatten_dir(dir);
    }
    builder.build()
}

fn profile(cli: &Cli, dest: XyAlt) -> Result<ProfileBuffer, AnyError> {
    let mut store = build_store(cli)?;
    let mut buf = ProfileBuffer::new();
    store.fill_profile(&mut buf, cli.start.0, dest.0, cli.max_step, true)?;
    log::info!("{:?}", store.stats());
    Ok(buf)
}

fn load_model(args: &ModelArgs) -> Result<Box<dyn PathLossModel + Sync>, AnyError> {
    let search = if args.with_antennas {
        SearchGeometry::WithAntennas
    } else {
        SearchGeometry::Terrain
    };
    Ok(match &args.coefficients {
        Some(path) => {
            let coefficients: RegressionCoefficients =
                serde_json::from_str(&fs::read_to_string(path)?)?;
            Box::new(RegressionModel::new(coefficients, search))
        }
        None => Box::new(LosModel),
    })
}

/// # Example with gnuplot
///
/// ```sh
/// cargo run -- --tile-dir=data/tiles --start=512000,5403100,30 --dest=515000,5401000,2 csv | tr ',' ' ' > ~/.tmp/plot && gnuplot -p -e "plot for [col=4:5] '~/.tmp/plot' using 1:col with lines"
/// ```
fn print_csv(profile: &[ElevationSample], start: XyAlt, dest: XyAlt) -> Result<(), AnyError> {
    let (Some(first), Some(last)) = (profile.first(), profile.last()) else {
        return Ok(());
    };
    let tx_z = first.z + start.1;
    let rx_z = last.z + dest.1;
    let slope = (rx_z - tx_z) / last.m;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "Distance,X,Y,Elevation,LOS")?;
    for ElevationSample { x, y, z, m, .. } in profile {
        let los = tx_z + slope * m;
        writeln!(stdout, "{m},{x},{y},{z},{los}")?;
    }
    Ok(())
}

fn print_json(profile: &[ElevationSample]) -> Result<(), AnyError> {
    #[derive(Serialize)]
    struct JsonEntry {
        location: [f64; 2],
        distance: f64,
        elevation: f64,
    }

    let reshaped: Vec<JsonEntry> = profile
        .iter()
        .map(|sample| JsonEntry {
            location: [sample.x, sample.y],
            distance: sample.m,
            elevation: sample.z,
        })
        .collect();
    let json = serde_json::to_string(&reshaped)?;
    println!("{json}");
    Ok(())
}

fn print_links(
    cli: &Cli,
    file: &std::path::Path,
    model: &ModelArgs,
    max_loss: Option<f64>,
) -> Result<(), AnyError> {
    #[derive(Serialize)]
    struct JsonLink<'a> {
        index: i32,
        name: &'a str,
        losses: Vec<Option<f64>>,
    }

    let links = read_links(file)?;
    let model = load_model(model)?;
    let params = BatchParams {
        tx: cli.start.0,
        tx_height: cli.start.1,
        rx_height: cli.dest.map_or(0.0, |dest| dest.1),
        max_step: cli.max_step,
        max_loss,
    };
    let cancel = AtomicBool::new(false);

    // One batch over every link so worker stores keep their tiles.
    let points: Vec<_> = links
        .iter()
        .flat_map(|link| link.points.iter().map(|p| p.coord()))
        .collect();
    let (outcomes, summary) =
        evaluate_points_parallel(|| build_store(cli), model.as_ref(), &params, &points, &cancel);
    log::info!("{summary:?}");

    let mut stdout = std::io::stdout().lock();
    let mut outcomes = outcomes.iter();
    for link in &links {
        let losses = outcomes
            .by_ref()
            .take(link.points.len())
            .map(|outcome| match outcome {
                PointOutcome::Loss(loss) => Some(*loss),
                PointOutcome::Failed(e) => {
                    log::warn!("link {}, {e}", link.index);
                    None
                }
                PointOutcome::Pruned(_) | PointOutcome::Skipped => None,
            })
            .collect();
        let json = serde_json::to_string(&JsonLink {
            index: link.index,
            name: &link.name,
            losses,
        })?;
        writeln!(stdout, "{json}")?;
    }
    Ok(())
}
