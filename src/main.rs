use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};

use voxtopo::{
    error::{Result, TopoError},
    extract_goal_markers, generate_geometry_from_voxels, input, post_processor, Controller,
    DensityField, FeModel, ReconstructOptions, RunRequest, SmoothingMethod, SolverEvent,
    SolverFrame,
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Smoothing {
    Taubin,
    Laplacian,
    None,
}

impl From<Smoothing> for SmoothingMethod {
    fn from(value: Smoothing) -> Self {
        match value {
            Smoothing::Taubin => SmoothingMethod::taubin(),
            Smoothing::Laplacian => SmoothingMethod::laplacian(),
            Smoothing::None => SmoothingMethod::None,
        }
    }
}

/// Optimizes the stiffest layout for a problem file and writes the result
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Problem file (json)
    input_json: PathBuf,

    /// Directory for densities.csv, surface.obj and history.json
    #[clap(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Density threshold of the reconstructed surface
    #[clap(long, default_value_t = 0.5)]
    isovalue: f64,

    /// Surface smoothing
    #[clap(long, value_enum, default_value_t = Smoothing::Taubin)]
    smoothing: Smoothing,
}

fn run(args: &Args) -> Result<()> {
    let input_file = args
        .input_json
        .to_str()
        .ok_or_else(|| TopoError::Input("input path is not valid unicode".to_owned()))?;
    let problem = input::load_problem(input_file)?;

    let bounds = problem
        .mesh
        .bounds()
        .ok_or_else(|| TopoError::Input("mesh has no vertices".to_owned()))?;
    let model = FeModel::new(&problem.params, &bounds)?;
    let markers = extract_goal_markers(&problem.mesh, &problem.goals, &model);

    let bar = ProgressBar::new(problem.params.max_iters as u64);
    if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}") {
        bar.set_style(style);
    }

    let mut controller = Controller::new();
    controller.start(RunRequest {
        mesh: problem.mesh,
        markers,
        params: problem.params,
    });

    let mut history: Vec<SolverFrame> = Vec::new();
    let mut last: Option<SolverFrame> = None;
    while let Some(event) = controller.recv() {
        match event {
            SolverEvent::Frame(frame) => {
                bar.set_position(frame.iteration as u64);
                bar.set_message(format!(
                    "c={:.4e} change={:.4} vol={:.3}",
                    frame.compliance, frame.change, frame.volume
                ));
                history.push(frame.metrics());
                last = Some(frame);
            }
            SolverEvent::Done => break,
            SolverEvent::Error(message) => {
                bar.abandon();
                return Err(TopoError::Solver(message));
            }
        }
    }
    bar.finish();
    log::info!("run finished as {:?}", controller.state());

    let frame = last.ok_or_else(|| TopoError::Solver("run produced no frames".to_owned()))?;
    let field = DensityField::from_frame(frame, &model)?;

    std::fs::create_dir_all(&args.output_dir)?;
    post_processor::write_density_csv(&field, &args.output_dir.join("densities.csv"))?;
    post_processor::write_history(&history, &args.output_dir.join("history.json"))?;

    let options = ReconstructOptions {
        isovalue: args.isovalue,
        smoothing: args.smoothing.into(),
    };
    let geometry = generate_geometry_from_voxels(&field, &options)?;
    post_processor::write_obj(&geometry.mesh, &args.output_dir.join("surface.obj"))?;

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(err) = run(&args) {
        log::error!("{err}");
        std::process::exit(1)
    }
}
