use dfmatrix::solver::assembly::{EquationSystem, Gamma, LaplacianBoundary};
use dfmatrix::solver::gpu::open_device;
use dfmatrix::solver::mesh::BoxMesh;
use dfmatrix::solver::options::BackendKind;
use dfmatrix::{MatrixDataBase, SolverConfig};

struct Opts {
    cells: usize,
    config: Option<String>,
    backend: Option<BackendKind>,
}

fn usage() -> &'static str {
    "usage: dfmatrix [--cells N] [--config path.json] [--backend host|wgpu]"
}

fn parse_opts(args: &[String]) -> Result<Opts, String> {
    let mut opts = Opts {
        cells: 3,
        config: None,
        backend: None,
    };
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--cells" => {
                let Some(v) = it.next() else {
                    return Err("missing value after --cells".into());
                };
                opts.cells = v
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| format!("invalid --cells value '{v}'"))?;
            }
            "--config" => {
                let Some(v) = it.next() else {
                    return Err("missing value after --config".into());
                };
                opts.config = Some(v.clone());
            }
            "--backend" => {
                let Some(v) = it.next() else {
                    return Err("missing value after --backend".into());
                };
                opts.backend = Some(v.parse::<BackendKind>()?);
            }
            "-h" | "--help" => return Err(usage().to_string()),
            v => return Err(format!("unknown option '{v}'\n\n{}", usage())),
        }
    }
    Ok(opts)
}

/// Steady conduction along a channel of unit cells with `T = 0` at x = 0 and
/// `T = n` at x = n; the exact solution is `T = x`.
fn run_conduction(opts: &Opts) -> dfmatrix::Result<()> {
    let mut config = match &opts.config {
        Some(path) => SolverConfig::load(path)?,
        None => SolverConfig::default(),
    };
    if let Some(backend) = opts.backend {
        config.backend = backend;
    }

    let channel = BoxMesh::channel_1d(opts.cells);
    let mesh = channel.generate();
    let n = mesh.num_cells;
    let nbf = mesh.num_boundary_faces();
    let patch_type_names = mesh.patch_types.velocity.clone();
    let patch_sizes = mesh.patch_sizes.clone();

    let device = open_device(&config)?;
    log::info!("backend: {}", device.name());
    let mut db = MatrixDataBase::new(device, mesh, &config)?;

    let conductivity = db.allocate_scalar("conductivity", n)?;
    let boundary_conductivity = db.allocate_scalar("boundary_conductivity", nbf)?;
    let boundary_t = db.allocate_scalar("boundary_temperature", nbf)?;
    db.upload(conductivity, &vec![1.0; n])?;
    db.upload_boundary(boundary_conductivity, &vec![1.0; nbf], 1)?;
    // xmin held at 0, xmax (patch 1) at n
    let t_patches: Vec<Vec<f64>> = patch_sizes
        .iter()
        .enumerate()
        .map(|(p, &size)| vec![if p == 1 { n as f64 } else { 0.0 }; size])
        .collect();
    let t_slices: Vec<&[f64]> = t_patches.iter().map(Vec::as_slice).collect();
    db.upload_patches(boundary_t, &t_slices, 1)?;
    let patch = db.allocate_patch_types("temperature_patch_type", &patch_type_names)?;

    let mut eqn = EquationSystem::new(&mut db, "TEqn", 1)?;
    eqn.initialize_time_step(&mut db)?;
    eqn.fvm_laplacian(
        &mut db,
        Gamma::Cell(conductivity),
        boundary_conductivity,
        LaplacianBoundary::Patch {
            patch,
            value: boundary_t,
        },
        -1.0,
    )?;
    eqn.add_to_source(&mut db, None)?;
    eqn.sync(&mut db)?;

    let solver = config.energy.clone();
    let stats = eqn.solve(&mut db, &solver)?;
    let mut t = vec![0.0; n];
    eqn.update_psi(&db, &mut t)?;

    let max_error = t
        .iter()
        .enumerate()
        .map(|(i, &v)| (v - channel.cell_centre(i).x).abs())
        .fold(0.0, f64::max);

    db.metrics().print_report();
    for s in &stats {
        println!(
            "solve: {} iterations, residual {:.3e} (initial {:.3e}), converged {}",
            s.iterations, s.residual, s.initial_residual, s.converged
        );
    }
    if n <= 16 {
        println!("T = {t:?}");
    }
    println!("max error against T = x: {max_error:.3e}");
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match parse_opts(&args) {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run_conduction(&opts) {
        eprintln!("[dfmatrix] {err}");
        std::process::exit(1);
    }
}
