//! OpenNEB Command-Line Interface
//!
//! Entry point for the `openneb` binary. Parses the command line, loads the
//! settings files and drives one of the run modes from the library.
//!
//! # Usage
//!
//! ```bash
//! # Relax a single structure
//! openneb optimize initial.xyz --model lj --fmax 0.01
//!
//! # NEB with 5 interior images, relaxing the endpoints first
//! openneb neb initial.xyz final.xyz --images 5 --optimize-endpoints
//!
//! # Continue the same run with the climbing image switched on
//! openneb ci neb_run
//!
//! # Grow a band of 9 images adaptively
//! openneb autoneb initial.xyz final.xyz --images 9
//!
//! # Short dynamics run at 500 K
//! openneb md initial.xyz --temperature 500 --steps 2000
//! ```
//!
//! Exit status is 0 whenever a run finished, converged or not, and 1 for
//! invalid input: mismatched structures, bad relax indices, unknown models,
//! forbidden restart overrides or an incomplete restart snapshot.

use openneb::autoneb::{AutoNeb, AutoNebParameters};
use openneb::checkpoint::{CheckpointManager, Interpolation, RestartOverrides, RunDirectory, RunParameters};
use openneb::endpoint::{check_similarity, optimize_endpoint, optimize_in_directory};
use openneb::interpolation::{interpolate_idpp, path_length};
use openneb::io::read_extxyz;
use openneb::md::{self, MdSettings};
use openneb::neb::{run_in_directory, RelaxOutcome};
use openneb::path::{check_relax_subset, ImageChain, PathBuilder, PathError};
use openneb::settings::{Settings, SettingsManager, CONFIG_FILE_NAME};
use openneb::PotentialRegistry;
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::sync::Arc;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Flags that take no value.
const SWITCHES: &[&str] = &["climb", "no-climb", "optimize-endpoints", "resume", "help"];

const OPTIMIZE_OPTIONS: &[&str] = &["model", "optimizer", "fmax", "max-steps", "output", "help"];
const NEB_OPTIONS: &[&str] = &[
    "images",
    "model",
    "k",
    "climb",
    "climb-fmax",
    "optimizer",
    "fmax",
    "max-steps",
    "interpolation",
    "interp-fmax",
    "interp-steps",
    "relax-atoms",
    "optimize-endpoints",
    "output",
    "help",
];
const AUTONEB_OPTIONS: &[&str] = &[
    "images",
    "n-simul",
    "model",
    "k",
    "no-climb",
    "ratio",
    "interpolation",
    "max-steps",
    "fmax",
    "optimizer",
    "prefix",
    "relax-atoms",
    "climb-fmax",
    "output",
    "resume",
    "help",
];
const AUTONEB_RESUME_OPTIONS: &[&str] = &["images", "output"];
const MD_OPTIONS: &[&str] = &["model", "temperature", "timestep", "steps", "interval", "seed", "output", "help"];
const RESTART_OPTIONS: &[&str] = &[
    "k",
    "climb",
    "no-climb",
    "optimizer",
    "max-steps",
    "model",
    "images",
    "initial",
    "final",
    "relax-atoms",
    "help",
];

/// Parsed command line after the subcommand.
struct Args {
    positional: Vec<String>,
    options: HashMap<String, String>,
    switches: HashSet<String>,
}

impl Args {
    fn parse(raw: &[String], allowed: &[&str]) -> Result<Self, String> {
        let mut args = Args {
            positional: Vec::new(),
            options: HashMap::new(),
            switches: HashSet::new(),
        };
        let mut iter = raw.iter();
        while let Some(arg) = iter.next() {
            if arg == "-h" {
                args.switches.insert("help".to_string());
                continue;
            }
            let Some(flag) = arg.strip_prefix("--") else {
                args.positional.push(arg.clone());
                continue;
            };
            let (name, inline) = match flag.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (flag, None),
            };
            if !allowed.contains(&name) {
                return Err(format!("unknown option --{}", name));
            }
            if SWITCHES.contains(&name) {
                args.switches.insert(name.to_string());
                continue;
            }
            let value = match inline {
                Some(value) => value,
                None => iter
                    .next()
                    .cloned()
                    .ok_or_else(|| format!("option --{} needs a value", name))?,
            };
            args.options.insert(name.to_string(), value);
        }
        Ok(args)
    }

    fn value<T>(&self, name: &str) -> Result<Option<T>, String>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.options
            .get(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| format!("invalid value '{}' for --{}: {}", raw, name, e))
            })
            .transpose()
    }

    fn switch(&self, name: &str) -> bool {
        self.switches.contains(name)
    }

    fn relax_atoms(&self) -> Result<Option<Option<Vec<usize>>>, String> {
        self.options.get("relax-atoms").map(|raw| parse_index_list(raw)).transpose()
    }

    fn positional_path(&self, index: usize, what: &str) -> Result<PathBuf, String> {
        self.positional
            .get(index)
            .map(PathBuf::from)
            .ok_or_else(|| format!("missing {}", what))
    }
}

fn parse_index_list(raw: &str) -> Result<Option<Vec<usize>>, String> {
    if raw.trim().eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid atom index '{}' in --relax-atoms", s.trim()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn main() {
    let settings = SettingsManager::load()
        .map(|manager| manager.settings().clone())
        .unwrap_or_default();

    let mut logger = env_logger::Builder::new();
    logger.filter_level(settings.logging.level_filter());
    if let Ok(spec) = env::var("RUST_LOG") {
        logger.parse_filters(&spec);
    }
    logger
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }
    if args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(0);
    }

    let rest = &args[2..];
    let result = match args[1].as_str() {
        "optimize" => parse_and_run(rest, OPTIMIZE_OPTIONS, |a| run_optimize(a, &settings)),
        "neb" => parse_and_run(rest, NEB_OPTIONS, |a| run_neb(a, &settings)),
        "autoneb" => parse_and_run(rest, AUTONEB_OPTIONS, |a| run_autoneb(a, &settings)),
        "restart" => parse_and_run(rest, RESTART_OPTIONS, |a| run_restart(a, &settings, false)),
        "ci" => parse_and_run(rest, RESTART_OPTIONS, |a| run_restart(a, &settings, true)),
        "md" => parse_and_run(rest, MD_OPTIONS, |a| run_md(a, &settings)),
        "init-config" => run_create_settings_template(rest.first().map(String::as_str)),
        other => {
            eprintln!("Error: Unknown command: {}", other);
            print_usage(&args[0]);
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn parse_and_run<F>(raw: &[String], allowed: &[&str], run: F) -> CliResult<()>
where
    F: FnOnce(&Args) -> CliResult<()>,
{
    let args = Args::parse(raw, allowed)?;
    if args.switch("help") {
        print_usage("openneb");
        return Ok(());
    }
    run(&args)
}

/// Prints usage information to stderr.
fn print_usage(program_name: &str) {
    eprintln!("OpenNEB - Nudged Elastic Band reaction-path search");
    eprintln!("Version {}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {} optimize <structure> [options]", program_name);
    eprintln!("                    Relax one structure (writes opt_* files)");
    eprintln!("  {} neb <initial> <final> [options]", program_name);
    eprintln!("                    Build and relax a band");
    eprintln!("  {} autoneb <initial> <final> [options]", program_name);
    eprintln!("  {} autoneb --resume [--output <dir>] [--images <n>]", program_name);
    eprintln!("                    Grow a band adaptively");
    eprintln!("  {} md <structure> [options]", program_name);
    eprintln!("                    Velocity-Verlet dynamics (writes md.log)");
    eprintln!("  {} restart [run_dir] [overrides]", program_name);
    eprintln!("                    Resume a NEB run from its last complete band");
    eprintln!("  {} ci [run_dir] [overrides]", program_name);
    eprintln!("                    Resume a NEB run with the climbing image on");
    eprintln!("  {} init-config [path]", program_name);
    eprintln!("                    Write a settings template ({})", CONFIG_FILE_NAME);
    eprintln!();
    eprintln!("Common options:");
    eprintln!("  --model <spec>        lj[:eps,sigma,cutoff], morse[:D,a,r0,cutoff], external:<cmd>");
    eprintln!("  --optimizer <name>    fire, bfgs, lbfgs, mdmin");
    eprintln!("  --fmax <eV/A>         force convergence threshold");
    eprintln!("  --max-steps <n>       step budget (per relaxation for autoneb)");
    eprintln!("  --output <dir>        run directory (default: neb_run, autoneb_run, opt_run)");
    eprintln!();
    eprintln!("neb options:");
    eprintln!("  --images <n>          interior images (default 5)");
    eprintln!("  --k <eV/A^2>          spring constant");
    eprintln!("  --climb               climbing image");
    eprintln!("  --climb-fmax <eV/A>   band fmax at which climbing switches on");
    eprintln!("  --interpolation <m>   linear or idpp");
    eprintln!("  --interp-fmax <eV/A>  IDPP threshold");
    eprintln!("  --interp-steps <n>    IDPP step budget");
    eprintln!("  --relax-atoms <list>  comma-separated atoms allowed to move");
    eprintln!("  --optimize-endpoints  relax both endpoints before building the band");
    eprintln!();
    eprintln!("autoneb options:");
    eprintln!("  --images <n>          total images including endpoints (default 9)");
    eprintln!("  --n-simul <n>         simultaneous relaxations hint (default 4)");
    eprintln!("  --ratio <r>           1.0 = geometric gaps only, 0.0 = energy gaps only");
    eprintln!("  --no-climb            skip the final climbing-image relaxation");
    eprintln!("  --prefix <name>       per-image file prefix (default autoneb)");
    eprintln!("  --climb-fmax <eV/A>   band fmax at which climbing switches on");
    eprintln!("  --resume              continue the run in --output from its saved files;");
    eprintln!("                        structures are not needed, --images may raise the target");
    eprintln!();
    eprintln!("md options:");
    eprintln!("  --temperature <K>     initial Maxwell-Boltzmann temperature (default 300)");
    eprintln!("  --timestep <fs>       time step (default 2.0)");
    eprintln!("  --steps <n>           number of steps (default 1000)");
    eprintln!("  --interval <n>        log and trajectory interval (default 5)");
    eprintln!("  --seed <n>            random seed for the initial velocities");
    eprintln!();
    eprintln!("restart / ci overrides:");
    eprintln!("  --k, --climb, --no-climb, --optimizer, --max-steps, --model");
    eprintln!("  --images, --initial, --final and --relax-atoms must match the snapshot");
}

fn run_create_settings_template(path: Option<&str>) -> CliResult<()> {
    let path = Path::new(path.unwrap_or(CONFIG_FILE_NAME));
    SettingsManager::create_template(path)?;
    println!("Settings template created: {}", path.display());
    Ok(())
}

fn run_optimize(args: &Args, settings: &Settings) -> CliResult<()> {
    let structure = args.positional_path(0, "structure file")?;
    let model = args.value::<String>("model")?.unwrap_or_else(|| settings.general.default_model.clone());
    let optimizer = args.value("optimizer")?.unwrap_or(settings.neb.optimizer);
    let fmax = args.value("fmax")?.unwrap_or(settings.neb.fmax);
    let max_steps = args.value("max-steps")?.unwrap_or(settings.neb.max_steps);
    let output = args.value::<PathBuf>("output")?.unwrap_or_else(|| PathBuf::from("opt_run"));

    let potential = PotentialRegistry::with_builtin().create(&model)?;
    let mut config = read_extxyz(&structure)?.config;
    let report = optimize_in_directory(&output, &mut config, potential.as_ref(), optimizer, fmax, max_steps)?;

    println!();
    println!("Structure:      {}", structure.display());
    println!("Energy before:  {:.6} eV", report.energy_before);
    println!("Energy after:   {:.6} eV", report.energy_after);
    println!("Steps:          {}", report.steps);
    println!("Converged:      {}", report.converged);
    println!("Output:         {}", output.display());
    Ok(())
}

fn run_md(args: &Args, settings: &Settings) -> CliResult<()> {
    let structure = args.positional_path(0, "structure file")?;
    let model = args.value::<String>("model")?.unwrap_or_else(|| settings.general.default_model.clone());
    let defaults = MdSettings::default();
    let md_settings = MdSettings {
        temperature_k: args.value("temperature")?.unwrap_or(defaults.temperature_k),
        timestep_fs: args.value("timestep")?.unwrap_or(defaults.timestep_fs),
        steps: args.value("steps")?.unwrap_or(defaults.steps),
        interval: args.value("interval")?.unwrap_or(defaults.interval),
        seed: args.value("seed")?,
    };
    let output = args.value::<PathBuf>("output")?.unwrap_or_else(|| PathBuf::from("md_run"));

    let potential = PotentialRegistry::with_builtin().create(&model)?;
    let mut config = read_extxyz(&structure)?.config;
    let last = md::run_in_directory(&output, &mut config, potential.as_ref(), &md_settings)?;

    println!();
    println!("Structure:      {}", structure.display());
    println!("Steps:          {}", last.step);
    println!("Total energy:   {:.6} eV", last.total_energy());
    println!("Temperature:    {:.1} K", last.temperature_k);
    println!("Output:         {}", output.display());
    Ok(())
}

fn run_neb(args: &Args, settings: &Settings) -> CliResult<()> {
    let defaults = &settings.neb;
    let params = RunParameters {
        initial_structure: args.positional_path(0, "initial structure")?,
        final_structure: args.positional_path(1, "final structure")?,
        n_intermediate: args.value("images")?.unwrap_or(5),
        interp_fmax: args.value("interp-fmax")?.unwrap_or(defaults.interp_fmax),
        interp_steps: args.value("interp-steps")?.unwrap_or(defaults.interp_steps),
        interpolation: args.value("interpolation")?.unwrap_or(defaults.interpolation),
        spring_constant: args.value("k")?.unwrap_or(defaults.spring_constant),
        climb: args.switch("climb"),
        climb_activation_fmax: args.value("climb-fmax")?.unwrap_or(defaults.climb_activation_fmax),
        optimizer: args.value("optimizer")?.unwrap_or(defaults.optimizer),
        fmax: args.value("fmax")?.unwrap_or(defaults.fmax),
        max_steps: args.value("max-steps")?.unwrap_or(defaults.max_steps),
        relax_atoms: args.relax_atoms()?.flatten(),
        model: args
            .value::<String>("model")?
            .unwrap_or_else(|| settings.general.default_model.clone()),
    };
    let dir = RunDirectory::new(args.value::<PathBuf>("output")?.unwrap_or_else(|| PathBuf::from("neb_run")));

    let potential = PotentialRegistry::with_builtin().create(&params.model)?;
    let mut start = read_extxyz(&params.initial_structure)?.config;
    let mut end = read_extxyz(&params.final_structure)?.config;
    if !start.same_shape(&end) {
        return Err(PathError::ShapeMismatch(format!(
            "{} and {} differ in atom count or species order",
            params.initial_structure.display(),
            params.final_structure.display()
        ))
        .into());
    }
    let builder = PathBuilder::new().with_relax_subset(params.relax_atoms.clone());
    check_relax_subset(builder.relax_subset(), start.num_atoms)?;

    if settings.general.print_level > 0 {
        println!("Run parameters:\n{}", params.to_snapshot());
    }

    let manager = CheckpointManager::new(dir.clone()).with_grace_period(settings.restart.grace_period);
    manager.start_fresh(&params)?;

    if args.switch("optimize-endpoints") {
        let a = optimize_endpoint(&mut start, potential.as_ref(), params.optimizer, params.fmax, params.max_steps)?;
        let b = optimize_endpoint(&mut end, potential.as_ref(), params.optimizer, params.fmax, params.max_steps)?;
        check_similarity(&start, a.energy_after, &end, b.energy_after, &settings.similarity);
    }

    let mut chain = builder.build(Arc::new(start), Arc::new(end), params.n_intermediate)?;
    if params.interpolation == Interpolation::Idpp {
        interpolate_idpp(&mut chain, params.interp_fmax, params.interp_steps)?;
    }
    log::info!("initial path length {:.4} A", path_length(&chain));

    let outcome = run_in_directory(&dir, &mut chain, potential, &params.relax_settings())?;
    print_summary(&chain, &outcome, dir.root());
    Ok(())
}

fn run_restart(args: &Args, settings: &Settings, climb: bool) -> CliResult<()> {
    let dir = RunDirectory::new(args.positional.first().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")));
    let climb_override = if climb || args.switch("climb") {
        Some(true)
    } else if args.switch("no-climb") {
        Some(false)
    } else {
        None
    };
    let overrides = RestartOverrides {
        spring_constant: args.value("k")?,
        climb: climb_override,
        optimizer: args.value("optimizer")?,
        max_steps: args.value("max-steps")?,
        model: args.value("model")?,
        initial_structure: args.value("initial")?,
        final_structure: args.value("final")?,
        n_intermediate: args.value("images")?,
        relax_atoms: args.relax_atoms()?,
    };

    let manager = CheckpointManager::new(dir.clone()).with_grace_period(settings.restart.grace_period);
    let effective = manager.load_parameters()?.apply_overrides(&overrides)?;
    let potential = PotentialRegistry::with_builtin().create(&effective.model)?;

    let mut loaded = manager.restart(&overrides)?;
    if settings.general.print_level > 0 {
        println!("Resuming with:\n{}", loaded.params.to_snapshot());
    }
    let outcome = run_in_directory(&dir, &mut loaded.chain, potential, &loaded.params.relax_settings())?;
    print_summary(&loaded.chain, &outcome, dir.root());
    Ok(())
}

fn run_autoneb(args: &Args, settings: &Settings) -> CliResult<()> {
    let output = args.value::<PathBuf>("output")?.unwrap_or_else(|| PathBuf::from("autoneb_run"));
    let dir = RunDirectory::new(output.clone());
    let registry = PotentialRegistry::with_builtin();

    let outcome = if args.switch("resume") {
        if let Some(name) = args.options.keys().find(|k| !AUTONEB_RESUME_OPTIONS.contains(&k.as_str())) {
            return Err(format!("--{} cannot change a saved AutoNEB run; only --images may be raised", name).into());
        }
        let saved = AutoNebParameters::load(&dir)?;
        let potential = registry.create(&saved.model)?;
        AutoNeb::resume(dir, potential, args.value("images")?)?
    } else {
        let defaults = AutoNebParameters::default();
        let params = AutoNebParameters {
            initial_structure: args.positional_path(0, "initial structure")?,
            final_structure: args.positional_path(1, "final structure")?,
            n_target: args.value("images")?.unwrap_or(defaults.n_target),
            n_simultaneous: args.value("n-simul")?.unwrap_or(defaults.n_simultaneous),
            fmax: args.value("fmax")?.unwrap_or(settings.neb.fmax),
            climb: !args.switch("no-climb"),
            spring_constant: args.value("k")?.unwrap_or(settings.neb.spring_constant),
            space_energy_ratio: args.value("ratio")?.unwrap_or(defaults.space_energy_ratio),
            interpolation: args.value("interpolation")?.unwrap_or(settings.neb.interpolation),
            max_steps_per_relax: args.value("max-steps")?.unwrap_or(defaults.max_steps_per_relax),
            climb_activation_fmax: args
                .value("climb-fmax")?
                .unwrap_or(settings.neb.climb_activation_fmax),
            optimizer: args.value("optimizer")?.unwrap_or(defaults.optimizer),
            prefix: args.value("prefix")?.unwrap_or(defaults.prefix),
            model: args
                .value::<String>("model")?
                .unwrap_or_else(|| settings.general.default_model.clone()),
            relax_atoms: args.relax_atoms()?.flatten(),
        };
        let potential = registry.create(&params.model)?;
        let start = read_extxyz(&params.initial_structure)?.config;
        let end = read_extxyz(&params.final_structure)?.config;
        AutoNeb::new(dir, potential, params).grow(start, end)?
    };

    println!();
    println!("Images:         {}", outcome.chain.len());
    println!("Insertions:     {}", outcome.insertions);
    println!("Converged:      {}", outcome.converged);
    print_barriers(&outcome.chain);
    println!("Output:         {}", output.display());
    Ok(())
}

fn print_summary(chain: &ImageChain, outcome: &RelaxOutcome, dir: &Path) {
    println!();
    println!("Images:         {}", chain.len());
    println!("Steps:          {}", outcome.steps);
    println!("Converged:      {}", outcome.converged);
    if let Some(index) = outcome.climbing_image {
        println!("Climbing image: {}", index);
    }
    print_barriers(chain);
    println!("Output:         {}", dir.display());
}

fn print_barriers(chain: &ImageChain) {
    if let Some((forward, reverse)) = chain.barriers() {
        println!("Forward barrier: {:.4} eV", forward);
        println!("Reverse barrier: {:.4} eV", reverse);
        if let Some(ts) = chain.max_energy_index() {
            println!("TS image:        {}", ts);
        }
    }
}
