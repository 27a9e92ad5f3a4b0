use clap::{Args, Parser, Subcommand};
use pbsolve::engine::config::ForceFormulation;
use pbsolve::engine::formulation::{FormulationKind, PreconditionerKind};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "pbsolve - boundary-element Poisson-Boltzmann solvation energies and forces for multi-solute systems.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads for parallel computation.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Solve a scenario and report solvation energies, forces and solvent potentials.
    Run(RunArgs),
    /// Print the default simulation configuration as TOML.
    Config,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the scenario file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Write the results as TOML to this path.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Override the formulation (direct, direct_stern, slic, direct_amoeba).
    #[arg(short = 'f', long, value_name = "NAME")]
    pub formulation: Option<FormulationKind>,

    /// Override the preconditioner (block_diagonal, mass_matrix).
    #[arg(short = 'p', long, value_name = "NAME", conflicts_with = "no_preconditioning")]
    pub preconditioner: Option<PreconditionerKind>,

    /// Solve without any preconditioner.
    #[arg(long)]
    pub no_preconditioning: bool,

    /// Also compute solvation forces.
    #[arg(long)]
    pub forces: bool,

    /// Override the force formulation (maxwell_tensor, energy_functional).
    #[arg(long, value_name = "NAME", requires = "forces")]
    pub force_formulation: Option<ForceFormulation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_parse_names() {
        let cli = Cli::parse_from([
            "pbsolve", "-vv", "run", "--config", "scenario.toml", "-f", "slic", "--forces",
            "--force-formulation", "energy_functional",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("scenario.toml"));
                assert_eq!(args.formulation, Some(FormulationKind::Slic));
                assert!(args.forces);
                assert_eq!(args.force_formulation, Some(ForceFormulation::EnergyFunctional));
                assert!(args.preconditioner.is_none());
            }
            Commands::Config => panic!("expected the run subcommand"),
        }
    }

    #[test]
    fn unknown_formulation_is_rejected() {
        let result = Cli::try_parse_from(["pbsolve", "run", "-c", "s.toml", "-f", "fmm"]);
        assert!(result.is_err());
    }

    #[test]
    fn force_formulation_requires_forces() {
        let result = Cli::try_parse_from([
            "pbsolve", "run", "-c", "s.toml", "--force-formulation", "maxwell_tensor",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn preconditioner_conflicts_with_disabling_it() {
        let result = Cli::try_parse_from([
            "pbsolve", "run", "-c", "s.toml", "-p", "mass_matrix", "--no-preconditioning",
        ]);
        assert!(result.is_err());
    }
}
