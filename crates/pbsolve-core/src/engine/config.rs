use crate::core::bem::solver::SolverSettings;
use crate::engine::formulation::{FormulationKind, PreconditionerKind, formulation_for};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Unknown formulation '{0}' (expected direct, direct_stern, slic or direct_amoeba)")]
    UnknownFormulation(String),

    #[error("Unknown preconditioner '{0}' (expected block_diagonal or mass_matrix)")]
    UnknownPreconditioner(String),

    #[error("Unknown force formulation '{0}' (expected maxwell_tensor or energy_functional)")]
    UnknownForceFormulation(String),

    #[error("Preconditioner '{preconditioner}' is not supported by formulation '{formulation}'")]
    UnsupportedPreconditioner {
        formulation: FormulationKind,
        preconditioner: PreconditionerKind,
    },

    #[error("Failed to read config file {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Failed to parse config file {path}: {message}")]
    Toml { path: PathBuf, message: String },

    #[error("Failed to serialize config: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SolventConfig {
    /// Relative permittivity of the solvent.
    pub ep_ex: f64,
    /// Inverse Debye length in 1/Angstrom.
    pub kappa: f64,
}

impl Default for SolventConfig {
    fn default() -> Self {
        Self {
            ep_ex: 80.0,
            kappa: 0.125,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct PolarizationConfig {
    /// Successive over-relaxation factor of the induced-dipole update.
    pub sor: f64,
    pub tolerance: f64,
    /// Ceiling of the vacuum relaxation loop.
    pub max_iterations: usize,
    /// Ceiling of the dissolved solve/relax outer loop.
    pub max_outer_iterations: usize,
}

impl Default for PolarizationConfig {
    fn default() -> Self {
        Self {
            sor: 0.7,
            tolerance: 1e-2,
            max_iterations: 1000,
            max_outer_iterations: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SlicConfig {
    pub max_iterations: usize,
    /// Relative change of the solution vector below which the loop stops.
    pub tolerance: f64,
}

impl Default for SlicConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tolerance: 1e-4,
        }
    }
}

/// How the solvation force on each body is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceFormulation {
    /// Integrates the Maxwell stress of the solvent field over the dielectric interface.
    #[default]
    MaxwellTensor,
    /// Splits the force into charge, dielectric-boundary and ionic-boundary terms.
    EnergyFunctional,
}

impl ForceFormulation {
    pub const ALL: [ForceFormulation; 2] = [Self::MaxwellTensor, Self::EnergyFunctional];

    pub fn name(self) -> &'static str {
        match self {
            Self::MaxwellTensor => "maxwell_tensor",
            Self::EnergyFunctional => "energy_functional",
        }
    }
}

impl fmt::Display for ForceFormulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ForceFormulation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s.trim().to_lowercase())
            .ok_or_else(|| ConfigError::UnknownForceFormulation(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ForceConfig {
    pub formulation: ForceFormulation,
    /// Uses the normal-derivative-only dielectric boundary force of the
    /// energy functional instead of the full field.
    pub approximate_dielectric_boundary: bool,
}

/// Global settings shared by every body of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SimulationConfig {
    pub formulation: FormulationKind,
    pub stern_layer: bool,
    pub preconditioning: bool,
    /// Overrides the formulation's default preconditioner.
    pub preconditioner: Option<PreconditionerKind>,
    /// Step of the finite differences on the reaction potential.
    pub fd_step: f64,
    pub solvent: SolventConfig,
    pub solver: SolverSettings,
    pub polarization: PolarizationConfig,
    pub slic: SlicConfig,
    pub forces: ForceConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            formulation: FormulationKind::Direct,
            stern_layer: false,
            preconditioning: true,
            preconditioner: None,
            fd_step: 1e-3,
            solvent: SolventConfig::default(),
            solver: SolverSettings::default(),
            polarization: PolarizationConfig::default(),
            slic: SlicConfig::default(),
            forces: ForceConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Toml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Toml {
            path: PathBuf::from("<string>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Preconditioner actually used, or `None` when preconditioning is off.
    pub fn effective_preconditioner(&self, formulation: FormulationKind) -> Option<PreconditionerKind> {
        if !self.preconditioning {
            return None;
        }
        Some(
            self.preconditioner
                .unwrap_or_else(|| formulation_for(formulation).default_preconditioner()),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &'static str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::InvalidParameter {
                    name,
                    reason: format!("must be positive, got {value}"),
                })
            }
        };
        positive("solvent.ep-ex", self.solvent.ep_ex)?;
        positive("solver.tolerance", self.solver.tolerance)?;
        positive("polarization.tolerance", self.polarization.tolerance)?;
        positive("slic.tolerance", self.slic.tolerance)?;
        positive("fd-step", self.fd_step)?;

        if !(self.solvent.kappa.is_finite() && self.solvent.kappa >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "solvent.kappa",
                reason: format!("must be non-negative, got {}", self.solvent.kappa),
            });
        }
        if !(self.polarization.sor > 0.0 && self.polarization.sor <= 1.0) {
            return Err(ConfigError::InvalidParameter {
                name: "polarization.sor",
                reason: format!("must lie in (0, 1], got {}", self.polarization.sor),
            });
        }
        let at_least_one = |name: &'static str, value: usize| {
            if value == 0 {
                Err(ConfigError::InvalidParameter {
                    name,
                    reason: "must be at least 1".to_string(),
                })
            } else {
                Ok(())
            }
        };
        at_least_one("solver.restart", self.solver.restart)?;
        at_least_one("solver.max-iterations", self.solver.max_iterations)?;
        at_least_one("polarization.max-iterations", self.polarization.max_iterations)?;
        at_least_one("polarization.max-outer-iterations", self.polarization.max_outer_iterations)?;
        at_least_one("slic.max-iterations", self.slic.max_iterations)?;

        let resolved = self.formulation.resolve(self.stern_layer, false);
        if let Some(kind) = self.effective_preconditioner(resolved) {
            if !formulation_for(resolved).supports_preconditioner(kind) {
                return Err(ConfigError::UnsupportedPreconditioner {
                    formulation: resolved,
                    preconditioner: kind,
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct SimulationConfigBuilder {
    formulation: Option<FormulationKind>,
    stern_layer: Option<bool>,
    preconditioning: Option<bool>,
    preconditioner: Option<PreconditionerKind>,
    fd_step: Option<f64>,
    solvent: Option<SolventConfig>,
    solver: Option<SolverSettings>,
    polarization: Option<PolarizationConfig>,
    slic: Option<SlicConfig>,
    forces: Option<ForceConfig>,
}

impl SimulationConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn formulation(mut self, kind: FormulationKind) -> Self {
        self.formulation = Some(kind);
        self
    }
    pub fn stern_layer(mut self, enabled: bool) -> Self {
        self.stern_layer = Some(enabled);
        self
    }
    pub fn preconditioning(mut self, enabled: bool) -> Self {
        self.preconditioning = Some(enabled);
        self
    }
    pub fn preconditioner(mut self, kind: PreconditionerKind) -> Self {
        self.preconditioner = Some(kind);
        self
    }
    pub fn fd_step(mut self, step: f64) -> Self {
        self.fd_step = Some(step);
        self
    }
    pub fn solvent(mut self, ep_ex: f64, kappa: f64) -> Self {
        self.solvent = Some(SolventConfig { ep_ex, kappa });
        self
    }
    pub fn solver(mut self, settings: SolverSettings) -> Self {
        self.solver = Some(settings);
        self
    }
    pub fn polarization(mut self, config: PolarizationConfig) -> Self {
        self.polarization = Some(config);
        self
    }
    pub fn slic(mut self, config: SlicConfig) -> Self {
        self.slic = Some(config);
        self
    }
    pub fn forces(mut self, config: ForceConfig) -> Self {
        self.forces = Some(config);
        self
    }

    pub fn build(self) -> Result<SimulationConfig, ConfigError> {
        let defaults = SimulationConfig::default();
        let config = SimulationConfig {
            formulation: self
                .formulation
                .ok_or(ConfigError::MissingParameter("formulation"))?,
            stern_layer: self.stern_layer.unwrap_or(defaults.stern_layer),
            preconditioning: self.preconditioning.unwrap_or(defaults.preconditioning),
            preconditioner: self.preconditioner.or(defaults.preconditioner),
            fd_step: self.fd_step.unwrap_or(defaults.fd_step),
            solvent: self.solvent.unwrap_or(defaults.solvent),
            solver: self.solver.unwrap_or(defaults.solver),
            polarization: self.polarization.unwrap_or(defaults.polarization),
            slic: self.slic.unwrap_or(defaults.slic),
            forces: self.forces.unwrap_or(defaults.forces),
        };
        config.validate()?;
        Ok(config)
    }
}
