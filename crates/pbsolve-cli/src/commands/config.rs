use crate::error::Result;
use pbsolve::engine::config::SimulationConfig;

/// Prints the default simulation settings, ready to paste under `[simulation]`.
pub fn run() -> Result<()> {
    print!("{}", render()?);
    Ok(())
}

fn render() -> Result<String> {
    Ok(SimulationConfig::default().to_toml_string()?)
}
