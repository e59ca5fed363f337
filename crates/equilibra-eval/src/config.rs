//! Run configuration.
//!
//! Mirrors the driver's YAML directive file: the step/substep counts, the
//! per-step closure files for the base and policy passes, the input file
//! map, and the optional switches with their historical defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use equilibra_common::ModelError;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Symbolic file name → path on disk, for `file` statements.
    #[serde(default)]
    pub files: HashMap<String, PathBuf>,
    /// Number of closure steps.
    pub steps: usize,
    /// Newton subdivisions per step.
    pub substeps: usize,
    /// Ordered closure files for the base pass, one per step.
    #[serde(default)]
    pub basefiles: Vec<PathBuf>,
    /// Ordered closure files for the policy pass, one per step.
    #[serde(default)]
    pub polfiles: Vec<PathBuf>,
    /// When false, evaluate formulas and assertions only.
    #[serde(default = "default_true")]
    pub solve: bool,
    /// Long (true) or wide (false) report output.
    #[serde(default = "default_true")]
    pub longformat: bool,
    /// Optional whitelist of reported variable names.
    #[serde(default)]
    pub reportingvars: Option<Vec<String>>,
    /// Choose the iterative solver path.
    #[serde(default)]
    pub doiterative: bool,
    /// Condense trivial rows before the solve.
    #[serde(default)]
    pub docondense: bool,
}

impl RunConfig {
    /// A minimal configuration, mostly for tests and embedding.
    pub fn basic(steps: usize, substeps: usize) -> Self {
        Self {
            files: HashMap::new(),
            steps,
            substeps,
            basefiles: Vec::new(),
            polfiles: Vec::new(),
            solve: true,
            longformat: true,
            reportingvars: None,
            doiterative: false,
            docondense: false,
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, ModelError> {
        serde_yaml::from_str(text)
            .map_err(|e| ModelError::parse(format!("error reading configuration: {e}")))
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModelError::io(format!(
                "error reading configuration file `{}`: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.steps == 0 {
            return Err(ModelError::consistency("steps must be a positive integer"));
        }
        if self.substeps == 0 {
            return Err(ModelError::consistency(
                "substeps must be a positive integer",
            ));
        }
        if self.solve {
            if self.basefiles.len() != self.steps {
                return Err(ModelError::consistency(format!(
                    "{} base closure files configured for {} steps",
                    self.basefiles.len(),
                    self.steps
                )));
            }
            if self.polfiles.len() != self.steps {
                return Err(ModelError::consistency(format!(
                    "{} policy closure files configured for {} steps",
                    self.polfiles.len(),
                    self.steps
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_keys_take_their_defaults() {
        let config = RunConfig::from_yaml(
            "steps: 2\nsubsteps: 4\nbasefiles: [b0.cls, b1.cls]\npolfiles: [p0.cls, p1.cls]\n",
        )
        .unwrap();
        assert!(config.solve);
        assert!(config.longformat);
        assert!(!config.doiterative);
        assert!(!config.docondense);
        assert_eq!(config.reportingvars, None);
        config.validate().unwrap();
    }

    #[test]
    fn closure_file_counts_must_match_steps() {
        let config = RunConfig::from_yaml(
            "steps: 2\nsubsteps: 1\nbasefiles: [b0.cls]\npolfiles: [p0.cls, p1.cls]\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn no_solve_skips_closure_validation() {
        let config = RunConfig::from_yaml("steps: 1\nsubsteps: 1\nsolve: false\n").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn zero_counts_are_rejected() {
        let config = RunConfig::from_yaml("steps: 0\nsubsteps: 1\nsolve: false\n").unwrap();
        assert!(config.validate().is_err());
    }
}
