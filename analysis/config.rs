//! Run configuration, deserialized from a TOML file.
//!
//! Everything tunable lives here: paths, eligibility thresholds, the
//! quartile count, the minimum-event gate, the ordered covariate ladder and
//! the figure styling. Every field has a default so an empty file is a
//! valid configuration; unknown keys are rejected so typos fail loudly
//! before any output is written.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read configuration file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("configuration file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("covariate ladder is empty; at least one candidate set is required")]
    EmptyLadder,
    #[error("unknown covariate '{0}' in the adjustment ladder")]
    UnknownCovariate(String),
    #[error("quartile count must be at least 2, got {0}")]
    DegenerateQuartileCount(usize),
}

/// Covariates the estimator knows how to encode.
pub const KNOWN_COVARIATES: &[&str] = &[
    "age",
    "sex",
    "race_eth",
    "bmi",
    "diabetes",
    "hypertension",
    "smoking",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CovariateSet {
    pub name: String,
    pub fields: Vec<String>,
}

fn primary_set() -> CovariateSet {
    CovariateSet {
        name: "primary".to_string(),
        fields: ["age", "sex", "race_eth"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

fn unadjusted_set() -> CovariateSet {
    CovariateSet {
        name: "unadjusted".to_string(),
        fields: Vec::new(),
    }
}

fn default_ladder() -> Vec<CovariateSet> {
    vec![primary_set(), unadjusted_set()]
}

fn default_sensitivity_ladder() -> Vec<CovariateSet> {
    vec![
        CovariateSet {
            name: "full".to_string(),
            fields: [
                "age",
                "sex",
                "race_eth",
                "bmi",
                "diabetes",
                "hypertension",
                "smoking",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        },
        primary_set(),
        unadjusted_set(),
    ]
}

fn default_input() -> PathBuf {
    PathBuf::from("data/cohort.csv")
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_crp_bound() -> f64 {
    10.0
}

fn default_min_age() -> f64 {
    20.0
}

fn default_quartile_count() -> usize {
    4
}

fn default_min_events() -> usize {
    20
}

fn default_alpha() -> f64 {
    0.05
}

/// Styling handed to the figure renderers; no process-wide palette state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FigureConfig {
    pub width: u32,
    pub height: u32,
    /// Ordinal palette, index 0 = lowest-resilience stratum, rendered as the
    /// visually "worst" end in every chart.
    pub palette: Vec<String>,
}

impl Default for FigureConfig {
    fn default() -> Self {
        Self {
            width: 720,
            height: 420,
            palette: vec![
                "#d73027".to_string(),
                "#fc8d59".to_string(),
                "#91bfdb".to_string(),
                "#4575b4".to_string(),
            ],
        }
    }
}

impl FigureConfig {
    /// Palette color for a stratum, cycling if the palette is shorter than
    /// the stratum count.
    pub fn color(&self, stratum: usize) -> &str {
        &self.palette[stratum % self.palette.len()]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunConfig {
    /// Raw survey extract (CSV, schema per `analysis::schema`).
    pub input: PathBuf,
    /// Directory receiving every emitted artifact.
    pub out_dir: PathBuf,
    /// Inclusive upper bound on hs-CRP (mg/L); above it, acute inflammation
    /// is assumed and the row is excluded.
    pub crp_bound: f64,
    /// Minimum age in years for eligibility.
    pub min_age: f64,
    /// Number of score strata (4 = quartiles).
    pub quartile_count: usize,
    /// Minimum unweighted event count below which a model is reported as
    /// underpowered instead of fitted.
    pub min_events: usize,
    /// Two-sided significance level for confidence intervals.
    pub alpha: f64,
    /// Ordered covariate-set candidates for the primary analysis; the
    /// estimator tries each in turn.
    pub ladder: Vec<CovariateSet>,
    /// Candidates for the fully-adjusted sensitivity analysis, reported
    /// alongside the primary result. Empty disables the sensitivity fits.
    pub sensitivity_ladder: Vec<CovariateSet>,
    pub figure: FigureConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            out_dir: default_out_dir(),
            crp_bound: default_crp_bound(),
            min_age: default_min_age(),
            quartile_count: default_quartile_count(),
            min_events: default_min_events(),
            alpha: default_alpha(),
            ladder: default_ladder(),
            sensitivity_ladder: default_sensitivity_ladder(),
            figure: FigureConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: RunConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ladder.is_empty() {
            return Err(ConfigError::EmptyLadder);
        }
        if self.quartile_count < 2 {
            return Err(ConfigError::DegenerateQuartileCount(self.quartile_count));
        }
        for set in self.ladder.iter().chain(&self.sensitivity_ladder) {
            for field in &set.fields {
                if !KNOWN_COVARIATES.contains(&field.as_str()) {
                    return Err(ConfigError::UnknownCovariate(field.clone()));
                }
            }
        }
        Ok(())
    }
}
