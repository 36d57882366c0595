//! # Cohort Input Loading and Schema Validation
//!
//! Exclusive entry point for the raw survey extract. The column contract is
//! explicit and fixed: every semantic field the pipeline uses maps to one
//! named CSV column with a declared value domain and missingness policy,
//! validated once at load time. Anything that fails validation is a fatal
//! configuration error naming the offending column; eligibility questions
//! (missing biomarkers, out-of-bound CRP) are *not* errors and are handled
//! downstream by the cohort builder.
//!
//! Missing values survive loading as `NaN` inside the column arrays so the
//! eligibility predicate can see them.

use ndarray::Array1;
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Allowed value domain for a column, checked over non-missing entries only.
#[derive(Debug, Clone, Copy)]
pub enum ValueDomain {
    /// Strictly positive reals.
    Positive,
    /// Strictly positive reals; a recorded zero means the value fell below
    /// the assay detection limit and is recoded as missing.
    PositiveZeroMissing,
    /// Non-negative reals.
    NonNegative,
    /// One of a fixed set of numeric codes.
    Codes(&'static [f64]),
    /// Any finite real.
    Any,
}

/// One entry of the column contract.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub column: &'static str,
    pub domain: ValueDomain,
    pub allow_missing: bool,
}

const CODES_SEX: &[f64] = &[1.0, 2.0];
const CODES_FLAG: &[f64] = &[0.0, 1.0];

/// The full column contract, in the order fields appear on [`RawCohort`].
pub const SCHEMA: &[FieldSpec] = &[
    FieldSpec { column: "seqn", domain: ValueDomain::Positive, allow_missing: false },
    FieldSpec { column: "mec_weight", domain: ValueDomain::Positive, allow_missing: true },
    FieldSpec { column: "psu", domain: ValueDomain::Positive, allow_missing: false },
    FieldSpec { column: "strata", domain: ValueDomain::Positive, allow_missing: false },
    FieldSpec { column: "age", domain: ValueDomain::NonNegative, allow_missing: true },
    FieldSpec { column: "sex", domain: ValueDomain::Codes(CODES_SEX), allow_missing: true },
    FieldSpec { column: "race_eth", domain: ValueDomain::Positive, allow_missing: true },
    FieldSpec { column: "hscrp", domain: ValueDomain::PositiveZeroMissing, allow_missing: true },
    FieldSpec { column: "albumin", domain: ValueDomain::Positive, allow_missing: true },
    FieldSpec { column: "almi", domain: ValueDomain::Positive, allow_missing: true },
    FieldSpec { column: "bmi", domain: ValueDomain::Positive, allow_missing: true },
    FieldSpec { column: "diabetes", domain: ValueDomain::Codes(CODES_FLAG), allow_missing: true },
    FieldSpec { column: "hypertension", domain: ValueDomain::Codes(CODES_FLAG), allow_missing: true },
    FieldSpec { column: "current_smoker", domain: ValueDomain::Codes(CODES_FLAG), allow_missing: true },
    FieldSpec { column: "cvd_history", domain: ValueDomain::Codes(CODES_FLAG), allow_missing: true },
    FieldSpec { column: "srh_fair_poor", domain: ValueDomain::Codes(CODES_FLAG), allow_missing: true },
    FieldSpec { column: "mobility_difficulty", domain: ValueDomain::Codes(CODES_FLAG), allow_missing: true },
    FieldSpec { column: "depression", domain: ValueDomain::Codes(CODES_FLAG), allow_missing: true },
    FieldSpec { column: "followup_years", domain: ValueDomain::NonNegative, allow_missing: true },
    FieldSpec { column: "mort_all", domain: ValueDomain::Codes(CODES_FLAG), allow_missing: true },
    FieldSpec { column: "mort_cv", domain: ValueDomain::Codes(CODES_FLAG), allow_missing: true },
];

/// The validated raw extract: one `f64` column array per contract field,
/// with `NaN` marking missing entries.
#[derive(Debug)]
pub struct RawCohort {
    pub seqn: Array1<f64>,
    pub mec_weight: Array1<f64>,
    pub psu: Array1<f64>,
    pub strata: Array1<f64>,
    pub age: Array1<f64>,
    pub sex: Array1<f64>,
    pub race_eth: Array1<f64>,
    pub hscrp: Array1<f64>,
    pub albumin: Array1<f64>,
    pub almi: Array1<f64>,
    pub bmi: Array1<f64>,
    pub diabetes: Array1<f64>,
    pub hypertension: Array1<f64>,
    pub current_smoker: Array1<f64>,
    pub cvd_history: Array1<f64>,
    pub srh_fair_poor: Array1<f64>,
    pub mobility_difficulty: Array1<f64>,
    pub depression: Array1<f64>,
    pub followup_years: Array1<f64>,
    pub mort_all: Array1<f64>,
    pub mort_cv: Array1<f64>,
}

impl RawCohort {
    pub fn n_rows(&self) -> usize {
        self.seqn.len()
    }
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error reading '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("The required column '{0}' was not found in the input file. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("The column '{column}' could not be converted to a numeric type (found type: {found_type}).")]
    ColumnWrongType { column: String, found_type: String },
    #[error("The column '{0}' does not allow missing values, but null entries were found.")]
    MissingValuesFound(String),
    #[error("Non-finite values (Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Row {row} of column '{column}' holds {value}, outside the declared domain ({domain}).")]
    ValueOutOfDomain {
        column: String,
        row: usize,
        value: f64,
        domain: &'static str,
    },
    #[error("Input file contains no data rows.")]
    EmptyInput,
}

fn domain_label(domain: ValueDomain) -> &'static str {
    match domain {
        ValueDomain::Positive => "strictly positive",
        ValueDomain::PositiveZeroMissing => "strictly positive (zero recoded as missing)",
        ValueDomain::NonNegative => "non-negative",
        ValueDomain::Codes(_) => "a declared code",
        ValueDomain::Any => "finite",
    }
}

fn check_domain(column: &str, values: &[f64], domain: ValueDomain) -> Result<(), SchemaError> {
    for (row, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        if value.is_infinite() {
            return Err(SchemaError::NonFiniteValuesFound(column.to_string()));
        }
        let ok = match domain {
            ValueDomain::Positive | ValueDomain::PositiveZeroMissing => value > 0.0,
            ValueDomain::NonNegative => value >= 0.0,
            ValueDomain::Codes(codes) => codes.contains(&value),
            ValueDomain::Any => true,
        };
        if !ok {
            return Err(SchemaError::ValueOutOfDomain {
                column: column.to_string(),
                row,
                value,
                domain: domain_label(domain),
            });
        }
    }
    Ok(())
}

fn extract_column(df: &DataFrame, spec: &FieldSpec) -> Result<Array1<f64>, SchemaError> {
    let series = df.column(spec.column)?;
    if !spec.allow_missing && series.null_count() > 0 {
        return Err(SchemaError::MissingValuesFound(spec.column.to_string()));
    }

    let casted = match series.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(SchemaError::ColumnWrongType {
                column: spec.column.to_string(),
                found_type: format!("{:?}", series.dtype()),
            });
        }
    };
    if casted.null_count() > series.null_count() {
        // Values that survived the original dtype but not the numeric cast.
        return Err(SchemaError::ColumnWrongType {
            column: spec.column.to_string(),
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    let mut values: Vec<f64> = chunked
        .into_iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect();
    if matches!(spec.domain, ValueDomain::PositiveZeroMissing) {
        for value in &mut values {
            if *value == 0.0 {
                *value = f64::NAN;
            }
        }
    }
    check_domain(spec.column, &values, spec.domain)?;
    Ok(Array1::from_vec(values))
}

/// Reads the raw extract and validates it against [`SCHEMA`].
pub fn load_raw_cohort(path: &Path) -> Result<RawCohort, SchemaError> {
    log::info!("Loading raw cohort extract from '{}'", path.display());

    let file = File::open(path).map_err(|source| SchemaError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let df = CsvReader::new(file)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b',')),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(SchemaError::EmptyInput);
    }

    let present: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for spec in SCHEMA {
        if !present.contains(spec.column) {
            return Err(SchemaError::ColumnNotFound(spec.column.to_string()));
        }
    }

    let mut columns = Vec::with_capacity(SCHEMA.len());
    for spec in SCHEMA {
        columns.push(extract_column(&df, spec)?);
    }
    let mut iter = columns.into_iter();
    let mut next = || iter.next().expect("SCHEMA length matches RawCohort fields");

    let cohort = RawCohort {
        seqn: next(),
        mec_weight: next(),
        psu: next(),
        strata: next(),
        age: next(),
        sex: next(),
        race_eth: next(),
        hscrp: next(),
        albumin: next(),
        almi: next(),
        bmi: next(),
        diabetes: next(),
        hypertension: next(),
        current_smoker: next(),
        cvd_history: next(),
        srh_fair_poor: next(),
        mobility_difficulty: next(),
        depression: next(),
        followup_years: next(),
        mort_all: next(),
        mort_cv: next(),
    };

    log::info!(
        "Loaded {} participants; all {} contract columns validated.",
        cohort.n_rows(),
        SCHEMA.len()
    );
    Ok(cohort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub const HEADER: &str = "seqn,mec_weight,psu,strata,age,sex,race_eth,hscrp,albumin,almi,bmi,diabetes,hypertension,current_smoker,cvd_history,srh_fair_poor,mobility_difficulty,depression,followup_years,mort_all,mort_cv";

    fn write_csv(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn loads_complete_rows() {
        let file = write_csv(&[
            "1,12000,1,1,45,1,3,2.1,4.2,8.1,27.0,0,1,0,0,0,0,0,4.5,0,0",
            "2,9000,2,1,60,2,4,0.9,4.5,6.4,31.2,1,1,1,0,1,1,0,4.5,0,0",
        ]);
        let cohort = load_raw_cohort(file.path()).unwrap();
        assert_eq!(cohort.n_rows(), 2);
        assert_eq!(cohort.sex[1], 2.0);
    }

    #[test]
    fn missing_biomarkers_become_nan() {
        let file = write_csv(&["1,12000,1,1,45,1,3,,4.2,8.1,27.0,0,1,0,0,0,0,0,4.5,0,0"]);
        let cohort = load_raw_cohort(file.path()).unwrap();
        assert!(cohort.hscrp[0].is_nan());
        assert!(!cohort.albumin[0].is_nan());
    }

    #[test]
    fn zero_crp_is_recoded_as_missing_not_fatal() {
        let file = write_csv(&[
            "1,12000,1,1,45,1,3,0,4.2,8.1,27.0,0,1,0,0,0,0,0,4.5,0,0",
            "2,9000,2,1,60,2,4,0.9,4.5,6.4,31.2,1,1,1,0,1,1,0,4.5,0,0",
        ]);
        let cohort = load_raw_cohort(file.path()).unwrap();
        assert!(cohort.hscrp[0].is_nan());
        assert_eq!(cohort.hscrp[1], 0.9);
    }

    #[test]
    fn absent_contract_column_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "seqn,mec_weight").unwrap();
        writeln!(file, "1,12000").unwrap();
        let err = load_raw_cohort(file.path()).unwrap_err();
        assert!(matches!(err, SchemaError::ColumnNotFound(_)));
    }

    #[test]
    fn out_of_domain_code_is_fatal_and_names_the_column() {
        let file = write_csv(&["1,12000,1,1,45,3,3,2.1,4.2,8.1,27.0,0,1,0,0,0,0,0,4.5,0,0"]);
        let err = load_raw_cohort(file.path()).unwrap_err();
        match err {
            SchemaError::ValueOutOfDomain { column, value, .. } => {
                assert_eq!(column, "sex");
                assert_eq!(value, 3.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_identifier_is_fatal() {
        let file = write_csv(&[",12000,1,1,45,1,3,2.1,4.2,8.1,27.0,0,1,0,0,0,0,0,4.5,0,0"]);
        let err = load_raw_cohort(file.path()).unwrap_err();
        assert!(matches!(err, SchemaError::MissingValuesFound(_)));
    }
}
