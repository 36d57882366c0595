use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process;

use resin::cohort::{build_cohort, read_scored_cohort, write_scored_cohort, ScoredCohort};
use resin::config::RunConfig;
use resin::cox::weighted_kaplan_meier;
use resin::estimator::{estimate_associations, Outcome, OUTCOMES};
use resin::figures::{
    render_forest_svg, render_km_svg, render_prevalence_bars_svg, render_violin_svg, ForestEntry,
};
use resin::report::{
    flatten_associations, read_association_table, write_association_table, write_exclusion_tally,
    write_prevalence_table, write_summary_table, AssociationRow,
};
use resin::schema::load_raw_cohort;
use resin::tabulate::{baseline_table, cohort_design, component_table, outcome_prevalence};

#[derive(Args)]
struct ConfigArgs {
    /// Path to a TOML run configuration; defaults apply when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the input CSV path from the configuration.
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Override the output directory from the configuration.
    #[arg(long, value_name = "DIR")]
    out: Option<PathBuf>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<RunConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(input) = &self.input {
            config.input = input.clone();
        }
        if let Some(out) = &self.out {
            config.out_dir = out.clone();
        }
        Ok(config)
    }
}

#[derive(Parser)]
#[command(
    name = "resin",
    about = "Inflammatory resilience index construction and survey-weighted association analysis",
    long_about = "Builds a composite inflammatory resilience score from a harmonized survey \
                 extract, stratifies it into quartiles, and estimates design-based \
                 associations with health outcomes. Emits CSV tables and SVG figures."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply eligibility rules, freeze parameters and score the cohort
    #[command(about = "Build the scored cohort (outputs: cohort_scored.csv, frozen_params.toml)")]
    Build(ConfigArgs),

    /// Survey-weighted descriptive tables by score quartile
    #[command(about = "Write baseline, component and prevalence tables")]
    Tabulate(ConfigArgs),

    /// Fit every outcome model with the covariate ladder
    #[command(about = "Fit association models (outputs: associations.csv)")]
    Fit(ConfigArgs),

    /// Render SVG figures from the fitted results
    #[command(about = "Render forest, bar, violin and survival figures")]
    Report(ConfigArgs),

    /// Run build, tabulate, fit and report in sequence
    #[command(about = "Run the full pipeline")]
    Run(ConfigArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Build(args) => args.resolve().and_then(|c| run_build(&c)),
        Commands::Tabulate(args) => args.resolve().and_then(|c| run_tabulate(&c)),
        Commands::Fit(args) => args.resolve().and_then(|c| run_fit(&c)),
        Commands::Report(args) => args.resolve().and_then(|c| run_report(&c)),
        Commands::Run(args) => args.resolve().and_then(|c| {
            run_build(&c)?;
            run_tabulate(&c)?;
            run_fit(&c)?;
            run_report(&c)
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn ensure_out_dir(config: &RunConfig) -> Result<(), Box<dyn Error>> {
    std::fs::create_dir_all(&config.out_dir)?;
    Ok(())
}

fn scored_cohort_path(config: &RunConfig) -> PathBuf {
    config.out_dir.join("cohort_scored.csv")
}

fn run_build(config: &RunConfig) -> Result<(), Box<dyn Error>> {
    ensure_out_dir(config)?;
    println!("Loading raw extract from: {}", config.input.display());
    let raw = load_raw_cohort(&config.input)?;
    println!("Loaded {} rows", raw.n_rows());

    let (cohort, params, tally) = build_cohort(&raw, config)?;
    println!(
        "Eligible: {} of {} (quartile cuts: {:?})",
        tally.eligible, tally.total, params.quartile_cuts
    );

    write_scored_cohort(&cohort, &scored_cohort_path(config))?;
    params.save(&config.out_dir.join("frozen_params.toml"))?;
    write_exclusion_tally(&tally, &config.out_dir.join("exclusions.csv"))?;
    println!("Scored cohort written to: {}", scored_cohort_path(config).display());
    Ok(())
}

fn load_scored(config: &RunConfig) -> Result<ScoredCohort, Box<dyn Error>> {
    let path = scored_cohort_path(config);
    println!("Loading scored cohort from: {}", path.display());
    Ok(read_scored_cohort(&path)?)
}

fn run_tabulate(config: &RunConfig) -> Result<(), Box<dyn Error>> {
    ensure_out_dir(config)?;
    let cohort = load_scored(config)?;
    let design = cohort_design(&cohort);

    write_summary_table(&baseline_table(&cohort, &design), &config.out_dir.join("baseline.csv"))?;
    write_summary_table(
        &component_table(&cohort, &design),
        &config.out_dir.join("components.csv"),
    )?;
    write_prevalence_table(
        &outcome_prevalence(&cohort, &design),
        &config.out_dir.join("prevalence.csv"),
    )?;
    println!("Tables written to: {}", config.out_dir.display());
    Ok(())
}

fn run_fit(config: &RunConfig) -> Result<(), Box<dyn Error>> {
    ensure_out_dir(config)?;
    let cohort = load_scored(config)?;
    let results = estimate_associations(&cohort, config)?;
    let rows = flatten_associations(&results);
    write_association_table(&rows, &config.out_dir.join("associations.csv"))?;
    println!("Association table written ({} rows)", rows.len());
    Ok(())
}

// Forest plots show the primary analysis; the fully-adjusted sensitivity
// rows stay in the table only.
fn forest_entries(rows: &[AssociationRow], outcome: &str) -> Vec<ForestEntry> {
    rows.iter()
        .filter(|r| {
            r.outcome == outcome
                && r.analysis == "primary"
                && r.predictor == "quartile"
                && r.status == "fitted"
        })
        .filter_map(|r| {
            Some(ForestEntry {
                label: r.term.clone(),
                estimate: r.estimate?,
                lower: r.ci_lower?,
                upper: r.ci_upper?,
            })
        })
        .collect()
}

fn run_report(config: &RunConfig) -> Result<(), Box<dyn Error>> {
    ensure_out_dir(config)?;
    let cohort = load_scored(config)?;
    let design = cohort_design(&cohort);
    let rows = read_association_table(&config.out_dir.join("associations.csv"))?;
    let stratum_count = cohort.stratum_count();
    let stratum_labels: Vec<String> = (1..=stratum_count).map(|q| format!("Q{q}")).collect();

    for &outcome in OUTCOMES {
        let entries = forest_entries(&rows, outcome.label());
        if entries.is_empty() {
            continue;
        }
        let effect = if outcome.is_survival() { "HR" } else { "OR" };
        let covariates = rows
            .iter()
            .find(|r| {
                r.outcome == outcome.label()
                    && r.analysis == "primary"
                    && r.predictor == "quartile"
                    && r.status == "fitted"
            })
            .map(|r| r.covariates.clone())
            .unwrap_or_default();
        let title = format!("{} ({}, vs Q{stratum_count}, {covariates})", outcome.label(), effect);
        let svg = render_forest_svg(&entries, &title, &config.figure);
        let path = config.out_dir.join(format!("forest_{}.svg", outcome.label()));
        std::fs::write(&path, svg)?;
        println!("Figure written to: {}", path.display());
    }

    let prevalence = outcome_prevalence(&cohort, &design);
    let bars = render_prevalence_bars_svg(
        &prevalence,
        &stratum_labels,
        "Outcome prevalence by quartile",
        &config.figure,
    );
    std::fs::write(config.out_dir.join("prevalence.svg"), bars)?;

    let violin_groups: Vec<(String, Vec<f64>)> = (0..stratum_count)
        .map(|s| {
            let values = cohort.stratum_rows(s).iter().map(|&i| cohort.score[i]).collect();
            (stratum_labels[s].clone(), values)
        })
        .collect();
    let violins = render_violin_svg(&violin_groups, "Score distribution by quartile", &config.figure);
    std::fs::write(config.out_dir.join("score_distribution.svg"), violins)?;

    for outcome in [Outcome::AllCauseMortality, Outcome::CvMortality] {
        let indicator = outcome.indicator(&cohort);
        let curves: Vec<(String, _)> = (0..stratum_count)
            .map(|s| {
                let rows: Vec<usize> = cohort
                    .stratum_rows(s)
                    .into_iter()
                    .filter(|&i| !indicator[i].is_nan() && !cohort.followup_years[i].is_nan())
                    .collect();
                let curve = weighted_kaplan_meier(
                    cohort.followup_years.view(),
                    indicator.view(),
                    &cohort.weight,
                    &rows,
                );
                (stratum_labels[s].clone(), curve)
            })
            .collect();
        let svg = render_km_svg(
            &curves,
            &format!("Weighted survival: {}", outcome.label()),
            &config.figure,
        );
        std::fs::write(
            config.out_dir.join(format!("survival_{}.svg", outcome.label())),
            svg,
        )?;
    }
    println!("Figures written to: {}", config.out_dir.display());
    Ok(())
}
