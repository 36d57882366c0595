pub mod cohort;
pub mod config;
pub mod cox;
pub mod design;
pub mod estimator;
pub mod faer_ndarray;
pub mod figures;
pub mod logistic;
pub mod quartiles;
pub mod report;
pub mod schema;
pub mod stats;
pub mod tabulate;
