//! # Figure Rendering
//!
//! Every chart is built as an SVG string with no drawing dependency: a
//! forest plot of quartile effect estimates, grouped prevalence bars, score
//! violins per stratum and Kaplan-Meier curves. Rendering is pure string
//! assembly over numbers computed upstream, so output is deterministic and
//! diffable.
//!
//! Color is ordinal: palette index 0 is the lowest-resilience stratum in
//! every chart, so the "worst" group reads identically across figures.

use crate::config::FigureConfig;
use crate::cox::KmCurve;
use crate::tabulate::PrevalenceCell;
use std::fmt::Write as _;

const MARGIN_LEFT: f64 = 130.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_TOP: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 50.0;
const FONT: &str = "font-family=\"Helvetica, Arial, sans-serif\"";

/// One line of a forest plot: an exponentiated effect with its interval.
#[derive(Debug, Clone)]
pub struct ForestEntry {
    pub label: String,
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

struct Frame {
    width: f64,
    height: f64,
    plot_left: f64,
    plot_right: f64,
    plot_top: f64,
    plot_bottom: f64,
}

impl Frame {
    fn new(config: &FigureConfig) -> Self {
        let width = config.width as f64;
        let height = config.height as f64;
        Self {
            width,
            height,
            plot_left: MARGIN_LEFT,
            plot_right: width - MARGIN_RIGHT,
            plot_top: MARGIN_TOP,
            plot_bottom: height - MARGIN_BOTTOM,
        }
    }

    fn x(&self, fraction: f64) -> f64 {
        self.plot_left + fraction * (self.plot_right - self.plot_left)
    }

    fn y(&self, fraction: f64) -> f64 {
        // SVG y grows downward; fraction 0 is the plot floor.
        self.plot_bottom - fraction * (self.plot_bottom - self.plot_top)
    }
}

fn open_svg(frame: &Frame, title: &str) -> String {
    let mut svg = String::new();
    let _ = write!(
        svg,
        "<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 {:.0} {:.0}\" width=\"{:.0}\" height=\"{:.0}\">\n",
        frame.width, frame.height, frame.width, frame.height
    );
    let _ = write!(
        svg,
        "<rect width=\"{:.0}\" height=\"{:.0}\" fill=\"white\"/>\n",
        frame.width, frame.height
    );
    let _ = write!(
        svg,
        "<text x=\"{:.1}\" y=\"24\" {FONT} font-size=\"15\" font-weight=\"bold\">{}</text>\n",
        frame.width / 2.0 - 4.0 * title.len() as f64,
        escape(title)
    );
    svg
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn axis_line(svg: &mut String, x1: f64, y1: f64, x2: f64, y2: f64) {
    let _ = write!(
        svg,
        "<line x1=\"{x1:.1}\" y1=\"{y1:.1}\" x2=\"{x2:.1}\" y2=\"{y2:.1}\" stroke=\"#333\" stroke-width=\"1\"/>\n"
    );
}

fn tick_label(svg: &mut String, x: f64, y: f64, anchor: &str, text: &str) {
    let _ = write!(
        svg,
        "<text x=\"{x:.1}\" y=\"{y:.1}\" {FONT} font-size=\"11\" text-anchor=\"{anchor}\">{}</text>\n",
        escape(text)
    );
}

/// "Nice" tick values covering `[lo, hi]` on a linear scale.
fn linear_ticks(lo: f64, hi: f64, target: usize) -> Vec<f64> {
    let span = (hi - lo).max(f64::MIN_POSITIVE);
    let raw_step = span / target as f64;
    let magnitude = 10f64.powf(raw_step.log10().floor());
    let step = [1.0, 2.0, 5.0, 10.0]
        .iter()
        .map(|&m| m * magnitude)
        .find(|&s| s >= raw_step)
        .unwrap_or(magnitude * 10.0);
    let mut ticks = Vec::new();
    let mut tick = (lo / step).ceil() * step;
    while tick <= hi + step * 1e-9 {
        ticks.push(tick);
        tick += step;
    }
    ticks
}

/// Forest plot on a log-scaled axis with the null line at 1.
///
/// Entries render top to bottom in the order given. Entries with
/// non-positive or non-finite bounds are skipped; a ratio estimate that
/// produced them is not plottable on a log axis.
pub fn render_forest_svg(entries: &[ForestEntry], title: &str, config: &FigureConfig) -> String {
    let frame = Frame::new(config);
    let mut svg = open_svg(&frame, title);

    let plottable: Vec<&ForestEntry> = entries
        .iter()
        .filter(|e| e.lower > 0.0 && e.upper.is_finite() && e.estimate > 0.0)
        .collect();
    if plottable.is_empty() {
        tick_label(
            &mut svg,
            frame.width / 2.0,
            frame.height / 2.0,
            "middle",
            "no plottable estimates",
        );
        svg.push_str("</svg>\n");
        return svg;
    }

    let mut log_min = 0f64;
    let mut log_max = 0f64;
    for entry in &plottable {
        log_min = log_min.min(entry.lower.ln());
        log_max = log_max.max(entry.upper.ln());
    }
    let pad = 0.05 * (log_max - log_min).max(0.2);
    log_min -= pad;
    log_max += pad;
    let x_of = |value: f64| frame.x((value.ln() - log_min) / (log_max - log_min));

    // Null reference line.
    let null_x = x_of(1.0);
    let _ = write!(
        svg,
        "<line x1=\"{null_x:.1}\" y1=\"{:.1}\" x2=\"{null_x:.1}\" y2=\"{:.1}\" stroke=\"#999\" stroke-dasharray=\"4 3\"/>\n",
        frame.plot_top, frame.plot_bottom
    );

    let rows = plottable.len() as f64;
    for (i, entry) in plottable.iter().enumerate() {
        let y = frame.plot_top + (i as f64 + 0.5) / rows * (frame.plot_bottom - frame.plot_top);
        let color = config.color(i);
        let _ = write!(
            svg,
            "<line x1=\"{:.1}\" y1=\"{y:.1}\" x2=\"{:.1}\" y2=\"{y:.1}\" stroke=\"{color}\" stroke-width=\"2\"/>\n",
            x_of(entry.lower),
            x_of(entry.upper)
        );
        let _ = write!(
            svg,
            "<rect x=\"{:.1}\" y=\"{:.1}\" width=\"8\" height=\"8\" fill=\"{color}\"/>\n",
            x_of(entry.estimate) - 4.0,
            y - 4.0
        );
        tick_label(&mut svg, frame.plot_left - 8.0, y + 4.0, "end", &entry.label);
    }

    axis_line(&mut svg, frame.plot_left, frame.plot_bottom, frame.plot_right, frame.plot_bottom);
    for tick in [0.25f64, 0.5, 1.0, 2.0, 4.0] {
        if tick.ln() < log_min || tick.ln() > log_max {
            continue;
        }
        let x = x_of(tick);
        axis_line(&mut svg, x, frame.plot_bottom, x, frame.plot_bottom + 4.0);
        tick_label(&mut svg, x, frame.plot_bottom + 18.0, "middle", &format!("{tick}"));
    }
    svg.push_str("</svg>\n");
    svg
}

/// Grouped bar chart of outcome prevalence: one cluster per outcome, one
/// bar per stratum within the cluster.
pub fn render_prevalence_bars_svg(
    cells: &[PrevalenceCell],
    stratum_labels: &[String],
    title: &str,
    config: &FigureConfig,
) -> String {
    let frame = Frame::new(config);
    let mut svg = open_svg(&frame, title);

    let outcomes: Vec<&str> = {
        let mut seen = Vec::new();
        for cell in cells {
            if !seen.contains(&cell.outcome) {
                seen.push(cell.outcome);
            }
        }
        seen
    };
    let max_prevalence = cells
        .iter()
        .map(|c| c.estimate.estimate)
        .filter(|v| v.is_finite())
        .fold(0.0f64, f64::max)
        .max(0.05);
    let y_top = (max_prevalence * 1.15).min(1.0);

    let strata = stratum_labels.len().max(1);
    let cluster_width = (frame.plot_right - frame.plot_left) / outcomes.len().max(1) as f64;
    let bar_width = cluster_width * 0.8 / strata as f64;

    for cell in cells {
        let Some(cluster) = outcomes.iter().position(|&o| o == cell.outcome) else {
            continue;
        };
        if !cell.estimate.estimate.is_finite() {
            continue;
        }
        let x = frame.plot_left
            + cluster as f64 * cluster_width
            + cluster_width * 0.1
            + cell.stratum as f64 * bar_width;
        let top = frame.y(cell.estimate.estimate / y_top);
        let _ = write!(
            svg,
            "<rect x=\"{x:.1}\" y=\"{top:.1}\" width=\"{:.1}\" height=\"{:.1}\" fill=\"{}\"/>\n",
            bar_width - 1.0,
            frame.plot_bottom - top,
            config.color(cell.stratum)
        );
    }

    axis_line(&mut svg, frame.plot_left, frame.plot_top, frame.plot_left, frame.plot_bottom);
    axis_line(&mut svg, frame.plot_left, frame.plot_bottom, frame.plot_right, frame.plot_bottom);
    for tick in linear_ticks(0.0, y_top, 5) {
        let y = frame.y(tick / y_top);
        axis_line(&mut svg, frame.plot_left - 4.0, y, frame.plot_left, y);
        tick_label(&mut svg, frame.plot_left - 8.0, y + 4.0, "end", &format!("{:.0}%", tick * 100.0));
    }
    for (cluster, outcome) in outcomes.iter().enumerate() {
        let x = frame.plot_left + (cluster as f64 + 0.5) * cluster_width;
        tick_label(&mut svg, x, frame.plot_bottom + 18.0, "middle", outcome);
    }
    // Stratum legend along the top edge.
    for (stratum, label) in stratum_labels.iter().enumerate() {
        let x = frame.plot_left + stratum as f64 * 70.0;
        let _ = write!(
            svg,
            "<rect x=\"{x:.1}\" y=\"{:.1}\" width=\"10\" height=\"10\" fill=\"{}\"/>\n",
            frame.plot_top - 14.0,
            config.color(stratum)
        );
        tick_label(&mut svg, x + 14.0, frame.plot_top - 5.0, "start", label);
    }
    svg.push_str("</svg>\n");
    svg
}

/// Gaussian kernel density over a fixed grid, Silverman's bandwidth.
fn kernel_density(values: &[f64], grid: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; grid.len()];
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let sd = (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64).sqrt();
    let bandwidth = (0.9 * sd * (n as f64).powf(-0.2)).max(1e-6);
    let norm = 1.0 / ((n as f64) * bandwidth * (2.0 * std::f64::consts::PI).sqrt());
    grid.iter()
        .map(|&g| {
            values
                .iter()
                .map(|&v| {
                    let z = (g - v) / bandwidth;
                    (-0.5 * z * z).exp()
                })
                .sum::<f64>()
                * norm
        })
        .collect()
}

/// Violin plot of the score distribution per stratum.
pub fn render_violin_svg(
    groups: &[(String, Vec<f64>)],
    title: &str,
    config: &FigureConfig,
) -> String {
    let frame = Frame::new(config);
    let mut svg = open_svg(&frame, title);

    let finite: Vec<f64> = groups
        .iter()
        .flat_map(|(_, v)| v.iter().copied())
        .filter(|v| v.is_finite())
        .collect();
    if finite.is_empty() {
        tick_label(&mut svg, frame.width / 2.0, frame.height / 2.0, "middle", "no data");
        svg.push_str("</svg>\n");
        return svg;
    }
    let value_min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let value_max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = (value_max - value_min).max(1e-9);
    let grid: Vec<f64> = (0..64)
        .map(|i| value_min + span * i as f64 / 63.0)
        .collect();

    let slot = (frame.plot_right - frame.plot_left) / groups.len().max(1) as f64;
    for (g, (label, values)) in groups.iter().enumerate() {
        let clean: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let density = kernel_density(&clean, &grid);
        let peak = density.iter().copied().fold(0.0f64, f64::max).max(1e-12);
        let center = frame.plot_left + (g as f64 + 0.5) * slot;
        let half_width = slot * 0.4;

        let mut points = Vec::with_capacity(grid.len() * 2);
        for (i, &value) in grid.iter().enumerate() {
            let y = frame.y((value - value_min) / span);
            points.push((center - half_width * density[i] / peak, y));
        }
        for (i, &value) in grid.iter().enumerate().rev() {
            let y = frame.y((value - value_min) / span);
            points.push((center + half_width * density[i] / peak, y));
        }
        let path: String = points
            .iter()
            .map(|(x, y)| format!("{x:.1},{y:.1}"))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = write!(
            svg,
            "<polygon points=\"{path}\" fill=\"{}\" fill-opacity=\"0.75\" stroke=\"#333\" stroke-width=\"0.5\"/>\n",
            config.color(g)
        );
        tick_label(&mut svg, center, frame.plot_bottom + 18.0, "middle", label);
    }

    axis_line(&mut svg, frame.plot_left, frame.plot_top, frame.plot_left, frame.plot_bottom);
    for tick in linear_ticks(value_min, value_max, 6) {
        let y = frame.y((tick - value_min) / span);
        axis_line(&mut svg, frame.plot_left - 4.0, y, frame.plot_left, y);
        tick_label(&mut svg, frame.plot_left - 8.0, y + 4.0, "end", &format!("{tick:.1}"));
    }
    svg.push_str("</svg>\n");
    svg
}

/// Kaplan-Meier survival curves, one step function per stratum.
pub fn render_km_svg(
    curves: &[(String, KmCurve)],
    title: &str,
    config: &FigureConfig,
) -> String {
    let frame = Frame::new(config);
    let mut svg = open_svg(&frame, title);

    let time_max = curves
        .iter()
        .flat_map(|(_, c)| c.times.iter().copied())
        .fold(0.0f64, f64::max)
        .max(1e-9);
    let survival_min = curves
        .iter()
        .flat_map(|(_, c)| c.survival.iter().copied())
        .fold(1.0f64, f64::min);
    // Keep the floor a little below the lowest curve but anchored near 1.
    let y_floor = (survival_min - 0.05).clamp(0.0, 0.95);

    for (g, (label, curve)) in curves.iter().enumerate() {
        let mut path = String::new();
        let _ = write!(path, "M {:.1} {:.1}", frame.plot_left, frame.plot_top);
        for (&t, &s) in curve.times.iter().zip(curve.survival.iter()) {
            let x = frame.x(t / time_max);
            let y = frame.y((s - y_floor) / (1.0 - y_floor));
            let _ = write!(path, " H {x:.1} V {y:.1}");
        }
        let _ = write!(path, " H {:.1}", frame.plot_right);
        let _ = write!(
            svg,
            "<path d=\"{path}\" fill=\"none\" stroke=\"{}\" stroke-width=\"2\"/>\n",
            config.color(g)
        );
        let _ = write!(
            svg,
            "<rect x=\"{:.1}\" y=\"{:.1}\" width=\"10\" height=\"10\" fill=\"{}\"/>\n",
            frame.plot_right - 120.0,
            frame.plot_top + 16.0 * g as f64,
            config.color(g)
        );
        tick_label(
            &mut svg,
            frame.plot_right - 106.0,
            frame.plot_top + 16.0 * g as f64 + 9.0,
            "start",
            label,
        );
    }

    axis_line(&mut svg, frame.plot_left, frame.plot_top, frame.plot_left, frame.plot_bottom);
    axis_line(&mut svg, frame.plot_left, frame.plot_bottom, frame.plot_right, frame.plot_bottom);
    for tick in linear_ticks(0.0, time_max, 6) {
        let x = frame.x(tick / time_max);
        axis_line(&mut svg, x, frame.plot_bottom, x, frame.plot_bottom + 4.0);
        tick_label(&mut svg, x, frame.plot_bottom + 18.0, "middle", &format!("{tick:.0}"));
    }
    for tick in linear_ticks(y_floor, 1.0, 5) {
        let y = frame.y((tick - y_floor) / (1.0 - y_floor));
        axis_line(&mut svg, frame.plot_left - 4.0, y, frame.plot_left, y);
        tick_label(&mut svg, frame.plot_left - 8.0, y + 4.0, "end", &format!("{tick:.2}"));
    }
    svg.push_str("</svg>\n");
    svg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::WeightedEstimate;

    fn config() -> FigureConfig {
        FigureConfig::default()
    }

    fn forest_entries() -> Vec<ForestEntry> {
        vec![
            ForestEntry {
                label: "Q1".to_string(),
                estimate: 1.8,
                lower: 1.3,
                upper: 2.5,
            },
            ForestEntry {
                label: "Q2".to_string(),
                estimate: 1.3,
                lower: 0.9,
                upper: 1.9,
            },
            ForestEntry {
                label: "Q3".to_string(),
                estimate: 1.1,
                lower: 0.8,
                upper: 1.5,
            },
        ]
    }

    #[test]
    fn forest_plot_marks_the_null_line_and_every_entry() {
        let svg = render_forest_svg(&forest_entries(), "Odds ratios", &config());
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>\n"));
        assert!(svg.contains("stroke-dasharray"));
        assert_eq!(svg.matches("<rect x=").count(), 3);
        assert!(svg.contains(">Q1<"));
        assert!(svg.contains(">Q3<"));
    }

    #[test]
    fn forest_plot_skips_unplottable_intervals() {
        let mut entries = forest_entries();
        entries.push(ForestEntry {
            label: "bad".to_string(),
            estimate: 0.5,
            lower: 0.0,
            upper: f64::INFINITY,
        });
        let svg = render_forest_svg(&entries, "Odds ratios", &config());
        assert_eq!(svg.matches("<rect x=").count(), 3);
        assert!(!svg.contains(">bad<"));
    }

    #[test]
    fn bar_chart_draws_one_bar_per_cell() {
        let labels: Vec<String> = (1..=4).map(|q| format!("Q{q}")).collect();
        let mut cells = Vec::new();
        for outcome in ["a", "b"] {
            for stratum in 0..4 {
                cells.push(PrevalenceCell {
                    outcome: match outcome {
                        "a" => "fair_poor_health",
                        _ => "depression",
                    },
                    stratum,
                    estimate: WeightedEstimate {
                        estimate: 0.1 + 0.02 * stratum as f64,
                        se: 0.01,
                        n: 100,
                    },
                });
            }
        }
        let svg = render_prevalence_bars_svg(&cells, &labels, "Prevalence", &config());
        // 8 bars + 4 legend swatches + background rect.
        assert_eq!(svg.matches("<rect").count(), 8 + 4 + 1);
        assert!(svg.contains("#d73027"));
        assert!(svg.contains("#4575b4"));
    }

    #[test]
    fn violins_render_one_polygon_per_group() {
        let groups: Vec<(String, Vec<f64>)> = (0..4)
            .map(|g| {
                let values = (0..50).map(|i| g as f64 + 0.07 * i as f64).collect();
                (format!("Q{}", g + 1), values)
            })
            .collect();
        let svg = render_violin_svg(&groups, "Score distribution", &config());
        assert_eq!(svg.matches("<polygon").count(), 4);
    }

    #[test]
    fn km_curves_start_at_full_survival() {
        let curve = KmCurve {
            times: vec![0.0, 1.0, 2.0],
            survival: vec![1.0, 0.9, 0.8],
        };
        let svg = render_km_svg(&[("Q1".to_string(), curve)], "Survival", &config());
        assert_eq!(svg.matches("<path").count(), 1);
        assert!(svg.contains("1.00"));
    }

    #[test]
    fn titles_are_escaped() {
        let svg = render_forest_svg(&forest_entries(), "ORs < 1 & HRs", &config());
        assert!(svg.contains("ORs &lt; 1 &amp; HRs"));
    }
}
