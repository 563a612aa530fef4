//! Per-iteration timing ledger of named operations.
//!
//! Each iteration owns one table of [`OperationTiming`]s: the top-level
//! [`OPERATION_ITERATION`] span plus flat, named sub-operations (one per
//! phase). Operation names are collected in first-seen order and become the
//! columns of the persisted report.
//!
//! The report is rewritten in full after every iteration so an aborted run
//! still leaves a complete file for the iterations that finished.
//!
//! # Report format
//!
//! Tab-separated text, one row per iteration:
//!
//! ```text
//! Iteration  BEGIN iteration  END iteration  BEGIN mobsim  END mobsim  ...  iteration  mobsim  ...
//! 0          12:00:01.250     12:00:03.900   12:00:01.700  12:00:03.100 ... 2.650      1.400   ...
//! ```
//!
//! Timestamps are UTC wall-clock times; the trailing columns are durations
//! in seconds.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cyclesim_types::IterationIndex;

/// Name of the span that covers a whole iteration.
pub const OPERATION_ITERATION: &str = "iteration";

/// Colors cycled through for chart series.
const CHART_PALETTE: [&str; 8] = [
    "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948", "#b07aa1", "#9c755f",
];

/// Errors that can occur while persisting the stopwatch.
#[derive(Debug, thiserror::Error)]
pub enum StopwatchError {
    /// Writing a report file failed.
    #[error("failed to write stopwatch report {path}: {source}")]
    Io {
        /// The file that could not be written.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Formatting a report failed.
    #[error("failed to format stopwatch report: {0}")]
    Format(#[from] std::fmt::Error),
}

/// Start and end of one named operation within one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationTiming {
    /// Operation name.
    pub name: String,
    /// When the operation began.
    pub started_at: DateTime<Utc>,
    /// When the operation ended, if it has.
    pub ended_at: Option<DateTime<Utc>>,
}

impl OperationTiming {
    /// Elapsed time, or `None` while the operation is still open.
    ///
    /// A clock that stepped backwards yields a zero duration.
    pub fn duration(&self) -> Option<Duration> {
        let ended = self.ended_at?;
        Some(
            ended
                .signed_duration_since(self.started_at)
                .to_std()
                .unwrap_or_default(),
        )
    }
}

/// Timing ledger for all iterations of a run.
#[derive(Debug, Clone, Default)]
pub struct IterationStopwatch {
    iterations: BTreeMap<IterationIndex, BTreeMap<String, OperationTiming>>,
    operation_names: Vec<String>,
    current: Option<IterationIndex>,
}

impl IterationStopwatch {
    /// Create an empty stopwatch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new iteration and open its top-level span.
    pub fn begin_iteration(&mut self, iteration: IterationIndex) {
        self.current = Some(iteration);
        self.iterations.entry(iteration).or_default();
        self.begin_operation(OPERATION_ITERATION);
    }

    /// Record the start of `name` in the current iteration.
    ///
    /// Beginning an operation that is already open overwrites its start.
    pub fn begin_operation(&mut self, name: &str) {
        let Some(iteration) = self.current else {
            warn!(operation = name, "stopwatch operation begun outside an iteration");
            return;
        };
        if !self.operation_names.iter().any(|known| known == name) {
            self.operation_names.push(name.to_owned());
        }
        let table = self.iterations.entry(iteration).or_default();
        table.insert(
            name.to_owned(),
            OperationTiming {
                name: name.to_owned(),
                started_at: Utc::now(),
                ended_at: None,
            },
        );
    }

    /// Record the end of `name` in the current iteration.
    pub fn end_operation(&mut self, name: &str) {
        let timing = self
            .current
            .and_then(|iteration| self.iterations.get_mut(&iteration))
            .and_then(|table| table.get_mut(name));
        match timing {
            Some(timing) => timing.ended_at = Some(Utc::now()),
            None => debug!(operation = name, "stopwatch operation ended without a begin"),
        }
    }

    /// Close the top-level span of the current iteration.
    pub fn end_iteration(&mut self) {
        self.end_operation(OPERATION_ITERATION);
        self.current = None;
    }

    /// The iteration currently being timed.
    pub const fn current_iteration(&self) -> Option<IterationIndex> {
        self.current
    }

    /// Known operation names in first-seen order.
    pub fn operation_names(&self) -> &[String] {
        &self.operation_names
    }

    /// The timing table of `iteration`.
    pub fn timings(&self, iteration: IterationIndex) -> Option<&BTreeMap<String, OperationTiming>> {
        self.iterations.get(&iteration)
    }

    /// Duration of `name` in `iteration`, if both ends were recorded.
    pub fn duration(&self, iteration: IterationIndex, name: &str) -> Option<Duration> {
        self.timings(iteration)?.get(name)?.duration()
    }

    /// Render the tab-separated report for all iterations so far.
    ///
    /// # Errors
    ///
    /// Returns [`StopwatchError::Format`] if string formatting fails.
    pub fn render_text(&self) -> Result<String, StopwatchError> {
        let mut out = String::from("Iteration");
        for name in &self.operation_names {
            write!(out, "\tBEGIN {name}\tEND {name}")?;
        }
        for name in &self.operation_names {
            write!(out, "\t{name}")?;
        }
        out.push('\n');

        for (iteration, table) in &self.iterations {
            write!(out, "{iteration}")?;
            for name in &self.operation_names {
                let timing = table.get(name);
                let begin = timing.map(|t| format_time(t.started_at));
                let end = timing.and_then(|t| t.ended_at).map(format_time);
                write!(
                    out,
                    "\t{}\t{}",
                    begin.unwrap_or_default(),
                    end.unwrap_or_default()
                )?;
            }
            for name in &self.operation_names {
                let secs = table
                    .get(name)
                    .and_then(OperationTiming::duration)
                    .map(|d| format!("{:.3}", d.as_secs_f64()));
                write!(out, "\t{}", secs.unwrap_or_default())?;
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Render an SVG stacked-bar chart of operation durations per
    /// iteration. The top-level iteration span is drawn as an outline.
    ///
    /// # Errors
    ///
    /// Returns [`StopwatchError::Format`] if string formatting fails.
    pub fn render_svg(&self) -> Result<String, StopwatchError> {
        const BAR_WIDTH: f64 = 24.0;
        const GAP: f64 = 8.0;
        const PLOT_HEIGHT: f64 = 300.0;
        const MARGIN: f64 = 50.0;
        const LEGEND_WIDTH: f64 = 220.0;

        let series: Vec<&String> = self
            .operation_names
            .iter()
            .filter(|name| name.as_str() != OPERATION_ITERATION)
            .collect();

        let max_secs = self
            .iterations
            .keys()
            .filter_map(|i| self.duration(*i, OPERATION_ITERATION))
            .map(|d| d.as_secs_f64())
            .fold(0.0_f64, f64::max)
            .max(0.001);

        let count = as_f64(self.iterations.len());
        let width = MARGIN * 2.0 + count * (BAR_WIDTH + GAP) + LEGEND_WIDTH;
        let height = PLOT_HEIGHT + MARGIN * 2.0;
        let baseline = MARGIN + PLOT_HEIGHT;
        let scale = PLOT_HEIGHT / max_secs;

        let mut svg = String::new();
        writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width:.0}" height="{height:.0}" font-family="sans-serif" font-size="11">"#
        )?;
        writeln!(
            svg,
            r#"<text x="{MARGIN}" y="20" font-size="14">Stopwatch (seconds per iteration)</text>"#
        )?;
        writeln!(
            svg,
            r#"<line x1="{MARGIN}" y1="{baseline}" x2="{:.1}" y2="{baseline}" stroke="black"/>"#,
            MARGIN + count * (BAR_WIDTH + GAP)
        )?;
        writeln!(
            svg,
            r#"<text x="4" y="{:.1}">{max_secs:.2}s</text>"#,
            MARGIN + 4.0
        )?;

        for (slot, (iteration, table)) in self.iterations.iter().enumerate() {
            let x = MARGIN + as_f64(slot) * (BAR_WIDTH + GAP);
            let mut top = baseline;
            for (idx, name) in series.iter().enumerate() {
                let Some(secs) = table
                    .get(name.as_str())
                    .and_then(OperationTiming::duration)
                    .map(|d| d.as_secs_f64())
                else {
                    continue;
                };
                let h = secs * scale;
                top -= h;
                writeln!(
                    svg,
                    r#"<rect x="{x:.1}" y="{top:.1}" width="{BAR_WIDTH}" height="{h:.1}" fill="{}"><title>{name} [{iteration}]: {secs:.3}s</title></rect>"#,
                    palette(idx)
                )?;
            }
            if let Some(total) = self.duration(*iteration, OPERATION_ITERATION) {
                let h = total.as_secs_f64() * scale;
                writeln!(
                    svg,
                    r#"<rect x="{x:.1}" y="{:.1}" width="{BAR_WIDTH}" height="{h:.1}" fill="none" stroke="black" stroke-dasharray="2,2"/>"#,
                    baseline - h
                )?;
            }
            writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="middle">{iteration}</text>"#,
                x + BAR_WIDTH / 2.0,
                baseline + 14.0
            )?;
        }

        let legend_x = MARGIN + count * (BAR_WIDTH + GAP) + 20.0;
        for (idx, name) in series.iter().enumerate() {
            let y = MARGIN + as_f64(idx) * 16.0;
            writeln!(
                svg,
                r#"<rect x="{legend_x:.1}" y="{y:.1}" width="10" height="10" fill="{}"/><text x="{:.1}" y="{:.1}">{name}</text>"#,
                palette(idx),
                legend_x + 14.0,
                y + 9.0
            )?;
        }
        svg.push_str("</svg>\n");
        Ok(svg)
    }

    /// Rewrite the text report at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StopwatchError`] if rendering or writing fails.
    pub fn write_text_file(&self, path: &Path) -> Result<(), StopwatchError> {
        let text = self.render_text()?;
        write_file(path, &text)
    }

    /// Rewrite the SVG chart at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StopwatchError`] if rendering or writing fails.
    pub fn write_graph_file(&self, path: &Path) -> Result<(), StopwatchError> {
        let svg = self.render_svg()?;
        write_file(path, &svg)
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%H:%M:%S%.3f").to_string()
}

fn as_f64(n: usize) -> f64 {
    u32::try_from(n).map_or(f64::from(u32::MAX), f64::from)
}

fn palette(idx: usize) -> &'static str {
    CHART_PALETTE
        .get(idx % CHART_PALETTE.len())
        .copied()
        .unwrap_or("#888888")
}

fn write_file(path: &Path, contents: &str) -> Result<(), StopwatchError> {
    std::fs::write(path, contents).map_err(|source| StopwatchError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn timed_iterations(count: IterationIndex) -> IterationStopwatch {
        let mut sw = IterationStopwatch::new();
        for i in 0..count {
            sw.begin_iteration(i);
            sw.begin_operation("replanning");
            sw.end_operation("replanning");
            sw.begin_operation("mobsim");
            sw.end_operation("mobsim");
            sw.end_iteration();
        }
        sw
    }

    #[test]
    fn names_are_kept_in_first_seen_order() {
        let sw = timed_iterations(2);
        assert_eq!(sw.operation_names(), ["iteration", "replanning", "mobsim"]);
    }

    #[test]
    fn closed_operations_have_durations() {
        let sw = timed_iterations(1);
        assert!(sw.duration(0, "mobsim").is_some());
        assert!(sw.duration(0, OPERATION_ITERATION).is_some());
        assert!(sw.duration(1, "mobsim").is_none());
        assert_eq!(sw.current_iteration(), None);
    }

    #[test]
    fn open_operation_has_no_duration() {
        let mut sw = IterationStopwatch::new();
        sw.begin_iteration(3);
        sw.begin_operation("scoring");
        assert_eq!(sw.current_iteration(), Some(3));
        assert!(sw.duration(3, "scoring").is_none());
    }

    #[test]
    fn rebegin_overwrites_start() {
        let mut sw = IterationStopwatch::new();
        sw.begin_iteration(0);
        sw.begin_operation("mobsim");
        let first = sw.timings(0).unwrap().get("mobsim").unwrap().started_at;
        std::thread::sleep(Duration::from_millis(5));
        sw.begin_operation("mobsim");
        let second = sw.timings(0).unwrap().get("mobsim").unwrap().started_at;
        assert!(second > first);
        assert_eq!(sw.operation_names(), ["iteration", "mobsim"]);
    }

    #[test]
    fn operations_outside_iteration_are_ignored() {
        let mut sw = IterationStopwatch::new();
        sw.begin_operation("orphan");
        sw.end_operation("orphan");
        assert!(sw.operation_names().is_empty());
        assert!(sw.render_text().unwrap().starts_with("Iteration\n"));
    }

    #[test]
    fn text_report_has_one_row_per_iteration() {
        let sw = timed_iterations(3);
        let text = sw.render_text().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);

        let header: Vec<&str> = lines.first().unwrap().split('\t').collect();
        assert_eq!(
            header,
            [
                "Iteration",
                "BEGIN iteration",
                "END iteration",
                "BEGIN replanning",
                "END replanning",
                "BEGIN mobsim",
                "END mobsim",
                "iteration",
                "replanning",
                "mobsim",
            ]
        );
        for (idx, line) in lines.iter().skip(1).enumerate() {
            let cells: Vec<&str> = line.split('\t').collect();
            assert_eq!(cells.len(), header.len());
            assert_eq!(cells.first().copied(), Some(idx.to_string().as_str()));
            assert!(cells.iter().all(|c| !c.is_empty()));
        }
    }

    #[test]
    fn missing_operations_leave_empty_cells() {
        let mut sw = timed_iterations(1);
        sw.begin_iteration(1);
        sw.begin_operation("mobsim");
        let text = sw.render_text().unwrap();
        let last = text.lines().last().unwrap();
        let cells: Vec<&str> = last.split('\t').collect();
        assert_eq!(cells.first().copied(), Some("1"));
        // replanning never ran in iteration 1
        assert_eq!(cells.get(3).copied(), Some(""));
        assert_eq!(cells.get(4).copied(), Some(""));
    }

    #[test]
    fn svg_contains_bars_and_legend() {
        let sw = timed_iterations(2);
        let svg = sw.render_svg().unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.trim_end().ends_with("</svg>"));
        assert!(svg.contains(">replanning</text>"));
        assert!(svg.contains(">mobsim</text>"));
        assert_eq!(svg.matches("mobsim [").count(), 2);
    }

    #[test]
    fn writes_report_files() {
        let dir = std::env::temp_dir().join(format!(
            "cyclesim_stopwatch_{}_{:?}",
            std::process::id(),
            std::thread::current().id(),
        ));
        std::fs::create_dir_all(&dir).ok();
        let sw = timed_iterations(2);

        sw.write_text_file(&dir.join("stopwatch.txt")).unwrap();
        sw.write_graph_file(&dir.join("stopwatch.svg")).unwrap();

        let text = std::fs::read_to_string(dir.join("stopwatch.txt")).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(dir.join("stopwatch.svg").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn write_to_missing_directory_fails() {
        let sw = timed_iterations(1);
        let path = std::env::temp_dir()
            .join("cyclesim_definitely_missing_dir")
            .join("nested")
            .join("stopwatch.txt");
        let err = sw.write_text_file(&path).unwrap_err();
        assert!(matches!(err, StopwatchError::Io { .. }));
    }
}
