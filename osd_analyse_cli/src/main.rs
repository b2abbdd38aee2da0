use std::env;
use std::io;
use std::panic;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use clap::{ArgAction, Parser, ValueHint};
use osd_analyse::{
    load_datafile, parse_window_bound, EventPoint, LogTable, Severity, WindowedTable,
    ROI_RATIO_THRESHOLD,
};
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Fixed output filename, written to the working directory when saving.
const OUTPUT_FILE: &str = "analyse_datafile.png";
const PLOT_SIZE: (u32, u32) = (1280, 960);

const ALARM_COLOR: RGBColor = RGBColor(255, 140, 0);
const WARNING_COLOR: RGBColor = RGBColor(34, 139, 34);

#[derive(Parser, Debug)]
#[command(author, version, about = "OpenSeizureDetector data file analyser", long_about = None)]
struct Cli {
    /// Data file to analyse
    #[arg(value_hint = ValueHint::FilePath)]
    in_file: PathBuf,

    /// Save the graphs to a file rather than displaying on screen
    #[arg(long = "saveFile", action = ArgAction::SetTrue)]
    save_file: bool,

    /// Start date (dd-mm-yyyy hh:mm) of period for detailed analysis
    #[arg(long = "startDate")]
    start_date: Option<String>,

    /// End date (dd-mm-yyyy hh:mm) of period for detailed analysis
    #[arg(long = "endDate")]
    end_date: Option<String>,

    /// Plot title
    #[arg(long)]
    title: Option<String>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let t_load = Instant::now();
    let table = load_datafile(&cli.in_file)
        .with_context(|| format!("failed to load {}", cli.in_file.display()))?;
    info!(
        "Loaded {} records from {}",
        table.len(),
        cli.in_file.display()
    );
    if cli.verbose {
        debug!(
            "Load stage: {:.1} ms",
            t_load.elapsed().as_secs_f64() * 1000.0
        );
    }

    let t_slice = Instant::now();
    let window = slice_window(&table, cli.start_date.as_deref(), cli.end_date.as_deref())?;
    info!("Windowed table: {} records", window.len());
    if cli.verbose {
        debug!(
            "Slice stage: {:.1} ms",
            t_slice.elapsed().as_secs_f64() * 1000.0
        );
    }

    let alarms = window.event_points(Severity::Alarm);
    let warnings = window.event_points(Severity::Warning);

    let opts = PlotOptions {
        title: cli.title.unwrap_or_default(),
    };
    let out_path = if cli.save_file {
        PathBuf::from(OUTPUT_FILE)
    } else {
        env::temp_dir().join(OUTPUT_FILE)
    };

    let t_plot = Instant::now();
    render_chart_guard(&window, &alarms, &warnings, &out_path, &opts)
        .map_err(|err| anyhow!("failed to render chart: {}", err))?;
    if cli.verbose {
        debug!(
            "Plot stage: {:.1} ms",
            t_plot.elapsed().as_secs_f64() * 1000.0
        );
    }

    if cli.save_file {
        info!("Wrote plot: {}", out_path.display());
    } else {
        display_plot(&out_path)?;
    }

    Ok(())
}

fn slice_window(
    table: &LogTable,
    start_date: Option<&str>,
    end_date: Option<&str>,
) -> Result<WindowedTable> {
    let (start, end) = match (start_date, end_date) {
        (Some(start), Some(end)) => (
            parse_window_bound(start).with_context(|| format!("invalid --startDate '{start}'"))?,
            parse_window_bound(end).with_context(|| format!("invalid --endDate '{end}'"))?,
        ),
        _ => {
            warn!("--startDate/--endDate not supplied; windowed table will be empty");
            return Ok(WindowedTable::default());
        }
    };
    debug!("time slice: {} -> {}", start, end);
    Ok(table.time_slice(start, end))
}

struct PlotOptions {
    title: String,
}

/// Plotting backends can panic on broken font setups; keep that from taking
/// the whole run down without a diagnostic.
fn render_chart_guard(
    window: &WindowedTable,
    alarms: &[EventPoint],
    warnings: &[EventPoint],
    path: &Path,
    opts: &PlotOptions,
) -> Result<(), String> {
    let render = || -> Result<(), String> {
        render_panels(window, alarms, warnings, path, opts)
            .map_err(|e| format!("plotting error: {}", e))
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

fn render_panels(
    window: &WindowedTable,
    alarms: &[EventPoint],
    warnings: &[EventPoint],
    path: &Path,
    opts: &PlotOptions,
) -> Result<()> {
    let root = BitMapBackend::new(path, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let root = if opts.title.is_empty() {
        root
    } else {
        root.titled(
            &opts.title,
            FontDesc::new(FontFamily::SansSerif, 22.0, FontStyle::Normal),
        )?
    };

    let (x0, x1) = time_range(window);
    let panels = root.split_evenly((3, 1));
    draw_acc_panel(&panels[0], window, x0, x1)?;
    draw_power_panel(&panels[1], window, x0, x1)?;
    draw_ratio_panel(&panels[2], window, alarms, warnings, x0, x1)?;

    root.present()?;
    Ok(())
}

/// Shared x-axis range, widened to stay non-degenerate for empty or
/// single-row windows.
fn time_range(window: &WindowedTable) -> (NaiveDateTime, NaiveDateTime) {
    let first = window.records.first().map(|r| r.datetime);
    let last = window.records.last().map(|r| r.datetime);
    match (first, last) {
        (Some(first), Some(last)) if first < last => (first, last),
        (Some(first), Some(_)) => (first, first + Duration::minutes(1)),
        _ => {
            let origin = NaiveDate::from_ymd_opt(1970, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap();
            (origin, origin + Duration::hours(1))
        }
    }
}

/// Min/max of the finite values with a little padding; `roi_ratio` can be
/// non-finite when `spec_pow` is zero, and those rows must not poison the
/// axis range.
fn value_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values.filter(|v| v.is_finite()) {
        min = min.min(v);
        max = max.max(v);
    }
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 1.0);
    }
    if (max - min).abs() < f64::EPSILON {
        return (min - 0.5, max + 0.5);
    }
    let pad = (max - min) * 0.05;
    (min - pad, max + pad)
}

fn axis_font() -> FontDesc<'static> {
    FontDesc::new(FontFamily::SansSerif, 14.0, FontStyle::Normal)
}

fn draw_acc_panel<DB>(
    area: &DrawingArea<DB, Shift>,
    window: &WindowedTable,
    x0: NaiveDateTime,
    x1: NaiveDateTime,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let (y0, y1) = value_range(window.records.iter().map(|r| r.acc_mean));
    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .build_cartesian_2d(RangedDateTime::from(x0..x1), y0..y1)?;

    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .bold_line_style(&TRANSPARENT)
        .x_labels(0)
        .y_label_formatter(&|v| format!("{:.1}", v))
        .label_style(axis_font().color(&BLACK.mix(0.85)))
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            window.records.iter().map(|r| (r.datetime, r.acc_mean)),
            &BLUE,
        ))?
        .label("AccMean")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], &BLUE));

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .position(SeriesLabelPosition::UpperLeft)
        .draw()?;

    Ok(())
}

fn draw_power_panel<DB>(
    area: &DrawingArea<DB, Shift>,
    window: &WindowedTable,
    x0: NaiveDateTime,
    x1: NaiveDateTime,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let (y0, y1) = value_range(
        window
            .records
            .iter()
            .flat_map(|r| [r.roi_pow, r.spec_pow]),
    );
    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .build_cartesian_2d(RangedDateTime::from(x0..x1), y0..y1)?;

    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .bold_line_style(&TRANSPARENT)
        .x_labels(0)
        .y_label_formatter(&|v| format!("{:.0}", v))
        .label_style(axis_font().color(&BLACK.mix(0.85)))
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            window.records.iter().map(|r| (r.datetime, r.roi_pow)),
            &BLUE,
        ))?
        .label("roiPow")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], &BLUE));

    chart
        .draw_series(LineSeries::new(
            window.records.iter().map(|r| (r.datetime, r.spec_pow)),
            &RED,
        ))?
        .label("specPow")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], &RED));

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .position(SeriesLabelPosition::UpperLeft)
        .draw()?;

    Ok(())
}

fn draw_ratio_panel<DB>(
    area: &DrawingArea<DB, Shift>,
    window: &WindowedTable,
    alarms: &[EventPoint],
    warnings: &[EventPoint],
    x0: NaiveDateTime,
    x1: NaiveDateTime,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    // Marker values sit on roi_ratio, which can exceed the masked series;
    // the axis has to cover both plus the reference line.
    let (y0, y1) = value_range(
        window
            .records
            .iter()
            .map(|r| r.roi_ratio2)
            .chain(std::iter::once(ROI_RATIO_THRESHOLD))
            .chain(alarms.iter().map(|p| p.roi_ratio))
            .chain(warnings.iter().map(|p| p.roi_ratio)),
    );
    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(RangedDateTime::from(x0..x1), y0..y1)?;

    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .bold_line_style(&TRANSPARENT)
        .x_label_formatter(&|dt: &NaiveDateTime| dt.format("%H:%M").to_string())
        .y_label_formatter(&|v| format!("{:.0}", v))
        .label_style(axis_font().color(&BLACK.mix(0.85)))
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            window.records.iter().map(|r| (r.datetime, r.roi_ratio2)),
            &BLUE,
        ))?
        .label("roiRatio2")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], &BLUE));

    chart
        .draw_series(LineSeries::new(
            [(x0, ROI_RATIO_THRESHOLD), (x1, ROI_RATIO_THRESHOLD)],
            &RED,
        ))?
        .label("thresh")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], &RED));

    if alarms.is_empty() {
        info!("No alarm points to plot");
    } else {
        chart
            .draw_series(
                alarms
                    .iter()
                    .map(|p| Circle::new((p.datetime, p.roi_ratio), 7, ALARM_COLOR.filled())),
            )?
            .label("alarm")
            .legend(|(x, y)| Circle::new((x + 10, y), 4, ALARM_COLOR.filled()));
    }

    if warnings.is_empty() {
        info!("No warning points to plot");
    } else {
        chart
            .draw_series(
                warnings
                    .iter()
                    .map(|p| Circle::new((p.datetime, p.roi_ratio), 3, WARNING_COLOR.filled())),
            )?
            .label("warning")
            .legend(|(x, y)| Circle::new((x + 10, y), 3, WARNING_COLOR.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .position(SeriesLabelPosition::UpperLeft)
        .draw()?;

    Ok(())
}

/// Hand the rendered chart to the platform image viewer. Save and display
/// are exclusive output modes.
fn display_plot(path: &Path) -> Result<()> {
    info!("Displaying plot: {}", path.display());
    let status = viewer_command(path)
        .status()
        .with_context(|| format!("failed to launch image viewer for {}", path.display()))?;
    if !status.success() {
        return Err(anyhow!("image viewer exited with {}", status));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn viewer_command(path: &Path) -> Command {
    let mut cmd = Command::new("open");
    cmd.arg(path);
    cmd
}

#[cfg(target_os = "windows")]
fn viewer_command(path: &Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", "start", ""]).arg(path);
    cmd
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn viewer_command(path: &Path) -> Command {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(path);
    cmd
}
