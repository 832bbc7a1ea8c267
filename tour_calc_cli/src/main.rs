use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use tour_calc::{
    adjust_altitude, altitude_up_down, list_break_time_methods, parse_records, AdjustPolicy,
    AltitudeAdjustment, BreakTimeConfig, BreakTimeMethod, BreakTimeResult, ConfigProvider,
    JsonFileProvider, StaticProvider, TourError, TourSeries,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tour break time and altitude tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect breaks in one or more FIT/GPX tours
    Breaks(BreaksArgs),
    /// Adjust the altitude series of a FIT/GPX tour
    Adjust(AdjustArgs),
    /// List available break time methods as JSON
    Methods,
}

#[derive(Parser, Debug)]
struct BreaksArgs {
    /// FIT/GPX files to ingest
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "breaks.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Break time settings JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Break time method
    #[arg(long, value_enum)]
    method: Option<MethodOpt>,

    /// Shortest break time (seconds)
    #[arg(long)]
    shortest_break_time: Option<i32>,

    /// Maximum distance covered during a break (meters)
    #[arg(long)]
    max_distance: Option<f64>,

    /// Slices longer than this are breaks (minutes, 0 disables)
    #[arg(long)]
    slice_diff: Option<i32>,

    /// Minimum slice speed (km/h)
    #[arg(long)]
    min_slice_speed: Option<f64>,

    /// Minimum average speed (km/h)
    #[arg(long)]
    min_avg_speed: Option<f64>,

    /// Minimum average speed for the avg-slice-speed method (km/h)
    #[arg(long)]
    as_min_avg_speed: Option<f64>,

    /// Minimum slice speed for the avg-slice-speed method (km/h)
    #[arg(long)]
    as_min_slice_speed: Option<f64>,

    /// Minimum averaging window for the avg-slice-speed method (seconds)
    #[arg(long)]
    as_min_slice_time: Option<i32>,

    /// Device recording interval in seconds; switches to the fixed-interval break rule
    #[arg(long)]
    fixed_interval: Option<i32>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct AdjustArgs {
    /// FIT/GPX file to ingest
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Adjustment policy
    #[arg(long, value_enum, default_value_t = PolicyOpt::Even)]
    policy: PolicyOpt,

    /// Target altitude (meters, 0..=6000)
    #[arg(long)]
    target: i32,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "altitude.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Ignore altitude changes below this threshold when summing up/down (meters)
    #[arg(long, default_value_t = 5.0)]
    up_down_eps: f64,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MethodOpt {
    SliceSpeed,
    AvgSpeed,
    TimeDistance,
    AvgSliceSpeed,
}

impl From<MethodOpt> for BreakTimeMethod {
    fn from(value: MethodOpt) -> Self {
        match value {
            MethodOpt::SliceSpeed => BreakTimeMethod::BySliceSpeed,
            MethodOpt::AvgSpeed => BreakTimeMethod::ByAvgSpeed,
            MethodOpt::TimeDistance => BreakTimeMethod::ByTimeDistance,
            MethodOpt::AvgSliceSpeed => BreakTimeMethod::ByAvgSliceSpeed,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PolicyOpt {
    Even,
    End,
    MaxHeight,
}

impl From<PolicyOpt> for AdjustPolicy {
    fn from(value: PolicyOpt) -> Self {
        match value {
            PolicyOpt::Even => AdjustPolicy::Even,
            PolicyOpt::End => AdjustPolicy::EndAnchored,
            PolicyOpt::MaxHeight => AdjustPolicy::MaxHeightAnchored,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Breaks(args) => args.verbose,
        Command::Adjust(args) => args.verbose,
        Command::Methods => false,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Breaks(args) => handle_breaks(args),
        Command::Adjust(args) => handle_adjust(args),
        Command::Methods => handle_methods(),
    }
}

fn handle_breaks(args: BreaksArgs) -> Result<()> {
    let base = match args.config.as_ref() {
        Some(path) => load_config(JsonFileProvider::new(path))
            .with_context(|| format!("failed to load settings {}", path.display()))?,
        None => load_config(StaticProvider::default())?,
    };
    let config = apply_overrides(base, &args);
    config.validate()?;
    info!("Break time method: {}", config.method.name());

    let tours: Vec<(PathBuf, TourSeries)> = args
        .inputs
        .par_iter()
        .map(|path| -> Result<(PathBuf, TourSeries)> {
            let series = read_tour(path)?;
            Ok((path.clone(), series))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut writer = open_csv(&args.output)?;
    writer.write_record(BREAK_CSV_HEADER)?;

    for (path, mut series) in tours {
        if let Some(interval) = args.fixed_interval {
            series = series
                .with_device_time_interval(interval)
                .with_context(|| format!("invalid --fixed-interval for {}", path.display()))?;
            debug!("{}: fixed {} s interval", path.display(), interval);
        }
        let result = series
            .breaks(&config)
            .with_context(|| format!("break detection failed for {}", path.display()))?;
        let recording = series.recording_time();
        info!(
            "{}: {} samples, break {}, moving {} ({} break samples)",
            path.display(),
            series.len(),
            format_hms(result.total_break_seconds),
            format_hms(recording - result.total_break_seconds),
            result.break_samples()
        );

        write_break_rows(&mut writer, &path.display().to_string(), &series, &result)?;
    }
    writer.flush()?;
    if args.output != Path::new("-") {
        info!("Wrote break CSV: {}", args.output.display());
    }
    Ok(())
}

const BREAK_CSV_HEADER: [&str; 6] = [
    "file",
    "index",
    "time_s",
    "distance_m",
    "speed_kmh",
    "is_break",
];

fn write_break_rows<W: Write>(
    writer: &mut csv::Writer<W>,
    name: &str,
    series: &TourSeries,
    result: &BreakTimeResult,
) -> Result<()> {
    for (i, is_break) in result.break_mask.iter().enumerate() {
        writer.write_record([
            name.to_string(),
            i.to_string(),
            series.time[i].to_string(),
            format!("{:.1}", series.distance[i]),
            format!("{:.1}", series.speed[i] / 10.0),
            u8::from(*is_break).to_string(),
        ])?;
    }
    Ok(())
}

/// One-shot load for the run; the settings are not watched for changes.
fn load_config<P: ConfigProvider>(provider: P) -> Result<BreakTimeConfig> {
    let config = provider.load()?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(mut config: BreakTimeConfig, args: &BreaksArgs) -> BreakTimeConfig {
    if let Some(method) = args.method {
        config.method = method.into();
    }
    if let Some(value) = args.shortest_break_time {
        config.shortest_break_time_s = value;
    }
    if let Some(value) = args.max_distance {
        config.max_distance_m = value;
    }
    if let Some(value) = args.slice_diff {
        config.slice_diff_min = value;
    }
    if let Some(value) = args.min_slice_speed {
        config.min_slice_speed_kmh = value;
    }
    if let Some(value) = args.min_avg_speed {
        config.min_avg_speed_kmh = value;
    }
    if let Some(value) = args.as_min_avg_speed {
        config.as_min_avg_speed_kmh = value;
    }
    if let Some(value) = args.as_min_slice_speed {
        config.as_min_slice_speed_kmh = value;
    }
    if let Some(value) = args.as_min_slice_time {
        config.as_min_slice_time_s = value;
    }
    config
}

fn handle_adjust(args: AdjustArgs) -> Result<()> {
    let series = read_tour(&args.input)?;
    let request = AltitudeAdjustment::new(args.policy.into(), args.target);
    let adjusted = match adjust_altitude(&series.altitude, &series.distance, &request) {
        Ok(values) => values,
        Err(err @ TourError::DegenerateInput(_)) => {
            warn!("Altitude left unchanged: {}", err);
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let before = altitude_up_down(&series.altitude, args.up_down_eps);
    let after = altitude_up_down(&adjusted, args.up_down_eps);
    info!(
        "Altitude up/down: {:.0}/{:.0} m -> {:.0}/{:.0} m",
        before.up_m, before.down_m, after.up_m, after.down_m
    );

    let mut writer = open_csv(&args.output)?;
    writer.write_record(["index", "distance_m", "altitude_m", "adjusted_m"])?;
    for (i, (orig, adj)) in series.altitude.iter().zip(&adjusted).enumerate() {
        writer.write_record([
            i.to_string(),
            format!("{:.1}", series.distance[i]),
            format!("{:.1}", orig),
            format!("{:.1}", adj),
        ])?;
    }
    writer.flush()?;
    if args.output != Path::new("-") {
        info!("Wrote altitude CSV: {}", args.output.display());
    }
    Ok(())
}

fn handle_methods() -> Result<()> {
    let text = serde_json::to_string_pretty(&list_break_time_methods())?;
    println!("{text}");
    Ok(())
}

fn read_tour(path: &Path) -> Result<TourSeries> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let hint = path
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| anyhow!("{} has no file extension", path.display()))?;
    let points =
        parse_records(&data, hint).with_context(|| format!("failed to parse {}", path.display()))?;
    TourSeries::from_points(&points)
        .with_context(|| format!("no usable samples in {}", path.display()))
}

fn open_csv(path: &Path) -> Result<csv::Writer<Box<dyn Write>>> {
    let sink: Box<dyn Write> = if path == Path::new("-") {
        Box::new(io::stdout().lock())
    } else {
        Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )
    };
    Ok(csv::Writer::from_writer(sink))
}

fn format_hms(seconds: i32) -> String {
    let sign = if seconds < 0 { "-" } else { "" };
    let s = seconds.unsigned_abs();
    format!("{}{}:{:02}:{:02}", sign, s / 3600, (s % 3600) / 60, s % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tour_calc::TrackPoint;

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(0), "0:00:00");
        assert_eq!(format_hms(3725), "1:02:05");
        assert_eq!(format_hms(-61), "-0:01:01");
    }

    #[test]
    fn test_overrides_win_over_settings() {
        let cli = Cli::parse_from([
            "tour-calc",
            "breaks",
            "ride.gpx",
            "--method",
            "time-distance",
            "--slice-diff",
            "0",
            "--min-slice-speed",
            "2.5",
        ]);
        let Command::Breaks(args) = cli.command else {
            panic!("expected breaks command");
        };
        let config = apply_overrides(BreakTimeConfig::default(), &args);
        assert_eq!(config.method, BreakTimeMethod::ByTimeDistance);
        assert_eq!(config.slice_diff_min, 0);
        assert!((config.min_slice_speed_kmh - 2.5).abs() < 1e-9);
        assert!((config.as_min_slice_speed_kmh - 1.0).abs() < 1e-9);
        assert_eq!(config.shortest_break_time_s, 20);
        assert_eq!(args.fixed_interval, None);
    }

    #[test]
    fn test_avg_slice_speed_flags() {
        let cli = Cli::parse_from([
            "tour-calc",
            "breaks",
            "ride.fit",
            "--min-avg-speed",
            "3.0",
            "--as-min-avg-speed",
            "4.0",
            "--as-min-slice-speed",
            "0.5",
            "--as-min-slice-time",
            "6",
            "--fixed-interval",
            "5",
        ]);
        let Command::Breaks(args) = cli.command else {
            panic!("expected breaks command");
        };
        let config = apply_overrides(BreakTimeConfig::default(), &args);
        assert!((config.min_avg_speed_kmh - 3.0).abs() < 1e-9);
        assert!((config.as_min_avg_speed_kmh - 4.0).abs() < 1e-9);
        assert!((config.as_min_slice_speed_kmh - 0.5).abs() < 1e-9);
        assert_eq!(config.as_min_slice_time_s, 6);
        assert!((config.min_slice_speed_kmh - 1.0).abs() < 1e-9);
        assert_eq!(args.fixed_interval, Some(5));
    }

    #[test]
    fn test_load_config_rejects_invalid_settings() {
        let bad = BreakTimeConfig {
            max_distance_m: -1.0,
            ..BreakTimeConfig::default()
        };
        assert!(load_config(StaticProvider(bad)).is_err());
        let config = load_config(StaticProvider::default()).unwrap();
        assert_eq!(config, BreakTimeConfig::default());
    }

    #[test]
    fn test_break_csv_rows() {
        let points: Vec<TrackPoint> = [(0.0, 0.0), (10.0, 5.0), (20.0, 6.0), (30.0, 20.0)]
            .into_iter()
            .map(|(t, d)| TrackPoint {
                t,
                alt: Some(100.0),
                dist: Some(d),
                speed: None,
            })
            .collect();
        let series = TourSeries::from_points(&points).unwrap();
        let config = BreakTimeConfig {
            method: BreakTimeMethod::BySliceSpeed,
            min_slice_speed_kmh: 2.0,
            ..BreakTimeConfig::default()
        };
        let result = series.breaks(&config).unwrap();

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(BREAK_CSV_HEADER).unwrap();
        write_break_rows(&mut writer, "ride.gpx", &series, &result).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "file,index,time_s,distance_m,speed_kmh,is_break");
        assert_eq!(lines.len(), 5);
        assert!(lines[2].starts_with("ride.gpx,1,10,5.0,"));
        assert!(lines[2].ends_with(",1"));
        assert!(lines[4].ends_with(",0"));
    }

    #[test]
    fn test_adjust_args() {
        let cli = Cli::parse_from([
            "tour-calc", "adjust", "ride.fit", "--policy", "max-height", "--target", "1200",
        ]);
        let Command::Adjust(args) = cli.command else {
            panic!("expected adjust command");
        };
        assert_eq!(AdjustPolicy::from(args.policy), AdjustPolicy::MaxHeightAnchored);
        assert_eq!(args.target, 1200);
    }
}
