//! Command Line Interface helpers for skyreduce

use std::{
    ffi::OsString,
    fmt::{Debug, Display},
    path::PathBuf,
};

use clap::{
    arg, command, ArgMatches, Command,
    ErrorKind::{DisplayHelp, DisplayVersion},
    ValueHint::FilePath,
};
use log::{debug, info, trace};
use prettytable::{format as prettyformat, row, table};

use crate::{
    context::Context,
    error::{CLIError::InvalidCommandLineArgument, PipelineError},
    io::{read_pointing_text, write_pointing_text},
    logging::init_logging,
    raster::{synthetic::RasterPatternBuilder, GapList, GapTable, RasterScanHeuristic},
};

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// Write how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match GIT_HEAD_REF {
        Some(hr) => {
            let dirty = GIT_DIRTY.unwrap_or(false);
            writeln!(
                f,
                "Compiled on git commit hash: {}{}",
                GIT_COMMIT_HASH.unwrap_or("<unknown>"),
                if dirty { " (dirty)" } else { "" }
            )?;
            writeln!(f, "            git head ref: {}", hr)?;
        }
        None => writeln!(f, "Compiled on git commit hash: <no git info>")?,
    }
    writeln!(f, "            {}", BUILT_TIME_UTC)?;
    writeln!(f, "         with compiler {}", RUSTC_VERSION)?;
    Ok(())
}

struct BuildInfo;

impl Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} version {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )?;
        fmt_build_info(f)
    }
}

fn get_matches<I, T>(args: I) -> Result<ArgMatches, PipelineError>
where
    I: IntoIterator<Item = T> + Debug,
    T: Into<OsString> + Clone,
{
    let mut app = command!()
        .arg_required_else_help(true)
        .subcommand_required(true)
        .next_line_help(false)
        .about("Single-dish pipeline tools: raster scan detection and saved pipeline state.")
        .arg(arg!(-v --verbose "Log more, twice for everything").multiple_occurrences(true))
        .subcommand(
            Command::new("raster")
                .about("Split a pointing track into raster rows and maps")
                .args(&[
                    arg!(<PATH> "Two column (ra dec, degrees) pointing file").value_hint(FilePath),
                    arg!(--label <LABEL> "Name of the track in messages").required(false),
                    arg!(--rows "Also print every row"),
                ]),
        )
        .subcommand(
            Command::new("simulate")
                .about("Write a synthetic raster pointing file")
                .args(&[
                    arg!(<PATH> "Where to write the pointings").value_hint(FilePath),
                    arg!(--"rows-per-map" <COUNT> "Rows in each raster map")
                        .help_heading("PATTERN")
                        .required(false)
                        .default_value("16"),
                    arg!(--"points-per-row" <COUNT> "Pointings in each row")
                        .help_heading("PATTERN")
                        .required(false)
                        .default_value("10"),
                    arg!(--maps <COUNT> "Number of raster maps")
                        .help_heading("PATTERN")
                        .required(false)
                        .default_value("2"),
                    arg!(--"point-interval" <DEG> "Distance between pointings of a row")
                        .help_heading("PATTERN")
                        .required(false)
                        .default_value("0.1"),
                    arg!(--"row-interval" <DEG> "Distance between rows")
                        .help_heading("PATTERN")
                        .required(false)
                        .default_value("1.0"),
                    arg!(--angle <DEG> "Scan direction, counter-clockwise from the ra axis")
                        .help_heading("PATTERN")
                        .required(false)
                        .allow_hyphen_values(true)
                        .default_value("0.0"),
                    arg!(--"round-trip-rows" "Scan every other row backwards")
                        .help_heading("PATTERN"),
                    arg!(--"round-trip-maps" "Scan the rows of every other map in reverse")
                        .help_heading("PATTERN"),
                ]),
        )
        .subcommand(
            Command::new("summary")
                .about("Print the stages of a saved pipeline context")
                .arg(arg!(<CONTEXT> "Context file written by a pipeline run").value_hint(FilePath)),
        );
    let matches = app.try_get_matches_from_mut(args)?;
    Ok(matches)
}

fn map_table(gaptable: &GapTable) -> prettytable::Table {
    let mut map_table = table!(["map", "rows", "first", "last", "pointings"]);
    map_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    for (map_idx, pointings) in gaptable.maps.iter().enumerate() {
        let (first, last) = match (pointings.first(), pointings.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => continue,
        };
        let num_rows = gaptable
            .rows
            .iter()
            .filter(|row| row.first().map_or(false, |&start| (first..=last).contains(&start)))
            .count();
        map_table.add_row(row![r => map_idx, num_rows, first, last, pointings.len()]);
    }
    map_table
}

fn row_table(gaptable: &GapTable) -> prettytable::Table {
    let mut row_table = table!(["row", "first", "last", "pointings"]);
    row_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    for (row_idx, pointings) in gaptable.rows.iter().enumerate() {
        row_table.add_row(row![r =>
            row_idx,
            pointings.first().map_or_else(String::new, ToString::to_string),
            pointings.last().map_or_else(String::new, ToString::to_string),
            pointings.len()
        ]);
    }
    row_table
}

fn classify(matches: &ArgMatches) -> Result<(), PipelineError> {
    let path = matches.value_of_t::<PathBuf>("PATH")?;
    let label = matches
        .value_of("label")
        .map_or_else(|| path.display().to_string(), String::from);
    let (ra, dec) = read_pointing_text(&path)?;
    let (gaptable, GapList { small, large }) =
        RasterScanHeuristic.calculate(ra.view(), dec.view(), Some(&label))?;

    println!(
        "{}: {} pointings in {} rows and {} raster maps",
        label,
        ra.len(),
        small.len() + 1,
        large.len() + 1
    );
    println!("{}", map_table(&gaptable));
    if matches.is_present("rows") {
        println!("{}", row_table(&gaptable));
    }
    Ok(())
}

fn positive_count(matches: &ArgMatches, name: &str) -> Result<usize, PipelineError> {
    let count = matches.value_of_t::<usize>(name)?;
    if count == 0 {
        return Err(InvalidCommandLineArgument {
            option: format!("--{name} <COUNT>"),
            expected: "a positive, non-zero integer".into(),
            received: count.to_string(),
        }
        .into());
    }
    Ok(count)
}

fn simulate(matches: &ArgMatches) -> Result<(), PipelineError> {
    let path = matches.value_of_t::<PathBuf>("PATH")?;
    let pattern = RasterPatternBuilder::default()
        .num_rows_per_map(positive_count(matches, "rows-per-map")?)
        .num_points_per_row(positive_count(matches, "points-per-row")?)
        .num_maps(positive_count(matches, "maps")?)
        .point_interval(matches.value_of_t::<f64>("point-interval")?)
        .row_interval(matches.value_of_t::<f64>("row-interval")?)
        .angle_deg(matches.value_of_t::<f64>("angle")?)
        .oneway_row(!matches.is_present("round-trip-rows"))
        .oneway_map(!matches.is_present("round-trip-maps"))
        .build()
        .map_err(|e| PipelineError::Config(e.to_string()))?;
    debug!("{:?}", pattern);
    let (ra, dec) = pattern.generate();
    write_pointing_text(&path, ra.view(), dec.view())?;
    info!("wrote {} pointings to {}", ra.len(), path.display());
    Ok(())
}

fn summary(matches: &ArgMatches) -> Result<(), PipelineError> {
    let path = matches.value_of_t::<PathBuf>("CONTEXT")?;
    let context = Context::load(&path)?;

    let mut stage_table = table!(["stage", "task", "datasets", "outcome", "QA", "accepted"]);
    stage_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    for proxy in &context.results {
        stage_table.add_row(row![
            proxy.stage_number,
            proxy.task_name,
            proxy.vis.join(", "),
            if proxy.failed { "FAILED" } else { "ok" },
            proxy.qa_score.map_or_else(|| "-".to_string(), |score| format!("{score:.2}")),
            proxy.accepted_at.format("%Y-%m-%d %H:%M:%S")
        ]);
    }
    println!(
        "context {} ({}): {} stages executed, {} accepted",
        context.name,
        context.output_dir.display(),
        context.task_counter,
        context.results.len()
    );
    println!("{}", stage_table);

    for (vis, raster_result) in &context.raster_scan {
        let failed = raster_result.antennas_rasterscan_failed();
        if !failed.is_empty() {
            println!(
                "{}: raster scan heuristics failed for {}",
                vis,
                failed.join(", ")
            );
        }
    }
    Ok(())
}

fn run<I, T>(args: I) -> Result<(), PipelineError>
where
    I: IntoIterator<Item = T> + Debug,
    T: Into<OsString> + Clone,
{
    let matches = get_matches(args)?;
    let default_filter = match matches.occurrences_of("verbose") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    if init_logging(default_filter).is_err() {
        trace!("logger already installed");
    }
    for line in BuildInfo.to_string().lines() {
        debug!("{}", line);
    }

    match matches.subcommand() {
        Some(("raster", sub_matches)) => classify(sub_matches),
        Some(("simulate", sub_matches)) => simulate(sub_matches),
        Some(("summary", sub_matches)) => summary(sub_matches),
        _ => Ok(()),
    }
}

/// Run the command line with `args`, returning the process exit code.
pub fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T> + Debug,
    T: Into<OsString> + Clone,
{
    match run(args) {
        Ok(()) => 0,
        Err(PipelineError::ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                DisplayHelp | DisplayVersion => 0,
                _ => 1,
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}
