//! Persistence of pipeline state, stage results and pointing tracks.

pub mod error;
pub mod store;

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, trace};
use ndarray::{Array1, ArrayView1};
use serde::{de::DeserializeOwned, Serialize};
use serde_pickle::{DeOptions, SerOptions};

use crate::{constants::CONTEXT_FILE_EXTENSION, context::Context};

use self::error::IOError;

/// Pickle any serialisable value.
///
/// # Errors
///
/// Propagates serde-pickle errors.
pub fn to_pickle<T: Serialize>(value: &T) -> Result<Vec<u8>, IOError> {
    Ok(serde_pickle::to_vec(value, SerOptions::new())?)
}

/// Unpickle a value written by [`to_pickle`].
///
/// # Errors
///
/// Propagates serde-pickle errors.
pub fn from_pickle<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IOError> {
    Ok(serde_pickle::from_slice(bytes, DeOptions::new())?)
}

/// Where a context called `name` is saved below `output_dir`.
pub fn context_path(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join(format!("{name}.{CONTEXT_FILE_EXTENSION}"))
}

/// Pickle `context` to `path`.
///
/// # Errors
///
/// Fails if the file can't be created or written.
pub fn write_context(context: &Context, path: &Path) -> Result<(), IOError> {
    debug!("saving context {} to {}", context.name, path.display());
    let file = File::create(path).map_err(|e| IOError::filesystem(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_pickle::to_writer(&mut writer, context, SerOptions::new())?;
    writer.flush().map_err(|e| IOError::filesystem(path, e))?;
    Ok(())
}

/// Read a context saved by [`write_context`].
///
/// # Errors
///
/// Fails if the file can't be read or isn't a pickled context.
pub fn read_context(path: &Path) -> Result<Context, IOError> {
    debug!("loading context from {}", path.display());
    let file = File::open(path).map_err(|e| IOError::filesystem(path, e))?;
    Ok(serde_pickle::from_reader(BufReader::new(file), DeOptions::new())?)
}

/// Read a two column (`ra dec`, degrees) pointing file. Blank lines and
/// anything after a `#` are ignored.
///
/// # Errors
///
/// Fails if the file can't be read or a line doesn't hold two numbers.
pub fn read_pointing_text(path: &Path) -> Result<(Array1<f64>, Array1<f64>), IOError> {
    let file = File::open(path).map_err(|e| IOError::filesystem(path, e))?;
    let mut ra = vec![];
    let mut dec = vec![];
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| IOError::filesystem(path, e))?;
        let content = line.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            continue;
        }
        let parse_error = || IOError::PointingParse {
            path: path.display().to_string(),
            line_number: idx + 1,
            content: line.clone(),
        };
        let values = content
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| parse_error())?;
        match values.as_slice() {
            [pointing_ra, pointing_dec] => {
                ra.push(*pointing_ra);
                dec.push(*pointing_dec);
            }
            _ => return Err(parse_error()),
        }
    }
    trace!("read {} pointings from {}", ra.len(), path.display());
    Ok((Array1::from(ra), Array1::from(dec)))
}

/// Write a pointing file readable by [`read_pointing_text`].
///
/// # Errors
///
/// Fails if the file can't be written.
pub fn write_pointing_text(
    path: &Path,
    ra: ArrayView1<f64>,
    dec: ArrayView1<f64>,
) -> Result<(), IOError> {
    let file = File::create(path).map_err(|e| IOError::filesystem(path, e))?;
    let mut writer = BufWriter::new(file);
    let mut write = || -> std::io::Result<()> {
        writeln!(writer, "# ra dec [deg]")?;
        for (pointing_ra, pointing_dec) in ra.iter().zip(dec.iter()) {
            writeln!(writer, "{pointing_ra:.10} {pointing_dec:.10}")?;
        }
        writer.flush()
    };
    write().map_err(|e| IOError::filesystem(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_pointing_text_round_trip() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("pointings.txt");
        let ra = Array1::from(vec![150.0, 150.1, 150.2]);
        let dec = Array1::from(vec![-30.0, -30.0, -29.9]);
        write_pointing_text(&path, ra.view(), dec.view()).unwrap();
        let (ra_read, dec_read) = read_pointing_text(&path).unwrap();
        assert_abs_diff_eq!(ra_read, ra, epsilon = 1e-9);
        assert_abs_diff_eq!(dec_read, dec, epsilon = 1e-9);
    }

    #[test]
    fn test_read_pointing_text_reports_bad_line() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("pointings.txt");
        fs::write(&path, "# header\n1.0 2.0\n\n3.0 # missing dec\n").unwrap();
        match read_pointing_text(&path) {
            Err(IOError::PointingParse { line_number, .. }) => assert_eq!(line_number, 4),
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_context_file_round_trip() {
        let tmp_dir = tempdir().unwrap();
        let mut context = Context::new("session", tmp_dir.path());
        context.task_counter = 4;
        context.register_caltable("a.ms", "a.ms.tsys");
        let path = context_path(tmp_dir.path(), &context.name);
        write_context(&context, &path).unwrap();
        assert!(path.ends_with("session.context"));

        let loaded = read_context(&path).unwrap();
        assert_eq!(loaded.name, "session");
        assert_eq!(loaded.task_counter, 4);
        assert_eq!(loaded.caltables("a.ms").to_vec(), vec!["a.ms.tsys".to_string()]);
    }
}
