use log::trace;
use skyreduce::cli::main_with_args;
use std::env;

fn main() {
    trace!("start main");
    let retcode = main_with_args(env::args());
    trace!("end main");
    std::process::exit(retcode);
}

#[cfg(test)]
mod tests {
    use skyreduce::cli::main_with_args;
    use tempfile::tempdir;

    #[test]
    fn main_with_version_succeeds() {
        assert_eq!(main_with_args(["skyreduce", "--version"]), 0);
    }

    #[test]
    fn main_with_help_succeeds() {
        assert_eq!(main_with_args(["skyreduce", "--help"]), 0);
    }

    #[test]
    fn main_with_bad_arg_returns_1() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("pointings.txt");
        #[rustfmt::skip]
        assert_ne!(
            main_with_args([
                "skyreduce", "simulate", path.to_str().unwrap(),
                "--points-per-row", "0",
            ]),
            0
        );
        assert!(!path.exists());
    }

    #[test]
    fn main_with_missing_file_returns_1() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("missing.txt");
        assert_eq!(main_with_args(["skyreduce", "raster", path.to_str().unwrap()]), 1);
    }
}
