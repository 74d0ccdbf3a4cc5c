use fern::{Dispatch, InitError};
use log::{Level, LevelFilter, Record};
use std::{fs, io, path::Path};
use yansi::Paint;

/// Logs to `log_file` when given, otherwise to stderr.
///
/// With `backup`, an existing log is moved to `<log_file>.old` first. A log file that
/// can't be opened falls back to stdout.
pub fn setup_logging(
    filter: LevelFilter,
    log_file: Option<&Path>,
    backup: bool,
) -> Result<(), InitError> {
    let location = |record: &Record| {
        let mut target = record.target();
        if let Some(pos) = target.find(':') {
            target = &target[..pos];
        }

        match (record.file(), record.line()) {
            (Some(file), Some(line)) => format!(
                "{} {}{}{}",
                Paint::cyan(target).bold(),
                Paint::blue(file).bold(),
                Paint::new(":").bold(),
                Paint::magenta(line).bold()
            ),
            _ => String::new(),
        }
    };

    let format_level = |record: &Record| match record.level() {
        level @ Level::Trace => Paint::green(level).bold(),
        level @ Level::Warn => Paint::yellow(level).bold(),
        level @ Level::Error => Paint::red(level).bold(),
        level => Paint::new(level).bold(),
    };

    let dispatch = Dispatch::new()
        // Exclude logs for crates that we use
        .level(LevelFilter::Off)
        .level_for("pop_gpu_manager", filter)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{:5}] {}: {}",
                format_level(record),
                strip_src(&location(record)),
                message
            ));
        });

    let log_file = match log_file {
        Some(path) => path,
        None => return dispatch.chain(io::stderr()).apply().map_err(InitError::from),
    };

    Paint::disable();

    if backup && log_file.exists() {
        let mut old = log_file.as_os_str().to_owned();
        old.push(".old");
        if let Err(why) = fs::rename(log_file, &old) {
            eprintln!("failed to back up {}: {}", log_file.display(), why);
        }
    }

    match fern::log_file(log_file) {
        Ok(file) => dispatch.chain(file).apply()?,
        Err(why) => {
            dispatch.chain(io::stdout()).apply()?;
            warn!("unable to open {}: {}. Logging to stdout", log_file.display(), why);
        }
    }

    Ok(())
}

fn strip_src(input: &str) -> &str { input.split("src/").nth(1).unwrap_or_default() }

#[cfg(test)]
mod tests {
    #[test]
    fn strip_src() {
        assert_eq!(
            super::strip_src("/build/pop-gpu-manager/src/pci/capability.rs:42"),
            "pci/capability.rs:42"
        )
    }
}
