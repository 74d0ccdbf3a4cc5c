use std::{fs, io, path::Path};

/// Kernel parameter which disables the manager for this boot.
pub const KERNEL_OPT_OUT: &str = "nogpumanager";

pub fn format_error(source: &(dyn std::error::Error + 'static)) -> String {
    let mut out = fomat!((source));

    let mut source = source.source();
    while let Some(why) = source {
        out.push_str(&fomat!(": "(why)));
        source = why.source();
    }

    out
}

/// True if the file exists and holds at least one byte.
pub fn exists_not_empty(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.len() != 0,
        Err(_) => {
            debug!("can't access {}", path.display());
            false
        }
    }
}

/// The first line of a file, trimmed. `None` if absent or empty.
pub fn read_first_line(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let line = contents.lines().next()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_owned())
    }
}

/// Case-insensitive search of every line in a file.
pub fn file_contains(path: &Path, pattern: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    fs::read_to_string(path)
        .map(|contents| contents.to_ascii_lowercase().contains(&pattern))
        .unwrap_or(false)
}

pub fn is_disabled_in_cmdline(cmdline: &Path) -> bool { file_contains(cmdline, KERNEL_OPT_OUT) }

/// Removes a file, treating its absence as success.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(why) if why.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(why) => Err(why),
    }
}

/// Creates the parent directory of `path` before writing it.
pub fn write_creating_parent(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_opt_out() {
        let dir = tempfile::tempdir().unwrap();
        let cmdline = dir.path().join("cmdline");

        fs::write(&cmdline, "BOOT_IMAGE=/vmlinuz root=UUID=1234 ro quiet splash\n").unwrap();
        assert!(!is_disabled_in_cmdline(&cmdline));

        fs::write(&cmdline, "BOOT_IMAGE=/vmlinuz ro quiet NoGpuManager\n").unwrap();
        assert!(is_disabled_in_cmdline(&cmdline));

        assert!(!is_disabled_in_cmdline(&dir.path().join("missing")));
    }

    #[test]
    fn first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version");

        fs::write(&path, "  470.57.02  \nsecond\n").unwrap();
        assert_eq!(read_first_line(&path).as_deref(), Some("470.57.02"));

        fs::write(&path, "").unwrap();
        assert_eq!(read_first_line(&path), None);
        assert!(!exists_not_empty(&path));
    }

    #[test]
    fn remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragment.conf");

        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, "x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }
}
