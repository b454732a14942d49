use std::{
    fs::{File, OpenOptions},
    io::{BufReader, Read, Write},
    path::PathBuf,
};

use hiro_system_kit::slog::{self, Logger};

#[macro_export]
macro_rules! try_info {
    ($a:expr, $tag:expr, $($args:tt)*) => {
        $a.try_log(|l| info!(l, $tag, $($args)*))
    };
    ($a:expr, $tag:expr) => {
        $a.try_log(|l| info!(l, $tag))
    };
}

#[macro_export]
macro_rules! try_debug {
    ($a:expr, $tag:expr, $($args:tt)*) => {
        $a.try_log(|l| debug!(l, $tag, $($args)*))
    };
    ($a:expr, $tag:expr) => {
        $a.try_log(|l| debug!(l, $tag))
    };
}

#[macro_export]
macro_rules! try_warn {
    ($a:expr, $tag:expr, $($args:tt)*) => {
        $a.try_log(|l| warn!(l, $tag, $($args)*))
    };
    ($a:expr, $tag:expr) => {
        $a.try_log(|l| warn!(l, $tag))
    };
}

#[macro_export]
macro_rules! try_error {
    ($a:expr, $tag:expr, $($args:tt)*) => {
        $a.try_log(|l| error!(l, $tag, $($args)*))
    };
    ($a:expr, $tag:expr) => {
        $a.try_log(|l| error!(l, $tag))
    };
}

#[derive(Clone)]
pub struct Context {
    pub logger: Option<Logger>,
    pub tracer: bool,
}

impl Context {
    pub fn empty() -> Context {
        Context {
            logger: None,
            tracer: false,
        }
    }

    pub fn try_log<F>(&self, closure: F)
    where
        F: FnOnce(&Logger),
    {
        if let Some(ref logger) = self.logger {
            closure(logger)
        }
    }

    pub fn expect_logger(&self) -> &Logger {
        self.logger.as_ref().unwrap()
    }
}

pub fn read_file_content_at_path(file_path: &PathBuf) -> Result<Vec<u8>, String> {
    let file = File::open(file_path.clone())
        .map_err(|e| format!("unable to read file {}\n{:?}", file_path.display(), e))?;
    let mut file_reader = BufReader::new(file);
    let mut file_buffer = vec![];
    file_reader
        .read_to_end(&mut file_buffer)
        .map_err(|e| format!("unable to read file {}\n{:?}", file_path.display(), e))?;
    Ok(file_buffer)
}

/// Reads a line-oriented log file, creating it empty when missing so a fresh
/// deployment behaves like an idle external indexer.
pub fn read_log_lines_at_path(file_path: &PathBuf, ctx: &Context) -> Result<Vec<String>, String> {
    if !file_path.exists() {
        ctx.try_log(|logger| {
            slog::warn!(
                logger,
                "log file {} not found, creating empty file",
                file_path.display()
            )
        });
        write_file_content_at_path(file_path, b"")?;
        return Ok(vec![]);
    }
    let bytes = read_file_content_at_path(file_path)?;
    let content = String::from_utf8_lossy(&bytes);
    Ok(content.lines().map(|l| l.to_string()).collect())
}

pub fn write_file_content_at_path(file_path: &PathBuf, content: &[u8]) -> Result<(), String> {
    let mut parent_directory = file_path.clone();
    parent_directory.pop();
    std::fs::create_dir_all(&parent_directory).map_err(|e| {
        format!(
            "unable to create parent directory {}\n{}",
            parent_directory.display(),
            e
        )
    })?;
    let mut file = File::create(file_path)
        .map_err(|e| format!("unable to open file {}\n{}", file_path.display(), e))?;
    file.write_all(content)
        .map_err(|e| format!("unable to write file {}\n{}", file_path.display(), e))?;
    Ok(())
}

pub fn truncate_file_at_path(file_path: &PathBuf) -> Result<(), String> {
    write_file_content_at_path(file_path, b"")
}

pub fn file_append(file_path: &PathBuf, bytes: &[u8], ctx: &Context) -> Result<(), String> {
    if !file_path.exists() {
        write_file_content_at_path(file_path, b"")?;
    }
    let mut file = OpenOptions::new()
        .append(true)
        .open(file_path)
        .map_err(|e| format!("unable to open file {}\n{}", file_path.display(), e))?;
    if let Err(e) = file.write_all(bytes) {
        ctx.try_log(|logger| slog::warn!(logger, "unable to append to file: {}", e.to_string()));
        return Err(format!("unable to append to file {}", file_path.display()));
    }
    Ok(())
}
