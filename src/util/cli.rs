/* This file is part of proxyscan
 *
 * Copyright (C) 2020-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{
    env,
    fs::{self, OpenOptions},
    path::Path,
};

use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

use crate::Result;

/// Environment variable narrowing log output to a comma separated list of
/// targets. Targets prefixed with `!` are ignored instead.
pub const LOG_TARGETS_ENV: &str = "LOG_TARGETS";

pub fn get_log_level(verbosity_level: u64) -> LevelFilter {
    match verbosity_level {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn get_log_config(verbosity_level: u64) -> simplelog::Config {
    let mut cfg = ConfigBuilder::new();
    cfg.set_target_level(if verbosity_level > 0 { LevelFilter::Error } else { LevelFilter::Off });

    if let Ok(targets) = env::var(LOG_TARGETS_ENV) {
        for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match target.strip_prefix('!') {
                Some(ignored) => cfg.add_filter_ignore(ignored.to_string()),
                None => cfg.add_filter_allow(target.to_string()),
            };
        }
    }

    cfg.build()
}

/// Log to the terminal, and additionally append to `log_file` if given.
pub fn init_logger(verbosity_level: u64, log_file: Option<&Path>) -> Result<()> {
    let level = get_log_level(verbosity_level);
    let config = get_log_config(verbosity_level);

    let mut loggers: Vec<Box<dyn SharedLogger>> =
        vec![TermLogger::new(level, config.clone(), TerminalMode::Mixed, ColorChoice::Auto)];

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        loggers.push(WriteLogger::new(level, config, file));
    }

    CombinedLogger::init(loggers)?;
    Ok(())
}

/// Write the default config to `path` unless a file already exists.
pub fn spawn_config(path: &Path, contents: &[u8]) -> Result<()> {
    if path.exists() {
        return Ok(())
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, contents)?;
    println!("Config file created in {:?}. Please review it and try again.", path);
    Ok(())
}
