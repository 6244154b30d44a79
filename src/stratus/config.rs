/*
 * Copyright (C) 2025 The Stratus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::env;

/// Enum for supported configuration parameters
#[derive(Debug)]
pub enum Config {
    LogFormat,
    LogLevel,
    Workers,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::LogFormat => "STRATUS_LOG_FORMAT",
            Config::LogLevel => "STRATUS_LOG_LEVEL",
            Config::Workers => "STRATUS_WORKERS",
        }
    }

    /// Returns the default value used when the environment variable is unset.
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::LogFormat => "text",
            Config::LogLevel => "info",
            Config::Workers => "4",
        }
    }

    /// Resolves the parameter from the environment, falling back to the
    /// default when unset or empty.
    pub fn resolve(&self) -> String {
        match env::var(self.env_var()) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => self.default_value().to_string(),
        }
    }
}

/// Returns the default number of controller workers. Invalid values fall back
/// to the documented default rather than failing startup.
pub fn default_workers() -> usize {
    let raw = Config::Workers.resolve();
    match raw.parse::<usize>() {
        Ok(value) if value > 0 => value,
        _ => Config::Workers
            .default_value()
            .parse()
            .expect("default worker count is a valid usize"),
    }
}
