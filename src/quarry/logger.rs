/*
 * Copyright (C) 2024 The Quarry Authors
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

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};

const SERVICE: &str = "quarry";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);

pub fn set_log_format(format: LogFormat) {
    JSON_OUTPUT.store(format == LogFormat::Json, Ordering::Relaxed);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn to_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

/// One log line before rendering. The component names the controller area
/// (node-controller, datastore, node-watch, ...); fields carry the object
/// identities the line is about.
struct Record<'a> {
    timestamp: String,
    level: LogLevel,
    component: &'a str,
    message: &'a str,
    fields: &'a [(&'a str, &'a str)],
}

impl Record<'_> {
    fn render_text(&self) -> String {
        let mut line = format!(
            "ts={} level={} service={} component={} pid={} msg={}",
            self.timestamp,
            self.level.label(),
            SERVICE,
            quote(self.component),
            std::process::id(),
            quote(self.message),
        );
        for (key, value) in self.fields {
            if key.is_empty() {
                continue;
            }
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&quote(value));
        }
        line
    }

    fn render_json(&self) -> String {
        let mut payload = json!({
            "ts": self.timestamp,
            "level": self.level.label(),
            "service": SERVICE,
            "component": self.component,
            "pid": std::process::id(),
            "msg": self.message,
        });
        if let Value::Object(map) = &mut payload {
            for (key, value) in self.fields {
                if key.is_empty() {
                    continue;
                }
                map.insert((*key).to_string(), Value::String((*value).to_string()));
            }
        }
        payload.to_string()
    }
}

/// Bare values stay as-is; anything with whitespace or logfmt metacharacters
/// is emitted as a quoted, escaped string literal.
fn quote(value: &str) -> String {
    let bare = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | '\\' | '='));
    if bare {
        value.to_string()
    } else {
        format!("{:?}", value)
    }
}

pub fn log_event(level: LogLevel, component: &str, message: &str, fields: &[(&str, &str)]) {
    let record = Record {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        level,
        component,
        message,
        fields,
    };
    let line = if JSON_OUTPUT.load(Ordering::Relaxed) {
        record.render_json()
    } else {
        record.render_text()
    };
    emit(level, &line);
}

pub fn log_debug(component: &str, message: &str, fields: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, fields);
}

pub fn log_info(component: &str, message: &str, fields: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, fields);
}

pub fn log_warn(component: &str, message: &str, fields: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, fields);
}

pub fn log_error(component: &str, message: &str, fields: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, fields);
}

#[cfg(not(test))]
fn emit(level: LogLevel, line: &str) {
    use std::io::Write;
    // A line that cannot be written is dropped; logging must never take the
    // controller down.
    let _ = if level.to_stderr() {
        writeln!(std::io::stderr().lock(), "{}", line)
    } else {
        writeln!(std::io::stdout().lock(), "{}", line)
    };
}

#[cfg(test)]
fn emit(level: LogLevel, line: &str) {
    captured()
        .lock()
        .unwrap()
        .push((level.to_stderr(), line.to_string()));
}

#[cfg(test)]
fn captured() -> &'static std::sync::Mutex<Vec<(bool, String)>> {
    static LINES: std::sync::OnceLock<std::sync::Mutex<Vec<(bool, String)>>> =
        std::sync::OnceLock::new();
    LINES.get_or_init(Default::default)
}

#[cfg(test)]
pub(crate) fn drain_captured_lines() -> Vec<(bool, String)> {
    std::mem::take(&mut *captured().lock().unwrap())
}
