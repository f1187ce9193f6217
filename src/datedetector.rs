//! Timestamp extraction from log lines
//!
//! A [`DateDetector`] holds one or more templates (a regex locating the
//! date text plus a strftime format). Year-less formats such as syslog's
//! `Dec 31 23:59:59` are completed with the current year, or the previous
//! one when that would put the line more than two days in the future.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ConfigError;
use crate::models::UnixTime;

/// Tolerated clock skew before a year-less date is moved to last year
const FUTURE_SLACK_SECS: i64 = 2 * 24 * 3600;

/// How a jail obtains line timestamps
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateDetection {
    /// Every line is stamped with the processing time
    #[default]
    Now,
    /// Try the built-in templates in order
    Auto,
    /// A single user-supplied template
    Custom { regex: String, format: String },
}

#[derive(Debug, Clone)]
enum Format {
    Strftime { format: String, has_year: bool },
    Epoch,
}

/// One way of finding and parsing a date in a line
#[derive(Debug, Clone)]
pub struct DateTemplate {
    name: String,
    regex: Regex,
    format: Format,
}

impl DateTemplate {
    /// Template from a locating regex and a strftime format
    pub fn new(name: &str, regex: &str, format: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(regex).map_err(|source| ConfigError::InvalidRegex {
            pattern: regex.to_string(),
            source,
        })?;
        if format.trim().is_empty() || !format.contains('%') {
            return Err(ConfigError::InvalidDateFormat(format.to_string()));
        }
        let has_year = format.contains("%Y") || format.contains("%y");
        Ok(Self {
            name: name.to_string(),
            regex,
            format: Format::Strftime {
                format: normalize_spaces(format),
                has_year,
            },
        })
    }

    /// Leading UNIX epoch seconds, optionally with a fraction
    pub fn epoch() -> Self {
        Self {
            name: "Epoch".to_string(),
            regex: Regex::new(r"^\d{10}(?:\.\d+)?").expect("valid epoch regex"),
            format: Format::Epoch,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locate and parse a date in `line` relative to `now`
    pub fn match_time(&self, line: &str, now: DateTime<Local>) -> Option<UnixTime> {
        let found = self.regex.find(line)?.as_str();
        match &self.format {
            Format::Epoch => found
                .split('.')
                .next()
                .and_then(|secs| secs.parse::<i64>().ok()),
            Format::Strftime { format, has_year } => {
                let text = normalize_spaces(found);
                if *has_year {
                    let naive = NaiveDateTime::parse_from_str(&text, format).ok()?;
                    to_unix(naive)
                } else {
                    let with_year = format!("%Y {}", format);
                    let parse = |year: i32| {
                        NaiveDateTime::parse_from_str(&format!("{} {}", year, text), &with_year)
                            .ok()
                            .and_then(to_unix)
                    };
                    let t = parse(now.year())?;
                    if t > now.timestamp() + FUTURE_SLACK_SECS {
                        parse(now.year() - 1)
                    } else {
                        Some(t)
                    }
                }
            }
        }
    }
}

fn normalize_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn to_unix(naive: NaiveDateTime) -> Option<UnixTime> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

/// Ordered set of date templates; the first that matches wins
#[derive(Debug, Clone)]
pub struct DateDetector {
    templates: Vec<DateTemplate>,
}

impl DateDetector {
    /// Built-in templates for common log formats
    pub fn builtin() -> Self {
        let builtins = [
            (
                "Weekday Month Day Hour:Minute:Second Year",
                r"\S{3} \S{3}\s{1,2}\d{1,2} \d{2}:\d{2}:\d{2} \d{4}",
                "%a %b %d %H:%M:%S %Y",
            ),
            (
                "Year-Month-Day Hour:Minute:Second",
                r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}",
                "%Y-%m-%d %H:%M:%S",
            ),
            (
                "ISO 8601",
                r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}",
                "%Y-%m-%dT%H:%M:%S",
            ),
            (
                "Day/Month/Year:Hour:Minute:Second",
                r"\d{2}/\S{3}/\d{4}:\d{2}:\d{2}:\d{2}",
                "%d/%b/%Y:%H:%M:%S",
            ),
            (
                "Month Day Hour:Minute:Second",
                r"\S{3}\s{1,2}\d{1,2} \d{2}:\d{2}:\d{2}",
                "%b %d %H:%M:%S",
            ),
        ];

        let mut templates: Vec<DateTemplate> = builtins
            .iter()
            .filter_map(|(name, regex, format)| DateTemplate::new(name, regex, format).ok())
            .collect();
        templates.push(DateTemplate::epoch());
        Self { templates }
    }

    /// Detector with a single custom template
    pub fn custom(regex: &str, format: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            templates: vec![DateTemplate::new("Custom", regex, format)?],
        })
    }

    /// `None` for [`DateDetection::Now`]
    pub fn from_detection(detection: &DateDetection) -> Result<Option<Self>, ConfigError> {
        match detection {
            DateDetection::Now => Ok(None),
            DateDetection::Auto => Ok(Some(Self::builtin())),
            DateDetection::Custom { regex, format } => Self::custom(regex, format).map(Some),
        }
    }

    pub fn get_time(&self, line: &str) -> Option<UnixTime> {
        self.get_time_at(line, Local::now())
    }

    pub fn get_time_at(&self, line: &str, now: DateTime<Local>) -> Option<UnixTime> {
        self.templates.iter().find_map(|template| {
            let time = template.match_time(line, now)?;
            trace!("Date template '{}' matched", template.name());
            Some(time)
        })
    }
}
