use super::*;
use nom::{
    character::complete::{char, digit1, multispace0, one_of},
    combinator::{all_consuming, map_res, opt},
    multi::separated_list1,
    sequence::{delimited, terminated},
    IResult, Parser,
};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// The four kinds of bounded wait a filter conversation goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutClass {
    Connect,
    Write,
    Read,
    EndOfMessage,
}

impl std::fmt::Display for TimeoutClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TimeoutClass::Connect => "connect",
            TimeoutClass::Write => "write",
            TimeoutClass::Read => "read",
            TimeoutClass::EndOfMessage => "end-of-message",
        })
    }
}

/// Per-filter timeout settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub write: Duration,
    pub read: Duration,
    pub end_of_message: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(5 * 60),
            write: Duration::from_secs(10),
            read: Duration::from_secs(10),
            end_of_message: Duration::from_secs(5 * 60),
        }
    }
}

impl Timeouts {
    pub fn get(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Connect => self.connect,
            TimeoutClass::Write => self.write,
            TimeoutClass::Read => self.read,
            TimeoutClass::EndOfMessage => self.end_of_message,
        }
    }

    /// Starts a deadline of the given class from now.
    pub fn deadline(&self, class: TimeoutClass) -> Deadline {
        Deadline::after(class, self.get(class))
    }

    /// Parses a `C:5m;S:10s;R:10s;E:5m` style list. Keys that are not
    /// mentioned keep their default value.
    pub fn parse(input: &str) -> Result<Self, MilterError> {
        let mut timeouts = Timeouts::default();
        if input.trim().is_empty() {
            return Ok(timeouts);
        }

        let (_, entries) = all_consuming(separated_list1(
            char(';'),
            delimited(multispace0, timeout_entry, multispace0),
        ))
        .parse(input)
        .map_err(|e| MilterError::parse(format!("invalid timeout list: {}", e), input))?;

        for (key, value) in entries {
            if value.is_zero() {
                return Err(MilterError::parse(
                    format!("timeout {} must be greater than zero", key),
                    input,
                ));
            }
            match key {
                'C' => timeouts.connect = value,
                'S' => timeouts.write = value,
                'R' => timeouts.read = value,
                _ => timeouts.end_of_message = value,
            }
        }
        Ok(timeouts)
    }
}

fn timeout_entry(input: &str) -> IResult<&str, (char, Duration)> {
    (terminated(one_of("CSRE"), char(':')), duration).parse(input)
}

fn duration(input: &str) -> IResult<&str, Duration> {
    map_res(
        (digit1, opt(one_of("smh"))),
        |(digits, unit): (&str, Option<char>)| {
            let value: u64 = digits.parse().map_err(|_| "number out of range")?;
            let scale = match unit {
                Some('m') => 60,
                Some('h') => 60 * 60,
                _ => 1,
            };
            value
                .checked_mul(scale)
                .map(Duration::from_secs)
                .ok_or("duration out of range")
        },
    )
    .parse(input)
}

/// A point in time by which one blocking operation has to finish.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    class: TimeoutClass,
    at: Instant,
}

impl Deadline {
    pub fn after(class: TimeoutClass, timeout: Duration) -> Self {
        Deadline {
            class,
            at: Instant::now() + timeout,
        }
    }

    pub fn class(&self) -> TimeoutClass {
        self.class
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Drives `fut` to completion or fails with a timeout of this class.
    pub async fn run<F, T, E>(self, fut: F) -> Result<T, MilterError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<MilterError>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(MilterError::Timeout(self.class)),
        }
    }
}
