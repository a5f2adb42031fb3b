//! Howm-style task grammar and temporal engine.
//! Tasks and events live as specially formatted text inside ordinary note lines; this crate
//! parses and re-serializes them, scores their urgency, expands recurrence rules and clips
//! intervals to single days. Everything here is pure: "now" is always passed in.

pub mod core {
    use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------- Dates ------------------------------- */

    /// A wall-clock calendar date without a time zone.
    ///
    /// Field order matters: the derived ordering compares year, then month, then date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct LocalDate {
        pub year: i32,
        pub month: u32,
        pub date: u32,
    }

    impl LocalDate {
        pub fn new(year: i32, month: u32, date: u32) -> Self {
            Self { year, month, date }
        }

        /// `None` when the fields do not name a real calendar day (e.g. month 13).
        pub fn to_naive(&self) -> Option<NaiveDate> {
            NaiveDate::from_ymd_opt(self.year, self.month, self.date)
        }

        pub fn is_valid(&self) -> bool {
            self.to_naive().is_some()
        }

        pub fn weekday(&self) -> Option<Weekday> {
            self.to_naive().map(|d| d.weekday())
        }

        /// Calendar arithmetic with month/year carry.
        pub fn add_days(&self, days: i64) -> Option<Self> {
            let date = self.to_naive()?;
            date.checked_add_signed(Duration::days(days)).map(Self::from)
        }

        pub fn at(&self, hours: u32, minutes: u32) -> LocalDateTime {
            LocalDateTime {
                year: self.year,
                month: self.month,
                date: self.date,
                hours,
                minutes,
            }
        }

        pub fn start_of_day(&self) -> Option<NaiveDateTime> {
            self.to_naive().map(|d| d.and_time(NaiveTime::MIN))
        }
    }

    impl From<NaiveDate> for LocalDate {
        fn from(d: NaiveDate) -> Self {
            Self::new(d.year(), d.month(), d.day())
        }
    }

    impl fmt::Display for LocalDate {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.date)
        }
    }

    /// A wall-clock date with hours and minutes. Seconds are not modeled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct LocalDateTime {
        pub year: i32,
        pub month: u32,
        pub date: u32,
        pub hours: u32,
        pub minutes: u32,
    }

    impl LocalDateTime {
        pub fn local_date(&self) -> LocalDate {
            LocalDate::new(self.year, self.month, self.date)
        }

        pub fn minutes_of_day(&self) -> u32 {
            self.hours * 60 + self.minutes
        }

        pub fn to_naive(&self) -> Option<NaiveDateTime> {
            let time = NaiveTime::from_hms_opt(self.hours, self.minutes, 0)?;
            Some(self.local_date().to_naive()?.and_time(time))
        }

        pub fn is_valid(&self) -> bool {
            self.to_naive().is_some()
        }

        pub fn add_minutes(&self, minutes: i64) -> Option<Self> {
            let dt = self.to_naive()?;
            dt.checked_add_signed(Duration::minutes(minutes))
                .map(Self::from)
        }
    }

    impl From<NaiveDateTime> for LocalDateTime {
        fn from(dt: NaiveDateTime) -> Self {
            Self {
                year: dt.year(),
                month: dt.month(),
                date: dt.day(),
                hours: dt.hour(),
                minutes: dt.minute(),
            }
        }
    }

    impl fmt::Display for LocalDateTime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}T{:02}:{:02}",
                self.local_date(),
                self.hours,
                self.minutes
            )
        }
    }

    /// Either a bare date or a date-time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum LocalMoment {
        Date(LocalDate),
        DateTime(LocalDateTime),
    }

    impl LocalMoment {
        pub fn local_date(&self) -> LocalDate {
            match self {
                Self::Date(d) => *d,
                Self::DateTime(dt) => dt.local_date(),
            }
        }

        pub fn minutes_of_day(&self) -> Option<u32> {
            match self {
                Self::Date(_) => None,
                Self::DateTime(dt) => Some(dt.minutes_of_day()),
            }
        }

        /// Midnight for bare dates.
        pub fn to_naive(&self) -> Option<NaiveDateTime> {
            match self {
                Self::Date(d) => d.start_of_day(),
                Self::DateTime(dt) => dt.to_naive(),
            }
        }

        /// Strictly-before comparison.
        ///
        /// On the same calendar day a bare date is never before anything, and nothing is
        /// before a bare date: only two date-times on one day compare by clock time.
        pub fn is_before(&self, other: &Self) -> bool {
            let (left, right) = (self.local_date(), other.local_date());
            if left != right {
                return left < right;
            }
            match (self.minutes_of_day(), other.minutes_of_day()) {
                (Some(l), Some(r)) => l < r,
                _ => false,
            }
        }

        /// "Not before and not identical". Because `is_before` treats a bare date and a
        /// date-time on the same day as incomparable, each of them counts as after the other.
        pub fn is_after(&self, other: &Self) -> bool {
            !self.is_before(other) && self != other
        }
    }

    impl fmt::Display for LocalMoment {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Date(d) => fmt::Display::fmt(d, f),
                Self::DateTime(dt) => fmt::Display::fmt(dt, f),
            }
        }
    }

    /* --------------------------- Partial dates --------------------------- */

    /// Clock time; hours and minutes are always set together.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct TimeOfDay {
        pub hours: u32,
        pub minutes: u32,
    }

    impl TimeOfDay {
        pub fn new(hours: u32, minutes: u32) -> Self {
            Self { hours, minutes }
        }

        pub fn minutes_of_day(&self) -> u32 {
            self.hours * 60 + self.minutes
        }
    }

    /// A date/time as written in a task marker, with any higher-order field possibly absent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
    pub struct DateSpec {
        pub year: Option<i32>,
        pub month: Option<u32>,
        pub date: Option<u32>,
        pub time: Option<TimeOfDay>,
    }

    impl DateSpec {
        pub fn local_date(&self) -> Option<LocalDate> {
            Some(LocalDate::new(self.year?, self.month?, self.date?))
        }

        pub fn local_date_time(&self) -> Option<LocalDateTime> {
            let t = self.time?;
            Some(self.local_date()?.at(t.hours, t.minutes))
        }

        /// A complete date, with or without a clock time.
        pub fn moment(&self) -> Option<LocalMoment> {
            let date = self.local_date()?;
            Some(match self.time {
                Some(t) => LocalMoment::DateTime(date.at(t.hours, t.minutes)),
                None => LocalMoment::Date(date),
            })
        }

        pub fn is_time_only(&self) -> bool {
            self.year.is_none() && self.month.is_none() && self.date.is_none()
        }

        /// First absent field in `year > month > date > hours > minutes` order.
        pub fn first_missing(&self) -> Option<DateField> {
            if self.year.is_none() {
                Some(DateField::Year)
            } else if self.month.is_none() {
                Some(DateField::Month)
            } else if self.date.is_none() {
                Some(DateField::Date)
            } else if self.time.is_none() {
                Some(DateField::Hours)
            } else {
                None
            }
        }

        /// Fill every absent field from `base`; present fields win.
        pub fn inherit(&self, base: &DateSpec) -> DateSpec {
            DateSpec {
                year: self.year.or(base.year),
                month: self.month.or(base.month),
                date: self.date.or(base.date),
                time: self.time.or(base.time),
            }
        }

        /// Range checks for whatever fields are present. Month/day pairs without a year are
        /// checked against a leap year so that `02-29` stays acceptable.
        pub fn validate(&self, which: Boundary) -> Result<(), TaskError> {
            let invalid = || TaskError::InvalidDate {
                which,
                value: self.to_string(),
            };
            if let Some(t) = self.time {
                if t.hours > 23 || t.minutes > 59 {
                    return Err(invalid());
                }
            }
            if let Some(m) = self.month {
                if !(1..=12).contains(&m) {
                    return Err(invalid());
                }
            }
            if let Some(d) = self.date {
                if !(1..=31).contains(&d) {
                    return Err(invalid());
                }
                if let Some(m) = self.month {
                    let year = self.year.unwrap_or(2000);
                    if NaiveDate::from_ymd_opt(year, m, d).is_none() {
                        return Err(invalid());
                    }
                }
            }
            Ok(())
        }
    }

    impl From<LocalDate> for DateSpec {
        fn from(d: LocalDate) -> Self {
            Self {
                year: Some(d.year),
                month: Some(d.month),
                date: Some(d.date),
                time: None,
            }
        }
    }

    impl From<LocalDateTime> for DateSpec {
        fn from(dt: LocalDateTime) -> Self {
            Self {
                time: Some(TimeOfDay::new(dt.hours, dt.minutes)),
                ..Self::from(dt.local_date())
            }
        }
    }

    /* ------------------------------- Status ------------------------------- */

    /// Task status, written as a single symbol right before the `@` of a marker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum Status {
        Schedule,
        Todo,
        Note,
        Deadline,
        UpDown,
        Done,
    }

    impl Status {
        pub const SYMBOLS: &'static str = "@+-!~.";

        pub fn from_symbol(c: char) -> Option<Self> {
            match c {
                '@' => Some(Self::Schedule),
                '+' => Some(Self::Todo),
                '-' => Some(Self::Note),
                '!' => Some(Self::Deadline),
                '~' => Some(Self::UpDown),
                '.' => Some(Self::Done),
                _ => None,
            }
        }

        pub fn symbol(&self) -> char {
            match self {
                Self::Schedule => '@',
                Self::Todo => '+',
                Self::Note => '-',
                Self::Deadline => '!',
                Self::UpDown => '~',
                Self::Done => '.',
            }
        }

        /// Tie-break priority when freshness is equal; higher sorts first.
        pub fn rank(&self) -> u8 {
            match self {
                Self::Deadline => 5,
                Self::Schedule => 4,
                Self::Todo => 3,
                Self::Note => 2,
                Self::UpDown => 1,
                Self::Done => 0,
            }
        }
    }

    impl fmt::Display for Status {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self {
                Self::Schedule => "schedule",
                Self::Todo => "todo",
                Self::Note => "note",
                Self::Deadline => "deadline",
                Self::UpDown => "up-down",
                Self::Done => "done",
            };
            f.write_str(name)
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A task parsed from link text: `name{symbol}{speed}@{start}[/{end}|D{minutes}]`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskLink {
        pub name: String,
        pub status: Status,
        /// Steepness of the freshness curve; `None` means the per-status default.
        pub speed: Option<u32>,
        /// Possibly partial; this grammar never inherits missing fields.
        pub start: DateSpec,
        pub end: Option<DateSpec>,
        /// Minutes.
        pub duration: Option<u32>,
        /// Original text.
        pub raw: String,
    }

    /// A fully resolved start/end pair.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Event {
        pub name: String,
        pub start: LocalDateTime,
        pub end: LocalDateTime,
        /// The task the event was written next to, if any.
        pub task: Option<TaskLink>,
        pub raw: String,
    }

    impl Event {
        pub fn duration_minutes(&self) -> Option<i64> {
            let (start, end) = (self.start.to_naive()?, self.end.to_naive()?);
            Some((end - start).num_minutes())
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Boundary {
        Start,
        End,
    }

    impl fmt::Display for Boundary {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Self::Start => "start",
                Self::End => "end",
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    pub enum DateField {
        Year,
        Month,
        Date,
        Hours,
        Minutes,
    }

    impl fmt::Display for DateField {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Self::Year => "year",
                Self::Month => "month",
                Self::Date => "date",
                Self::Hours => "hours",
                Self::Minutes => "minutes",
            })
        }
    }

    /// Failures of a syntactically recognised marker. Text that is not a marker at all is
    /// reported as `Ok(None)` by the parsers, never as one of these.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TaskError {
        #[error("invalid {which} date: {value}")]
        InvalidDate { which: Boundary, value: String },
        #[error("end {end} is before start {start}")]
        TaskRange { start: String, end: String },
        #[error("cannot resolve the {field} of the event {which}")]
        LackDate { which: Boundary, field: DateField },
    }

}

pub mod config {
    //! Tunables loaded from a JSON settings file. The engine never reads these implicitly;
    //! callers hand the relevant table to the functions that need it.

    use crate::core::Status;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    /// Default freshness speed per status, used when a task carries no explicit speed.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SpeedTable {
        pub todo: u32,
        pub deadline: u32,
        pub note: u32,
        pub up_down: u32,
    }

    impl Default for SpeedTable {
        fn default() -> Self {
            Self {
                todo: 7,
                deadline: 7,
                note: 1,
                up_down: 30,
            }
        }
    }

    impl SpeedTable {
        /// `None` for statuses whose score does not depend on speed.
        pub fn for_status(&self, status: Status) -> Option<u32> {
            match status {
                Status::Todo => Some(self.todo),
                Status::Deadline => Some(self.deadline),
                Status::Note => Some(self.note),
                Status::UpDown => Some(self.up_down),
                Status::Schedule | Status::Done => None,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SyncSettings {
        /// Project used in calendar scope keys when the caller has none.
        pub default_project: String,
    }

    impl Default for SyncSettings {
        fn default() -> Self {
            Self {
                default_project: "howm".into(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        pub speeds: SpeedTable,
        pub sync: SyncSettings,
    }

    impl Settings {
        pub fn from_json_str(text: &str) -> Result<Self> {
            serde_json::from_str(text).context("parsing settings JSON")
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Self::from_json_str(&text).with_context(|| format!("loading settings from {:?}", path))
        }
    }

}

pub mod line {
    //! Fixed-width task line:
    //!
    //! ```text
    //! `YYYY-MM-DD HH:MM DDDD HH:MM:SS HH:MM:SS`title
    //! ```
    //!
    //! base date, planned start, planned duration (minutes), actual start, actual end.
    //! Blank fields are runs of spaces of the same width. Anything that deviates from the
    //! field widths is not a task line.

    use crate::parser::PResult;
    use crate::period::{Log, Period};
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_while},
        character::complete::{char, not_line_ending},
        combinator::{eof, map, map_res, opt, value},
        error::{VerboseError, VerboseErrorKind},
        sequence::tuple,
    };
    use serde::{Deserialize, Serialize};
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Plan {
        pub start: Option<NaiveDateTime>,
        /// Minutes; at most four digits on the line.
        pub duration: Option<u32>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Record {
        pub start: Option<NaiveDateTime>,
        /// Never before `start`; may fall on the day after `base`.
        pub end: Option<NaiveDateTime>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskLine {
        pub title: String,
        pub base: NaiveDate,
        pub plan: Plan,
        pub record: Record,
    }

    pub const MAX_PLANNED_MINUTES: u32 = 9999;

    impl TaskLine {
        /// Line breaks in the title become spaces; the line format has no room for them.
        pub fn new(title: impl Into<String>, base: NaiveDate) -> Self {
            Self {
                title: title.into().replace(['\r', '\n'], " "),
                base,
                plan: Plan::default(),
                record: Record::default(),
            }
        }

        /// Durations beyond four digits are clamped and the start is cut to whole minutes.
        pub fn with_plan(mut self, start: Option<NaiveTime>, duration: Option<u32>) -> Self {
            self.plan = Plan {
                start: start.map(|t| self.base.and_time(whole_minutes(t))),
                duration: duration.map(|d| d.min(MAX_PLANNED_MINUTES)),
            };
            self
        }

        /// Both clocks are read against `base` at whole-second precision; an end earlier than
        /// the start is taken to be on the following day.
        pub fn with_record(mut self, start: Option<NaiveTime>, end: Option<NaiveTime>) -> Self {
            self.record = resolve_record(self.base, start, end);
            self
        }

        pub fn is_running(&self) -> bool {
            self.record.start.is_some() && self.record.end.is_none()
        }

        /// Start the task at `now`, moving it to `now`'s day and clearing any previous end.
        pub fn start(&self, now: NaiveDateTime) -> Self {
            let moved = self.move_to(now.date());
            moved.with_record(Some(now.time()), None)
        }

        /// Stop a running task. `None` when the task never started or `now` cannot be written
        /// on this line (before the start, or a full day or more after it).
        pub fn end(&self, now: NaiveDateTime) -> Option<Self> {
            let start = self.record.start?;
            if now < start || now - start >= Duration::days(1) {
                return None;
            }
            Some(self.clone().with_record(Some(start.time()), Some(now.time())))
        }

        pub fn reset(&self) -> Self {
            Self {
                record: Record::default(),
                ..self.clone()
            }
        }

        /// Rebase onto another day. The planned clock time is kept, the record is dropped.
        pub fn move_to(&self, date: NaiveDate) -> Self {
            let plan_time = self.plan.start.map(|s| s.time());
            Self::new(self.title.clone(), date).with_plan(plan_time, self.plan.duration)
        }

        pub fn planned_period(&self) -> Option<Period> {
            Some(Period::new(
                self.plan.start?,
                Duration::minutes(i64::from(self.plan.duration?)),
            ))
        }

        pub fn record_log(&self) -> Option<Log> {
            let start = self.record.start?;
            Some(Log {
                start,
                duration: self.record.end.map(|end| end - start),
            })
        }
    }

    fn resolve_record(base: NaiveDate, start: Option<NaiveTime>, end: Option<NaiveTime>) -> Record {
        let start = start.map(|t| base.and_time(whole_seconds(t)));
        let end = end.map(|t| {
            let end = base.and_time(whole_seconds(t));
            match start {
                Some(s) if end < s => end + Duration::days(1),
                _ => end,
            }
        });
        Record { start, end }
    }

    fn whole_minutes(t: NaiveTime) -> NaiveTime {
        NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
    }

    fn whole_seconds(t: NaiveTime) -> NaiveTime {
        NaiveTime::from_hms_opt(t.hour(), t.minute(), t.second()).unwrap_or(t)
    }

    /// `None` for anything that is not a task line.
    pub fn parse_task_line(text: &str) -> Option<TaskLine> {
        match task_line(text) {
            Ok((_, line)) => Some(line),
            Err(_) => None,
        }
    }

    impl fmt::Display for TaskLine {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "`{}", self.base.format("%Y-%m-%d"))?;
            match self.plan.start {
                Some(s) => write!(f, " {}", s.format("%H:%M"))?,
                None => f.write_str("      ")?,
            }
            match self.plan.duration {
                Some(d) => write!(f, " {:04}", d)?,
                None => f.write_str("     ")?,
            }
            for clock in [self.record.start, self.record.end] {
                match clock {
                    Some(c) => write!(f, " {}", c.format("%H:%M:%S"))?,
                    None => f.write_str("         ")?,
                }
            }
            write!(f, "`{}", self.title)
        }
    }

    /* ------------------------------- Parsing ------------------------------- */

    fn task_line(i: &str) -> PResult<'_, TaskLine> {
        let (i, (_, base, _, plan_start, _, duration, _, rec_start, _, rec_end, _)) = tuple((
            char('`'),
            parse_date,
            char(' '),
            alt((value(None, tag("     ")), map(parse_hm, Some))),
            char(' '),
            alt((value(None, tag("    ")), map(parse_minutes, Some))),
            char(' '),
            alt((value(None, tag("        ")), map(parse_hms, Some))),
            char(' '),
            alt((value(None, tag("        ")), map(parse_hms, Some))),
            char('`'),
        ))(i)?;
        let (i, title) = not_line_ending(i)?;
        let (i, _) = opt(alt((tag("\r\n"), tag("\n"))))(i)?;
        let (i, _) = eof(i)?;

        Ok((
            i,
            TaskLine::new(title, base)
                .with_plan(plan_start, duration)
                .with_record(rec_start, rec_end),
        ))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(digits(4), |s: &str| s.parse::<i32>()),
                char('-'),
                map_res(digits(2), |s: &str| s.parse::<u32>()),
                char('-'),
                map_res(digits(2), |s: &str| s.parse::<u32>()),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_hm(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((two_digits, char(':'), two_digits)),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn parse_hms(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((two_digits, char(':'), two_digits, char(':'), two_digits)),
            |(h, _, m, _, s)| NaiveTime::from_hms_opt(h, m, s).ok_or("invalid time"),
        )(i)
    }

    fn two_digits(i: &str) -> PResult<'_, u32> {
        map_res(digits(2), |s: &str| s.parse::<u32>())(i)
    }

    fn parse_minutes(i: &str) -> PResult<'_, u32> {
        map_res(digits(4), |s: &str| s.parse::<u32>())(i)
    }

    /// Exactly `n` ASCII digits.
    fn digits(n: usize) -> impl Fn(&str) -> PResult<'_, &str> {
        move |i: &str| {
            let (rest, out) = take_while(|c: char| c.is_ascii_digit())(i)?;
            if out.len() != n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("digits"))],
                }))
            } else {
                Ok((rest, out))
            }
        }
    }

}

pub mod period {
    //! Interval algebra used to project spans onto single-day views.

    use crate::core::Event;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};

    /// A start instant plus a non-negative duration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Period {
        pub start: NaiveDateTime,
        #[serde(with = "serde_duration_secs")]
        pub duration: Duration,
    }

    impl Period {
        /// A negative duration is read as the same span measured backwards from `start`.
        pub fn new(start: NaiveDateTime, duration: Duration) -> Self {
            if duration < Duration::zero() {
                Self {
                    start: start + duration,
                    duration: -duration,
                }
            } else {
                Self { start, duration }
            }
        }

        pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
            Self::new(start, end - start)
        }

        pub fn from_event(event: &Event) -> Option<Self> {
            Some(Self::between(event.start.to_naive()?, event.end.to_naive()?))
        }

        pub fn end(&self) -> NaiveDateTime {
            self.start + self.duration
        }

        /// Cut at `instant` into the part before and the part after it. The two durations
        /// always add up to the original one.
        pub fn split(&self, instant: NaiveDateTime) -> (Option<Period>, Option<Period>) {
            if instant <= self.start {
                return (None, Some(*self));
            }
            if instant >= self.end() {
                return (Some(*self), None);
            }
            let before = instant - self.start;
            (
                Some(Period::new(self.start, before)),
                Some(Period::new(instant, self.duration - before)),
            )
        }

        /// The portion lying inside `date` (local midnight to midnight).
        pub fn clip_to_day(&self, date: NaiveDate) -> Option<Period> {
            let day_start = date.and_time(NaiveTime::MIN);
            let (_, rest) = self.split(day_start);
            rest?.split(day_start + Duration::days(1)).0
        }

        /// True when the periods share at least one instant, touching ends included.
        pub fn overlaps(&self, other: &Period) -> bool {
            self.start <= other.end() && other.start <= self.end()
        }

        /// Union of two overlapping or adjacent periods.
        pub fn merge(&self, other: &Period) -> Option<Period> {
            if !self.overlaps(other) {
                return None;
            }
            let start = self.start.min(other.start);
            let end = self.end().max(other.end());
            Some(Period::between(start, end))
        }
    }

    /// Coalesce a set of periods into sorted, non-overlapping ones.
    pub fn merge_periods(mut periods: Vec<Period>) -> Vec<Period> {
        periods.sort_by_key(|p| (p.start, p.duration));
        let mut out: Vec<Period> = Vec::with_capacity(periods.len());
        for p in periods {
            match out.last_mut() {
                Some(last) => match last.merge(&p) {
                    Some(merged) => *last = merged,
                    None => out.push(p),
                },
                None => out.push(p),
            }
        }
        out
    }

    /// A start with an optional duration; no duration means "still running".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Log {
        pub start: NaiveDateTime,
        #[serde(with = "serde_duration_secs_opt")]
        pub duration: Option<Duration>,
    }

    impl Log {
        pub fn end(&self) -> Option<NaiveDateTime> {
            self.duration.map(|d| self.start + d)
        }

        pub fn to_period(&self) -> Option<Period> {
            self.duration.map(|d| Period::new(self.start, d))
        }

        /// Treat a running log as ending at `now`.
        pub fn to_period_until(&self, now: NaiveDateTime) -> Period {
            self.to_period()
                .unwrap_or_else(|| Period::between(self.start, now.max(self.start)))
        }
    }

    mod serde_duration_secs {
        use chrono::Duration;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_i64(value.num_seconds())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Duration::seconds(i64::deserialize(deserializer)?))
        }
    }

    mod serde_duration_secs_opt {
        use chrono::Duration;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(d) => serializer.serialize_some(&d.num_seconds()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt = Option::<i64>::deserialize(deserializer)?;
            Ok(opt.map(Duration::seconds))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2023, 9, d)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap()
        }

        fn reassemble(parts: &[Option<Period>]) -> Vec<Period> {
            parts.iter().flatten().copied().collect()
        }

        #[test]
        fn split_outside_keeps_period_whole() {
            let p = Period::new(at(12, 10, 0), Duration::minutes(60));
            assert_eq!(p.split(at(12, 9, 0)), (None, Some(p)));
            assert_eq!(p.split(at(12, 10, 0)), (None, Some(p)));
            assert_eq!(p.split(at(12, 11, 0)), (Some(p), None));
            assert_eq!(p.split(at(12, 12, 0)), (Some(p), None));
        }

        #[test]
        fn split_inside_is_contiguous() {
            let p = Period::new(at(12, 10, 0), Duration::minutes(60));
            let (before, after) = p.split(at(12, 10, 25));
            let (before, after) = (before.expect("before"), after.expect("after"));
            assert_eq!(before.start, p.start);
            assert_eq!(before.end(), after.start);
            assert_eq!(after.end(), p.end());
            assert_eq!(before.duration + after.duration, p.duration);
        }

        #[test]
        fn split_order_does_not_change_partition() {
            let p = Period::new(at(12, 22, 0), Duration::minutes(240));
            let (a, b) = (at(12, 23, 0), at(13, 1, 30));

            let (x1, rest) = p.split(a);
            let (x2, x3) = rest.expect("rest").split(b);
            let first = reassemble(&[x1, x2, x3]);

            let (head, y3) = p.split(b);
            let (y1, y2) = head.expect("head").split(a);
            let second = reassemble(&[y1, y2, y3]);

            assert_eq!(first, second);
            assert_eq!(first.len(), 3);
            assert_eq!(merge_periods(first), vec![p]);
        }

        #[test]
        fn clip_keeps_only_the_days_portion() {
            let p = Period::new(at(12, 22, 0), Duration::minutes(240));
            let day12 = p.clip_to_day(NaiveDate::from_ymd_opt(2023, 9, 12).unwrap());
            let day13 = p.clip_to_day(NaiveDate::from_ymd_opt(2023, 9, 13).unwrap());
            let day14 = p.clip_to_day(NaiveDate::from_ymd_opt(2023, 9, 14).unwrap());
            assert_eq!(day12, Some(Period::between(at(12, 22, 0), at(13, 0, 0))));
            assert_eq!(day13, Some(Period::between(at(13, 0, 0), at(13, 2, 0))));
            assert_eq!(day14, None);
        }

        #[test]
        fn negative_duration_is_normalized() {
            let p = Period::new(at(12, 10, 0), Duration::minutes(-30));
            assert_eq!(p.start, at(12, 9, 30));
            assert_eq!(p.end(), at(12, 10, 0));
        }

        #[test]
        fn merge_coalesces_overlapping_and_adjacent() {
            let merged = merge_periods(vec![
                Period::between(at(12, 13, 0), at(12, 14, 0)),
                Period::between(at(12, 9, 0), at(12, 10, 0)),
                Period::between(at(12, 10, 0), at(12, 11, 0)),
                Period::between(at(12, 13, 30), at(12, 13, 45)),
            ]);
            assert_eq!(
                merged,
                vec![
                    Period::between(at(12, 9, 0), at(12, 11, 0)),
                    Period::between(at(12, 13, 0), at(12, 14, 0)),
                ]
            );
        }

        #[test]
        fn log_end_is_partial() {
            let running = Log {
                start: at(12, 9, 0),
                duration: None,
            };
            assert_eq!(running.end(), None);
            assert_eq!(running.to_period(), None);
            assert_eq!(
                running.to_period_until(at(12, 9, 45)),
                Period::between(at(12, 9, 0), at(12, 9, 45))
            );
            let finished = Log {
                duration: Some(Duration::minutes(15)),
                ..running
            };
            assert_eq!(finished.end(), Some(at(12, 9, 15)));
        }

        #[test]
        fn serializes_duration_as_seconds() {
            let p = Period::new(at(12, 9, 0), Duration::minutes(2));
            let json = serde_json::to_string(&p).expect("serialize");
            assert!(json.contains("\"duration\":120"));
            let back: Period = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back, p);
        }
    }
}

pub mod parser {
    //! Howm-style markers embedded in link text, built on `nom`.
    //!
    //! A task marker is `{symbol}{speed}@{date}[/{end}|D{minutes}]` anywhere in the text, where
    //! the symbol is one of `@+-!~.` and the speed is an optional integer. The date comes in
    //! five shapes, each filling fewer fields than the last:
    //! - `YYYY-MM-DDThh:mm`
    //! - `YYYY-MM-DD`
    //! - `MM-DD`
    //! - `DD`
    //! - `Thh:mm` or `hh:mm`
    //!
    //! Partial dates may also carry a `Thh:mm` suffix. Missing fields are never filled in here.

    use crate::core::*;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::take_while,
        character::complete::{char, digit1, one_of},
        combinator::{map, map_res, opt},
        error::{VerboseError, VerboseErrorKind},
        sequence::{preceded, tuple},
    };
    use std::ops::Range;

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// End of a marker as written.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum EndSpec {
        At(DateSpec),
        Minutes(u32),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TaskMarker {
        pub status: Status,
        pub speed: Option<u32>,
        pub start: DateSpec,
        pub end: Option<EndSpec>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct EventMarker {
        pub start: DateSpec,
        pub end: Option<EndSpec>,
    }

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a task out of link text.
    ///
    /// `Ok(None)` when the text carries no task marker (an ordinary link). The name is the
    /// text outside the marker, trimmed.
    pub fn parse_task(text: &str) -> Result<Option<TaskLink>, TaskError> {
        let Some((span, marker)) = find_marker(text, Status::SYMBOLS, task_marker) else {
            return Ok(None);
        };

        marker.start.validate(Boundary::Start)?;
        let (end, duration) = match marker.end {
            Some(EndSpec::At(end)) => {
                end.validate(Boundary::End)?;
                check_range(&marker.start, &end)?;
                (Some(end), None)
            }
            Some(EndSpec::Minutes(minutes)) => (None, Some(minutes)),
            None => (None, None),
        };

        let status = if has_legacy_done_mark(text) {
            Status::Done
        } else {
            marker.status
        };

        Ok(Some(TaskLink {
            name: splice_out(text, span),
            status,
            speed: marker.speed,
            start: marker.start,
            end,
            duration,
            raw: text.to_string(),
        }))
    }

    /// Older pages marked finished tasks by prefixing the link with ✅ or ❌ (possibly after
    /// stray variation selectors). Such tasks are done whatever symbol the marker uses.
    pub fn has_legacy_done_mark(raw: &str) -> bool {
        raw.trim_start_matches(['\u{FE0E}', '\u{FE0F}'])
            .starts_with(['\u{2705}', '\u{274C}'])
    }

    /* ------------------------------- Utils ------------------------------- */

    /// First position whose character is in `starts` and where `parser` succeeds.
    pub(crate) fn find_marker<'a, T>(
        text: &'a str,
        starts: &str,
        parser: impl Fn(&'a str) -> PResult<'a, T>,
    ) -> Option<(Range<usize>, T)> {
        text.char_indices()
            .filter(|(_, c)| starts.contains(*c))
            .find_map(|(idx, _)| {
                let (rest, out) = parser(&text[idx..]).ok()?;
                Some((idx..text.len() - rest.len(), out))
            })
    }

    /// The text with `span` removed; surrounding fragments are joined as-is, then trimmed.
    pub(crate) fn splice_out(text: &str, span: Range<usize>) -> String {
        format!("{}{}", &text[..span.start], &text[span.end..])
            .trim()
            .to_string()
    }

    fn check_range(start: &DateSpec, end: &DateSpec) -> Result<(), TaskError> {
        let dated_end = DateSpec {
            time: end.time,
            ..end.inherit(start)
        };
        let precedes = match (dated_end.moment(), start.moment()) {
            (Some(e), Some(s)) => e.is_before(&s),
            _ => precedes_fieldwise(&dated_end, start),
        };
        if precedes {
            return Err(TaskError::TaskRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(())
    }

    /// Compare only the fields both sides carry, highest first.
    fn precedes_fieldwise(end: &DateSpec, start: &DateSpec) -> bool {
        let fields = [
            (end.year.map(i64::from), start.year.map(i64::from)),
            (end.month.map(i64::from), start.month.map(i64::from)),
            (end.date.map(i64::from), start.date.map(i64::from)),
        ];
        for (e, s) in fields {
            if let (Some(e), Some(s)) = (e, s) {
                if e != s {
                    return e < s;
                }
            }
        }
        match (end.time, start.time) {
            (Some(e), Some(s)) => e < s,
            _ => false,
        }
    }

    /* ------------------------------ Grammar ------------------------------ */

    pub(crate) fn task_marker(i: &str) -> PResult<'_, TaskMarker> {
        map(
            tuple((
                map_res(one_of(Status::SYMBOLS), |c| {
                    Status::from_symbol(c).ok_or("unknown status")
                }),
                opt(map_res(digit1, |s: &str| s.parse::<u32>())),
                char('@'),
                date_spec,
                opt(end_spec),
            )),
            |(status, speed, _, start, end)| TaskMarker {
                status,
                speed,
                start,
                end,
            },
        )(i)
    }

    pub(crate) fn event_marker(i: &str) -> PResult<'_, EventMarker> {
        map(
            tuple((char('@'), date_spec, opt(end_spec))),
            |(_, start, end)| EventMarker { start, end },
        )(i)
    }

    fn end_spec(i: &str) -> PResult<'_, EndSpec> {
        alt((
            preceded(char('/'), map(date_spec, EndSpec::At)),
            preceded(
                char('D'),
                map(map_res(digit1, |s: &str| s.parse::<u32>()), EndSpec::Minutes),
            ),
        ))(i)
    }

    pub(crate) fn date_spec(i: &str) -> PResult<'_, DateSpec> {
        alt((time_only, dated))(i)
    }

    fn time_only(i: &str) -> PResult<'_, DateSpec> {
        map(preceded(opt(char('T')), clock), |time| DateSpec {
            time: Some(time),
            ..DateSpec::default()
        })(i)
    }

    fn dated(i: &str) -> PResult<'_, DateSpec> {
        map(
            tuple((
                alt((full_date, month_day, day_only)),
                opt(preceded(char('T'), clock)),
            )),
            |(date, time)| DateSpec { time, ..date },
        )(i)
    }

    fn full_date(i: &str) -> PResult<'_, DateSpec> {
        map(
            tuple((number(4, 4), char('-'), number(2, 2), char('-'), number(2, 2))),
            |(y, _, m, _, d)| DateSpec {
                year: Some(y as i32),
                month: Some(m),
                date: Some(d),
                time: None,
            },
        )(i)
    }

    fn month_day(i: &str) -> PResult<'_, DateSpec> {
        map(
            tuple((number(2, 2), char('-'), number(2, 2))),
            |(m, _, d)| DateSpec {
                month: Some(m),
                date: Some(d),
                ..DateSpec::default()
            },
        )(i)
    }

    fn day_only(i: &str) -> PResult<'_, DateSpec> {
        map(number(1, 2), |d| DateSpec {
            date: Some(d),
            ..DateSpec::default()
        })(i)
    }

    /// `hh:mm`, range-checked later so that `25:00` is an invalid date rather than plain text.
    fn clock(i: &str) -> PResult<'_, TimeOfDay> {
        map(
            tuple((number(2, 2), char(':'), number(2, 2))),
            |(h, _, m)| TimeOfDay::new(h, m),
        )(i)
    }

    /// A run of `m..=n` ASCII digits that is not followed by another digit.
    pub(crate) fn number(m: usize, n: usize) -> impl Fn(&str) -> PResult<'_, u32> {
        move |i: &str| {
            let (rest, out) = take_while(|c: char| c.is_ascii_digit())(i)?;
            if out.len() < m || out.len() > n {
                return Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("number"))],
                }));
            }
            match out.parse::<u32>() {
                Ok(v) => Ok((rest, v)),
                Err(_) => Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("number"))],
                })),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn task(text: &str) -> TaskLink {
            match parse_task(text) {
                Ok(Some(t)) => t,
                other => panic!("expected task from {:?}, got {:?}", text, other),
            }
        }

        #[test]
        fn full_datetime_with_duration() {
            let t = task("name~@2023-09-12T12:50D10");
            assert_eq!(t.name, "name");
            assert_eq!(t.status, Status::UpDown);
            assert_eq!(t.speed, None);
            assert_eq!(
                t.start.local_date_time(),
                Some(LocalDate::new(2023, 9, 12).at(12, 50))
            );
            assert_eq!(t.duration, Some(10));
            assert_eq!(t.end, None);
        }

        #[test]
        fn every_status_symbol_and_speed() {
            let cases = [
                ("a@@2023-01-02", Status::Schedule),
                ("a+@2023-01-02", Status::Todo),
                ("a-@2023-01-02", Status::Note),
                ("a!@2023-01-02", Status::Deadline),
                ("a~@2023-01-02", Status::UpDown),
                ("a.@2023-01-02", Status::Done),
            ];
            for (text, status) in cases {
                assert_eq!(task(text).status, status, "{text}");
            }
            let t = task("report!3@2002-10-20");
            assert_eq!(t.speed, Some(3));
            assert_eq!(t.name, "report");
        }

        #[test]
        fn partial_dates_stay_partial() {
            let md = task("+@09-13 x");
            assert_eq!((md.start.year, md.start.month, md.start.date), (None, Some(9), Some(13)));
            let d = task("+@13 x");
            assert_eq!(d.start.date, Some(13));
            assert_eq!(d.start.first_missing(), Some(DateField::Year));
            let t = task("+@T09:30 x");
            assert!(t.start.is_time_only());
            assert_eq!(t.start.time, Some(TimeOfDay::new(9, 30)));
            let bare = task("+@09:30 x");
            assert_eq!(bare.start, t.start);
            let dt = task("+@13T09:30 x");
            assert_eq!(dt.start.date, Some(13));
            assert_eq!(dt.start.time, Some(TimeOfDay::new(9, 30)));
        }

        #[test]
        fn name_is_text_outside_marker() {
            let t = task("  buy +@2023-09-12/13:00 milk ");
            assert_eq!(t.name, "buy  milk");
            assert_eq!(t.raw, "  buy +@2023-09-12/13:00 milk ");
            let joined = task("name~@2023-09-12T12:50D10@13");
            assert_eq!(joined.name, "name@13");
        }

        #[test]
        fn end_shapes() {
            let t = task("x+@2023-09-12T10:00/11:30");
            assert_eq!(t.end.and_then(|e| e.time), Some(TimeOfDay::new(11, 30)));
            assert!(t.end.expect("end").is_time_only());
            let t = task("x+@2023-09-12/09-14T08:00");
            let end = t.end.expect("end");
            assert_eq!((end.month, end.date), (Some(9), Some(14)));
            let t = task("x+@2023-09-12/15");
            assert_eq!(t.end.and_then(|e| e.date), Some(15));
        }

        #[test]
        fn no_marker_is_not_a_task() {
            for text in ["plain link", "mail a@b.com", "x@2023-09-12", "v1.2 release", "x+@"] {
                assert_eq!(parse_task(text), Ok(None), "{text}");
            }
        }

        #[test]
        fn invalid_calendar_dates_are_errors() {
            assert!(matches!(
                parse_task("x+@2023-13-01"),
                Err(TaskError::InvalidDate {
                    which: Boundary::Start,
                    ..
                })
            ));
            assert!(matches!(
                parse_task("x+@2023-02-30"),
                Err(TaskError::InvalidDate { .. })
            ));
            assert!(matches!(
                parse_task("x+@2023-09-12T10:00/25:00"),
                Err(TaskError::InvalidDate {
                    which: Boundary::End,
                    ..
                })
            ));
        }

        #[test]
        fn end_before_start_is_a_range_error() {
            assert!(matches!(
                parse_task("x+@2023-09-12T10:00/09:00"),
                Err(TaskError::TaskRange { .. })
            ));
            assert!(matches!(
                parse_task("x+@2023-09-12/11"),
                Err(TaskError::TaskRange { .. })
            ));
            assert!(matches!(
                parse_task("x+@13/12"),
                Err(TaskError::TaskRange { .. })
            ));
            // A bare end date on the start's own day is not "before" a timed start.
            assert!(parse_task("x+@2023-09-12T10:00/2023-09-12").is_ok());
        }

        // Legacy behaviour kept on purpose: ✅/❌ at the very start forces `done`.
        #[test]
        fn legacy_check_mark_forces_done() {
            assert_eq!(task("\u{2705}review+@2023-09-12").status, Status::Done);
            assert_eq!(task("\u{274C}review!@2023-09-12").status, Status::Done);
            assert_eq!(task("\u{FE0F}\u{2705}review+@2023-09-12").status, Status::Done);
            assert_eq!(task("review \u{2705}+@2023-09-12").status, Status::Todo);
        }
    }
}

pub mod event {
    //! A second `@start[/end|Dminutes]` marker layered on top of a task marker.
    //!
    //! Unlike the task grammar, the event specifier inherits whatever it omits from the task
    //! written next to it.

    use crate::core::*;
    use crate::parser::{EndSpec, event_marker, find_marker, parse_task, splice_out};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Parsed {
        Task(TaskLink),
        Event(Event),
    }

    /// Parse link text into an event, falling back to the bare task when there is no event
    /// specifier. `Ok(None)` for text with neither.
    pub fn parse_event(text: &str) -> Result<Option<Parsed>, TaskError> {
        let task = parse_task(text)?;
        let rest = task.as_ref().map_or(text, |t| t.name.as_str());
        let Some((span, marker)) = find_marker(rest, "@", event_marker) else {
            return Ok(task.map(Parsed::Task));
        };
        let name = splice_out(rest, span);

        let start = resolve_start(&marker.start, task.as_ref())?;
        if !start.is_valid() {
            return Err(TaskError::InvalidDate {
                which: Boundary::Start,
                value: start.to_string(),
            });
        }
        let end = resolve_end(marker.end, start, task.as_ref())?;
        if !end.is_valid() {
            return Err(TaskError::InvalidDate {
                which: Boundary::End,
                value: end.to_string(),
            });
        }
        if end < start {
            return Err(TaskError::TaskRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        tracing::trace!(%start, %end, name = %name, "resolved event");
        // The co-located task carries the same name, without either marker.
        let task = task.map(|t| TaskLink {
            name: name.clone(),
            ..t
        });
        Ok(Some(Parsed::Event(Event {
            name,
            start,
            end,
            task,
            raw: text.to_string(),
        })))
    }

    /// Each field comes from the specifier when written, else from the task's start when it
    /// has that field.
    fn resolve_start(spec: &DateSpec, task: Option<&TaskLink>) -> Result<LocalDateTime, TaskError> {
        let base = task.map(|t| t.start).unwrap_or_default();
        let merged = spec.inherit(&base);
        merged.local_date_time().ok_or(TaskError::LackDate {
            which: Boundary::Start,
            field: merged.first_missing().unwrap_or(DateField::Hours),
        })
    }

    /// End precedence: explicit clock time, explicit duration, explicit or task-side end date,
    /// then the task's duration.
    fn resolve_end(
        end: Option<EndSpec>,
        start: LocalDateTime,
        task: Option<&TaskLink>,
    ) -> Result<LocalDateTime, TaskError> {
        let explicit = match end {
            Some(EndSpec::Minutes(minutes)) => return add_minutes(start, minutes),
            Some(EndSpec::At(spec)) => Some(spec),
            None => task.and_then(|t| t.end),
        };
        if let Some(spec) = explicit {
            let dated = spec.inherit(&DateSpec::from(start));
            return dated.local_date_time().ok_or(TaskError::LackDate {
                which: Boundary::End,
                field: dated.first_missing().unwrap_or(DateField::Hours),
            });
        }
        match task.and_then(|t| t.duration) {
            Some(minutes) => add_minutes(start, minutes),
            None => Err(TaskError::LackDate {
                which: Boundary::End,
                field: DateField::Hours,
            }),
        }
    }

    fn add_minutes(start: LocalDateTime, minutes: u32) -> Result<LocalDateTime, TaskError> {
        start
            .add_minutes(i64::from(minutes))
            .ok_or_else(|| TaskError::InvalidDate {
                which: Boundary::Start,
                value: start.to_string(),
            })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn event(text: &str) -> Event {
            match parse_event(text) {
                Ok(Some(Parsed::Event(e))) => e,
                other => panic!("expected event from {:?}, got {:?}", text, other),
            }
        }

        #[test]
        fn day_of_month_inherits_year_month_and_time_from_task() {
            let e = event("name~@2023-09-12T12:50D10@13");
            assert_eq!(e.name, "name");
            assert_eq!(e.start, LocalDate::new(2023, 9, 13).at(12, 50));
            assert_eq!(e.end, LocalDate::new(2023, 9, 13).at(13, 0));
            let task = e.task.expect("co-located task");
            assert_eq!(task.status, Status::UpDown);
            assert_eq!(task.duration, Some(10));
            assert_eq!(task.name, "name");
        }

        #[test]
        fn co_located_task_name_omits_event_specifier() {
            let e = event("x+@2023-09-12T10:00/11:00@13/14:00");
            assert_eq!(e.name, "x");
            assert_eq!(e.start, LocalDate::new(2023, 9, 13).at(10, 0));
            assert_eq!(e.end, LocalDate::new(2023, 9, 13).at(14, 0));
            let task = e.task.expect("co-located task");
            assert_eq!(task.name, "x");
            assert_eq!(task.raw, "x+@2023-09-12T10:00/11:00@13/14:00");
        }

        #[test]
        fn time_only_takes_the_task_date() {
            let e = event("meet+@2023-09-12@10:00/11:30");
            assert_eq!(e.start, LocalDate::new(2023, 9, 12).at(10, 0));
            assert_eq!(e.end, LocalDate::new(2023, 9, 12).at(11, 30));
            assert_eq!(e.name, "meet");
        }

        #[test]
        fn explicit_duration_suffix() {
            let e = event("call @2023-09-12T23:30D45");
            assert_eq!(e.start, LocalDate::new(2023, 9, 12).at(23, 30));
            assert_eq!(e.end, LocalDate::new(2023, 9, 13).at(0, 15));
            assert!(e.task.is_none());
            assert_eq!(e.duration_minutes(), Some(45));
        }

        #[test]
        fn explicit_end_date_fills_time_from_start() {
            let e = event("trip @2023-09-12T09:00/14");
            assert_eq!(e.end, LocalDate::new(2023, 9, 14).at(9, 0));
            let e = event("trip @2023-09-12T09:00/09-14T18:00");
            assert_eq!(e.end, LocalDate::new(2023, 9, 14).at(18, 0));
        }

        #[test]
        fn task_end_is_used_when_event_has_none() {
            let e = event("x+@2023-09-12T10:00/11:00@14T10:00");
            assert_eq!(e.start, LocalDate::new(2023, 9, 14).at(10, 0));
            assert_eq!(e.end, LocalDate::new(2023, 9, 14).at(11, 0));
        }

        #[test]
        fn missing_fields_name_the_first_gap() {
            assert_eq!(
                parse_event("x @13T10:00/11:00"),
                Err(TaskError::LackDate {
                    which: Boundary::Start,
                    field: DateField::Year
                })
            );
            assert_eq!(
                parse_event("x+@09-12 @10:00/11:00"),
                Err(TaskError::LackDate {
                    which: Boundary::Start,
                    field: DateField::Year
                })
            );
            assert_eq!(
                parse_event("x+@2023-09-12 @13"),
                Err(TaskError::LackDate {
                    which: Boundary::Start,
                    field: DateField::Hours
                })
            );
            assert_eq!(
                parse_event("x @2023-09-12T10:00"),
                Err(TaskError::LackDate {
                    which: Boundary::End,
                    field: DateField::Hours
                })
            );
        }

        #[test]
        fn invalid_resolved_dates_name_the_boundary() {
            assert!(matches!(
                parse_event("x+@2023-02-12T10:00D5@30"),
                Err(TaskError::InvalidDate {
                    which: Boundary::Start,
                    ..
                })
            ));
            assert!(matches!(
                parse_event("x @2023-09-12T10:00/31"),
                Err(TaskError::InvalidDate {
                    which: Boundary::End,
                    ..
                })
            ));
        }

        #[test]
        fn end_before_start_is_rejected() {
            assert!(matches!(
                parse_event("x @2023-09-12T10:00/09:00"),
                Err(TaskError::TaskRange { .. })
            ));
        }

        #[test]
        fn falls_back_to_task_or_nothing() {
            assert!(matches!(
                parse_event("x+@2023-09-12"),
                Ok(Some(Parsed::Task(_)))
            ));
            assert_eq!(parse_event("just a link"), Ok(None));
            assert!(parse_event("x+@2023-13-12@10:00").is_err());
        }
    }
}

pub mod format {
    //! Rendering of partial dates and task markers back to text.

    use crate::core::*;
    use std::fmt;

    impl fmt::Display for DateSpec {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let dated = match (self.year, self.month, self.date) {
                (Some(y), Some(m), Some(d)) => {
                    write!(f, "{:04}-{:02}-{:02}", y, m, d)?;
                    true
                }
                (_, Some(m), Some(d)) => {
                    write!(f, "{:02}-{:02}", m, d)?;
                    true
                }
                (_, _, Some(d)) => {
                    write!(f, "{:02}", d)?;
                    true
                }
                _ => false,
            };
            if let Some(t) = self.time {
                if dated {
                    f.write_str("T")?;
                }
                write!(f, "{:02}:{:02}", t.hours, t.minutes)?;
            }
            Ok(())
        }
    }

    /// `{name}{symbol}{speed}@{start}` followed by `/{end}` or `D{minutes}`.
    pub fn format_task(task: &TaskLink) -> String {
        let mut buf = String::new();
        buf.push_str(&task.name);
        buf.push(task.status.symbol());
        if let Some(speed) = task.speed {
            buf.push_str(&speed.to_string());
        }
        buf.push('@');
        buf.push_str(&task.start.to_string());
        if let Some(end) = &task.end {
            buf.push('/');
            buf.push_str(&end.to_string());
        } else if let Some(minutes) = task.duration {
            buf.push_str(&format!("D{}", minutes));
        }
        buf
    }

}

pub mod freshness {
    //! Urgency ("freshness") of a task at a given instant. Higher is more pressing;
    //! `-inf` means the task should not be shown at all.

    use crate::config::SpeedTable;
    use crate::core::*;
    use chrono::NaiveDateTime;
    use std::f64::consts::TAU;

    const MILLIS_PER_DAY: f64 = 86_400_000.0;

    /// Score with the default per-status speeds.
    pub fn freshness(task: &TaskLink, now: NaiveDateTime) -> f64 {
        freshness_with(task, now, &SpeedTable::default())
    }

    /// Elapsed time is measured in fractional days from local midnight of the start day.
    /// Tasks whose start has no complete date are never shown.
    pub fn freshness_with(task: &TaskLink, now: NaiveDateTime, speeds: &SpeedTable) -> f64 {
        let Some(first_day) = task.start.local_date() else {
            return f64::NEG_INFINITY;
        };
        let Some(origin) = first_day.start_of_day() else {
            return f64::NEG_INFINITY;
        };
        let elapsed = elapsed_days(origin, now);
        let speed = f64::from(
            task.speed
                .or_else(|| speeds.for_status(task.status))
                .unwrap_or(1),
        );

        match task.status {
            Status::Schedule => {
                let last_day = task
                    .end
                    .and_then(|end| end.inherit(&task.start).local_date())
                    .filter(|d| *d >= first_day)
                    .unwrap_or(first_day);
                window_score(first_day, last_day, now)
            }
            Status::Done => f64::NEG_INFINITY,
            Status::Deadline => {
                if elapsed < -speed {
                    f64::NEG_INFINITY
                } else {
                    elapsed
                }
            }
            Status::Todo => {
                if elapsed < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    (elapsed - speed).min(0.0)
                }
            }
            Status::Note => {
                if elapsed < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    -elapsed / speed.max(1.0)
                }
            }
            Status::UpDown => {
                if elapsed < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    let period = speed.max(1.0);
                    period * ((TAU * elapsed / period).cos() - 1.0)
                }
            }
        }
    }

    /// `0` from midnight of `first_day` until midnight after `last_day`, `-inf` otherwise.
    pub fn window_score(first_day: LocalDate, last_day: LocalDate, now: NaiveDateTime) -> f64 {
        let open = first_day.start_of_day();
        let close = last_day.add_days(1).and_then(|d| d.start_of_day());
        match (open, close) {
            (Some(open), Some(close)) if open <= now && now < close => 0.0,
            _ => f64::NEG_INFINITY,
        }
    }

    fn elapsed_days(origin: NaiveDateTime, now: NaiveDateTime) -> f64 {
        (now - origin).num_milliseconds() as f64 / MILLIS_PER_DAY
    }

}

pub mod sort {
    //! Agenda ordering: freshness descending, then status rank descending, then start
    //! ascending. Each key is a total order, so the combination is a strict weak ordering.

    use crate::config::SpeedTable;
    use crate::core::*;
    use crate::freshness::{freshness_with, window_score};
    use chrono::NaiveDateTime;
    use std::cmp::{Ordering, Reverse};

    /// Something that can be placed on an agenda.
    pub trait Agendable {
        fn status(&self) -> Status;
        /// `None` for undated entries, which sort after dated ones.
        fn start(&self) -> Option<NaiveDateTime>;
        fn freshness(&self, now: NaiveDateTime, speeds: &SpeedTable) -> f64;
    }

    impl Agendable for TaskLink {
        fn status(&self) -> Status {
            self.status
        }

        fn start(&self) -> Option<NaiveDateTime> {
            self.start.moment().and_then(|m| m.to_naive())
        }

        fn freshness(&self, now: NaiveDateTime, speeds: &SpeedTable) -> f64 {
            freshness_with(self, now, speeds)
        }
    }

    /// Events rank as schedules: visible on every day they touch.
    impl Agendable for Event {
        fn status(&self) -> Status {
            Status::Schedule
        }

        fn start(&self) -> Option<NaiveDateTime> {
            self.start.to_naive()
        }

        fn freshness(&self, now: NaiveDateTime, _speeds: &SpeedTable) -> f64 {
            window_score(self.start.local_date(), self.end.local_date(), now)
        }
    }

    impl Agendable for crate::event::Parsed {
        fn status(&self) -> Status {
            match self {
                Self::Task(t) => t.status(),
                Self::Event(e) => e.status(),
            }
        }

        fn start(&self) -> Option<NaiveDateTime> {
            match self {
                Self::Task(t) => Agendable::start(t),
                Self::Event(e) => Agendable::start(e),
            }
        }

        fn freshness(&self, now: NaiveDateTime, speeds: &SpeedTable) -> f64 {
            match self {
                Self::Task(t) => t.freshness(now, speeds),
                Self::Event(e) => e.freshness(now, speeds),
            }
        }
    }

    fn key<T: Agendable>(
        item: &T,
        now: NaiveDateTime,
        speeds: &SpeedTable,
    ) -> (Reverse<TotalF64>, Reverse<u8>, (bool, Option<NaiveDateTime>)) {
        let start = item.start();
        (
            Reverse(TotalF64(item.freshness(now, speeds))),
            Reverse(item.status().rank()),
            (start.is_none(), start),
        )
    }

    /// `Less` means `a` goes first.
    pub fn compare<T: Agendable>(a: &T, b: &T, now: NaiveDateTime, speeds: &SpeedTable) -> Ordering {
        key(a, now, speeds).cmp(&key(b, now, speeds))
    }

    /// Stable sort; each item is scored once.
    pub fn sort_agenda<T: Agendable>(items: &mut Vec<T>, now: NaiveDateTime, speeds: &SpeedTable) {
        let mut keyed: Vec<_> = items
            .drain(..)
            .map(|item| (key(&item, now, speeds), item))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
        items.extend(keyed.into_iter().map(|(_, item)| item));
    }

    /// `f64` under IEEE total ordering.
    #[derive(Debug, Clone, Copy)]
    struct TotalF64(f64);

    impl PartialEq for TotalF64 {
        fn eq(&self, other: &Self) -> bool {
            self.cmp(other) == Ordering::Equal
        }
    }

    impl Eq for TotalF64 {}

    impl PartialOrd for TotalF64 {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for TotalF64 {
        fn cmp(&self, other: &Self) -> Ordering {
            self.0.total_cmp(&other.0)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_task;
        use chrono::NaiveDate;

        fn task(text: &str) -> TaskLink {
            parse_task(text).expect("parse").expect("task")
        }

        fn now() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2023, 9, 20)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()
        }

        #[test]
        fn fresher_first_then_rank_then_start() {
            let mut items = vec![
                task("old note-@2023-09-10"),
                task("overdue!@2023-09-18"),
                task("later todo+@2023-09-15"),
                task("earlier todo+@2023-09-01"),
                task("finished.@2023-09-19"),
                task("today@@2023-09-20"),
            ];
            sort_agenda(&mut items, now(), &SpeedTable::default());
            let names: Vec<_> = items.iter().map(|t| t.name.as_str()).collect();
            assert_eq!(
                names,
                vec![
                    "overdue",
                    "today",
                    "earlier todo",
                    "later todo",
                    "old note",
                    "finished"
                ]
            );
        }

        #[test]
        fn equal_freshness_breaks_ties_by_rank() {
            let speeds = SpeedTable::default();
            let schedule = task("a@@2023-09-20");
            let todo = task("b+@2023-09-01");
            assert_eq!(schedule.freshness(now(), &speeds), 0.0);
            assert_eq!(todo.freshness(now(), &speeds), 0.0);
            assert_eq!(compare(&schedule, &todo, now(), &speeds), Ordering::Less);
            assert_eq!(compare(&todo, &schedule, now(), &speeds), Ordering::Greater);
        }

        #[test]
        fn ordering_is_transitive_and_antisymmetric() {
            let speeds = SpeedTable::default();
            let items = vec![
                task("a!@2023-09-18"),
                task("b@@2023-09-20"),
                task("c+@2023-09-01"),
                task("d+@2023-09-16"),
                task("e-@2023-09-19"),
                task("f~@2023-09-05"),
                task("g.@2023-09-20"),
                task("h+@12"),
                task("i.@2023-09-01"),
            ];
            for a in &items {
                for b in &items {
                    let ab = compare(a, b, now(), &speeds);
                    assert_eq!(ab, compare(b, a, now(), &speeds).reverse());
                    for c in &items {
                        if ab == Ordering::Less && compare(b, c, now(), &speeds) == Ordering::Less {
                            assert_eq!(compare(a, c, now(), &speeds), Ordering::Less);
                        }
                    }
                }
            }
        }

        #[test]
        fn events_sort_as_schedules() {
            let event = Event {
                name: "meeting".into(),
                start: LocalDate::new(2023, 9, 20).at(13, 0),
                end: LocalDate::new(2023, 9, 20).at(14, 0),
                task: None,
                raw: "meeting @2023-09-20T13:00/14:00".into(),
            };
            assert_eq!(event.freshness(now(), &SpeedTable::default()), 0.0);
            assert_eq!(Agendable::status(&event), Status::Schedule);
        }
    }
}

pub mod recurrence {
    //! Wildcard date rules that materialise a concrete occurrence on matching days.
    //!
    //! Text form: `name[{symbol}[{speed}]]@{YYYY|*}-{MM|*}-{DD|*|Sun..Sat}Thh:mm[D{minutes}]`.
    //! A rule with a status symbol produces tasks; without one it produces events.

    use crate::core::*;
    use crate::format::format_task;
    use crate::parser::{PResult, find_marker, number, splice_out};
    use chrono::{Datelike, NaiveDate, Weekday};
    use nom::{
        branch::alt,
        bytes::complete::take_while_m_n,
        character::complete::{char, digit1, one_of},
        combinator::{map, map_res, opt, value},
        sequence::{preceded, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Field<T> {
        Any,
        Is(T),
    }

    impl<T: PartialEq> Field<T> {
        pub fn matches(&self, value: &T) -> bool {
            match self {
                Self::Any => true,
                Self::Is(v) => v == value,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum DayField {
        Any,
        Day(u32),
        Weekday(Weekday),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RecurrenceRule {
        pub name: String,
        pub year: Field<i32>,
        pub month: Field<u32>,
        pub date: DayField,
        pub hours: u32,
        pub minutes: u32,
        /// Minutes.
        pub duration: u32,
        pub status: Option<Status>,
        pub speed: Option<u32>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Occurrence {
        Task(TaskLink),
        Event(Event),
    }

    impl RecurrenceRule {
        pub fn fires_on(&self, date: NaiveDate) -> bool {
            let day_matches = match self.date {
                DayField::Any => true,
                DayField::Day(d) => date.day() == d,
                DayField::Weekday(w) => date.weekday() == w,
            };
            self.year.matches(&date.year()) && self.month.matches(&date.month()) && day_matches
        }

        /// The occurrence on `date`, or `None` when the rule does not fire there.
        pub fn matches_on(&self, date: NaiveDate) -> Option<Occurrence> {
            if !self.fires_on(date) {
                return None;
            }
            let start = LocalDate::from(date).at(self.hours, self.minutes);
            if !start.is_valid() {
                return None;
            }
            match self.status {
                Some(status) => {
                    let mut task = TaskLink {
                        name: self.name.clone(),
                        status,
                        speed: self.speed,
                        start: DateSpec::from(start),
                        end: None,
                        duration: Some(self.duration),
                        raw: String::new(),
                    };
                    task.raw = format_task(&task);
                    Some(Occurrence::Task(task))
                }
                None => Some(Occurrence::Event(Event {
                    name: self.name.clone(),
                    start,
                    end: start.add_minutes(i64::from(self.duration))?,
                    task: None,
                    raw: self.to_string(),
                })),
            }
        }
    }

    pub fn matches_on(rule: &RecurrenceRule, date: NaiveDate) -> Option<Occurrence> {
        rule.matches_on(date)
    }

    /// `Ok(None)` when the text carries no rule.
    pub fn parse_rule(text: &str) -> Result<Option<RecurrenceRule>, TaskError> {
        let Some((span, marker)) = find_marker(text, Status::SYMBOLS, rule_marker) else {
            return Ok(None);
        };
        let RuleMarker {
            status,
            speed,
            year,
            month,
            date,
            time,
            duration,
        } = marker;

        let invalid = || TaskError::InvalidDate {
            which: Boundary::Start,
            value: text[span.clone()].to_string(),
        };
        if matches!(month, Field::Is(m) if !(1..=12).contains(&m))
            || matches!(date, DayField::Day(d) if !(1..=31).contains(&d))
            || time.hours > 23
            || time.minutes > 59
        {
            return Err(invalid());
        }

        Ok(Some(RecurrenceRule {
            name: splice_out(text, span.clone()),
            year,
            month,
            date,
            hours: time.hours,
            minutes: time.minutes,
            duration: duration.unwrap_or(0),
            status,
            speed,
        }))
    }

    impl fmt::Display for RecurrenceRule {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.name)?;
            if let Some(status) = self.status {
                write!(f, "{}", status.symbol())?;
                if let Some(speed) = self.speed {
                    write!(f, "{}", speed)?;
                }
            }
            f.write_str("@")?;
            match self.year {
                Field::Any => f.write_str("*")?,
                Field::Is(y) => write!(f, "{:04}", y)?,
            }
            match self.month {
                Field::Any => f.write_str("-*")?,
                Field::Is(m) => write!(f, "-{:02}", m)?,
            }
            match self.date {
                DayField::Any => f.write_str("-*")?,
                DayField::Day(d) => write!(f, "-{:02}", d)?,
                DayField::Weekday(w) => write!(f, "-{}", w)?,
            }
            write!(f, "T{:02}:{:02}", self.hours, self.minutes)?;
            if self.duration > 0 {
                write!(f, "D{}", self.duration)?;
            }
            Ok(())
        }
    }

    /* ------------------------------ Grammar ------------------------------ */

    struct RuleMarker {
        status: Option<Status>,
        speed: Option<u32>,
        year: Field<i32>,
        month: Field<u32>,
        date: DayField,
        time: TimeOfDay,
        duration: Option<u32>,
    }

    fn rule_marker(i: &str) -> PResult<'_, RuleMarker> {
        let status_prefix = map(
            tuple((
                map_res(one_of(Status::SYMBOLS), |c| {
                    Status::from_symbol(c).ok_or("unknown status")
                }),
                opt(map_res(digit1, |s: &str| s.parse::<u32>())),
                char('@'),
            )),
            |(status, speed, _)| (Some(status), speed),
        );
        let (i, (status, speed)) = alt((status_prefix, value((None, None), char('@'))))(i)?;
        let (i, (year, _, month, _, date, _, hours, _, minutes, duration)) = tuple((
            alt((
                value(Field::Any, char('*')),
                map(number(4, 4), |y| Field::Is(y as i32)),
            )),
            char('-'),
            alt((value(Field::Any, char('*')), map(number(1, 2), Field::Is))),
            char('-'),
            day_field,
            char('T'),
            number(2, 2),
            char(':'),
            number(2, 2),
            opt(preceded(char('D'), map_res(digit1, |s: &str| s.parse::<u32>()))),
        ))(i)?;
        Ok((
            i,
            RuleMarker {
                status,
                speed,
                year,
                month,
                date,
                time: TimeOfDay::new(hours, minutes),
                duration,
            },
        ))
    }

    fn day_field(i: &str) -> PResult<'_, DayField> {
        alt((
            value(DayField::Any, char('*')),
            map(number(1, 2), DayField::Day),
            map_res(take_while_m_n(3, 3, |c: char| c.is_ascii_alphabetic()), |s: &str| {
                s.parse::<Weekday>().map(DayField::Weekday)
            }),
        ))(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn rule(text: &str) -> RecurrenceRule {
            parse_rule(text).expect("parse").expect("rule")
        }

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn weekday_rule_fires_only_on_that_weekday() {
            let r = rule("review@*-*-SunT12:30D45");
            assert_eq!(r.date, DayField::Weekday(Weekday::Sun));
            let mut fired = 0;
            let mut date = day(2023, 1, 1);
            while date < day(2024, 1, 1) {
                match r.matches_on(date) {
                    Some(Occurrence::Event(e)) => {
                        assert_eq!(date.weekday(), Weekday::Sun);
                        assert_eq!(e.start, LocalDate::from(date).at(12, 30));
                        assert_eq!(e.end, LocalDate::from(date).at(13, 15));
                        fired += 1;
                    }
                    Some(other) => panic!("expected event, got {:?}", other),
                    None => assert_ne!(date.weekday(), Weekday::Sun),
                }
                date = date.succ_opt().unwrap();
            }
            assert_eq!(fired, 53);
        }

        #[test]
        fn concrete_fields_must_all_match() {
            let r = rule("rent+@*-*-25T09:00D30");
            assert!(r.fires_on(day(2023, 9, 25)));
            assert!(!r.fires_on(day(2023, 9, 24)));
            let yearly = rule("birthday@*-03-14T00:00");
            assert!(yearly.fires_on(day(2030, 3, 14)));
            assert!(!yearly.fires_on(day(2030, 4, 14)));
            let once = rule("launch@2024-*-*T08:00");
            assert!(once.fires_on(day(2024, 7, 1)));
            assert!(!once.fires_on(day(2025, 7, 1)));
        }

        #[test]
        fn status_rules_produce_tasks() {
            let r = rule("rent+3@*-*-25T09:00D30");
            match r.matches_on(day(2023, 9, 25)) {
                Some(Occurrence::Task(t)) => {
                    assert_eq!(t.name, "rent");
                    assert_eq!(t.status, Status::Todo);
                    assert_eq!(t.speed, Some(3));
                    assert_eq!(t.duration, Some(30));
                    assert_eq!(
                        t.start.local_date_time(),
                        Some(LocalDate::new(2023, 9, 25).at(9, 0))
                    );
                    assert_eq!(t.raw, "rent+3@2023-09-25T09:00D30");
                }
                other => panic!("expected task, got {:?}", other),
            }
        }

        #[test]
        fn day_31_skips_short_months() {
            let r = rule("close books@*-*-31T17:00D60");
            assert!(r.matches_on(day(2023, 9, 30)).is_none());
            assert!(r.matches_on(day(2023, 10, 31)).is_some());
        }

        #[test]
        fn displays_in_rule_syntax() {
            for text in ["review@*-*-SunT12:30D45", "rent+3@*-*-25T09:00D30", "x@@2024-03-*T08:00"] {
                assert_eq!(rule(text).to_string(), text);
            }
        }

        #[test]
        fn rejects_out_of_range_fields() {
            assert!(matches!(
                parse_rule("x@*-13-*T08:00"),
                Err(TaskError::InvalidDate { .. })
            ));
            assert!(matches!(
                parse_rule("x@*-*-*T24:00"),
                Err(TaskError::InvalidDate { .. })
            ));
            assert_eq!(parse_rule("x@*-*-FooT08:00"), Ok(None));
            assert_eq!(parse_rule("plain title"), Ok(None));
        }
    }
}

pub mod crawler {
    //! Expands recurrence rules found in page titles and links for a single day.

    use crate::core::TaskError;
    use crate::recurrence::{Occurrence, parse_rule};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    /// One page as supplied by the crawling collaborator.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CrawledPage {
        pub title: String,
        #[serde(default)]
        pub links: Vec<String>,
        pub project: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Found {
        pub project: String,
        /// The title or link text the rule was read from.
        pub source: String,
        pub occurrence: Occurrence,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Skipped {
        pub project: String,
        pub source: String,
        pub error: TaskError,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct CrawlResult {
        pub found: Vec<Found>,
        pub skipped: Vec<Skipped>,
    }

    /// Titles and links are considered once each, compared case-insensitively; the first
    /// page mentioning a text decides its project. A malformed rule never stops the crawl.
    pub fn crawl<'a>(
        pages: impl IntoIterator<Item = &'a CrawledPage>,
        date: NaiveDate,
    ) -> CrawlResult {
        let mut candidates: IndexMap<String, (&'a str, &'a str)> = IndexMap::new();
        for page in pages {
            for text in std::iter::once(&page.title).chain(page.links.iter()) {
                candidates
                    .entry(text.to_lowercase())
                    .or_insert((page.project.as_str(), text.as_str()));
            }
        }
        tracing::debug!(candidates = candidates.len(), %date, "crawling recurrence rules");

        let mut result = CrawlResult::default();
        for (_, (project, source)) in candidates {
            match parse_rule(source) {
                Ok(Some(rule)) => {
                    if let Some(occurrence) = rule.matches_on(date) {
                        result.found.push(Found {
                            project: project.to_string(),
                            source: source.to_string(),
                            occurrence,
                        });
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%error, source, project, "skipping malformed recurrence rule");
                    result.skipped.push(Skipped {
                        project: project.to_string(),
                        source: source.to_string(),
                        error,
                    });
                }
            }
        }
        result
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn page(title: &str, links: &[&str], project: &str) -> CrawledPage {
            CrawledPage {
                title: title.into(),
                links: links.iter().map(|s| s.to_string()).collect(),
                project: project.into(),
            }
        }

        #[test]
        fn duplicates_are_expanded_once() {
            let pages = vec![
                page("Review@*-*-SunT12:30D45", &["gym@*-*-*T07:00D60"], "home"),
                page("notes", &["review@*-*-SunT12:30D45", "GYM@*-*-*T07:00D60"], "work"),
            ];
            let sunday = NaiveDate::from_ymd_opt(2023, 9, 17).unwrap();
            let result = crawl(&pages, sunday);
            assert_eq!(result.found.len(), 2);
            assert!(result.found.iter().all(|f| f.project == "home"));
            assert_eq!(result.found[0].source, "Review@*-*-SunT12:30D45");
        }

        #[test]
        fn malformed_rules_are_skipped_not_fatal() {
            let pages = vec![
                page("broken@*-14-*T07:00", &[], "home"),
                page("daily@*-*-*T07:00D15", &[], "home"),
            ];
            let day = NaiveDate::from_ymd_opt(2023, 9, 18).unwrap();
            let result = crawl(&pages, day);
            assert_eq!(result.found.len(), 1);
            assert_eq!(result.skipped.len(), 1);
            assert_eq!(result.skipped[0].source, "broken@*-14-*T07:00");
        }
    }
}

pub mod document {
    //! Line-oriented access to a note. The engine only sees text lines and indices; storage
    //! belongs to whoever implements `DocumentSource`.

    use crate::core::TaskError;
    use crate::event::{Parsed, parse_event};
    use crate::line::{TaskLine, parse_task_line};
    use crate::parser::PResult;
    use nom::{
        bytes::complete::{take_till1, take_until},
        character::complete::{anychar, char},
        sequence::delimited,
    };
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Line {
        pub id: String,
        pub text: String,
    }

    impl Line {
        pub fn new(text: impl Into<String>) -> Self {
            Self {
                id: Uuid::new_v4().to_string(),
                text: text.into(),
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum DocumentError {
        #[error("line range {start}..{end} is out of bounds (document has {len} lines)")]
        OutOfRange { start: usize, end: usize, len: usize },
        #[error("line {0} is not a task line")]
        NotATaskLine(usize),
    }

    pub trait DocumentSource {
        fn line(&self, index: usize) -> Option<&str>;
        fn lines(&self) -> Vec<Line>;
        /// Replace lines `start..end` with `text`, which may span several lines.
        fn replace_lines(&mut self, start: usize, end: usize, text: &str)
        -> Result<(), DocumentError>;
        fn insert_line(&mut self, index: usize, text: &str) -> Result<(), DocumentError>;
    }

    /// In-memory document.
    #[derive(Debug, Clone, Default)]
    pub struct LineBuffer {
        lines: Vec<Line>,
    }

    impl LineBuffer {
        pub fn from_text(text: &str) -> Self {
            Self {
                lines: text.lines().map(Line::new).collect(),
            }
        }

        pub fn text(&self) -> String {
            self.lines
                .iter()
                .map(|l| l.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        }

        pub fn len(&self) -> usize {
            self.lines.len()
        }

        pub fn is_empty(&self) -> bool {
            self.lines.is_empty()
        }
    }

    impl DocumentSource for LineBuffer {
        fn line(&self, index: usize) -> Option<&str> {
            self.lines.get(index).map(|l| l.text.as_str())
        }

        fn lines(&self) -> Vec<Line> {
            self.lines.clone()
        }

        fn replace_lines(
            &mut self,
            start: usize,
            end: usize,
            text: &str,
        ) -> Result<(), DocumentError> {
            if start > end || end > self.lines.len() {
                return Err(DocumentError::OutOfRange {
                    start,
                    end,
                    len: self.lines.len(),
                });
            }
            self.lines.splice(start..end, text.split('\n').map(Line::new));
            Ok(())
        }

        fn insert_line(&mut self, index: usize, text: &str) -> Result<(), DocumentError> {
            self.replace_lines(index, index, text)
        }
    }

    /* ------------------------------- Scanning ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LineItem {
        TaskLine(TaskLine),
        Link {
            text: String,
            parsed: Result<Parsed, TaskError>,
        },
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ScannedLine {
        pub index: usize,
        pub id: String,
        pub items: Vec<LineItem>,
    }

    impl ScannedLine {
        pub fn errors(&self) -> impl Iterator<Item = (&str, &TaskError)> {
            self.items.iter().filter_map(|item| match item {
                LineItem::Link {
                    text,
                    parsed: Err(e),
                } => Some((text.as_str(), e)),
                _ => None,
            })
        }
    }

    /// Scan every line for task lines and link markers. Lines carrying neither are left
    /// out; a malformed marker is recorded on its line and scanning continues.
    pub fn scan_lines(lines: &[Line]) -> Vec<ScannedLine> {
        let mut out = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            let items = scan_line(&line.text);
            if items.is_empty() {
                continue;
            }
            for item in &items {
                if let LineItem::Link {
                    text,
                    parsed: Err(error),
                } = item
                {
                    tracing::warn!(index, %error, link = %text, "treating malformed task as plain text");
                }
            }
            out.push(ScannedLine {
                index,
                id: line.id.clone(),
                items,
            });
        }
        tracing::debug!(lines = lines.len(), matched = out.len(), "scanned document");
        out
    }

    pub fn scan_document<D: DocumentSource + ?Sized>(doc: &D) -> Vec<ScannedLine> {
        scan_lines(&doc.lines())
    }

    fn scan_line(text: &str) -> Vec<LineItem> {
        if let Some(task) = parse_task_line(text) {
            return vec![LineItem::TaskLine(task)];
        }
        link_texts(text)
            .into_iter()
            .filter_map(|link| match parse_event(link) {
                Ok(None) => None,
                Ok(Some(parsed)) => Some(LineItem::Link {
                    text: link.to_string(),
                    parsed: Ok(parsed),
                }),
                Err(e) => Some(LineItem::Link {
                    text: link.to_string(),
                    parsed: Err(e),
                }),
            })
            .collect()
    }

    /// Contents of `[...]` links, skipping code spans and `[[...]]` emphasis.
    pub fn link_texts(mut i: &str) -> Vec<&str> {
        let mut out = Vec::new();
        while !i.is_empty() {
            if let Ok((rest, _)) = code_span(i) {
                i = rest;
                continue;
            }
            if i.starts_with("[[") {
                if let Ok((rest, _)) = take_until::<_, _, nom::error::VerboseError<&str>>("]]")(i) {
                    i = &rest[2..];
                    continue;
                }
            }
            if let Ok((rest, link)) = bracketed(i) {
                out.push(link);
                i = rest;
                continue;
            }
            match anychar::<_, nom::error::VerboseError<&str>>(i) {
                Ok((rest, _)) => i = rest,
                Err(_) => break,
            }
        }
        out
    }

    fn code_span(i: &str) -> PResult<'_, &str> {
        delimited(char('`'), take_until("`"), char('`'))(i)
    }

    fn bracketed(i: &str) -> PResult<'_, &str> {
        delimited(char('['), take_till1(|c| c == '[' || c == ']'), char(']'))(i)
    }

    /// Parse the task line at `index`, transform it, and write the result back in place.
    pub fn rewrite_task_line<D, F>(doc: &mut D, index: usize, edit: F) -> Result<TaskLine, DocumentError>
    where
        D: DocumentSource + ?Sized,
        F: FnOnce(&TaskLine) -> TaskLine,
    {
        let text = doc.line(index).ok_or_else(|| DocumentError::OutOfRange {
            start: index,
            end: index + 1,
            len: doc.lines().len(),
        })?;
        let task = parse_task_line(text).ok_or(DocumentError::NotATaskLine(index))?;
        let updated = edit(&task);
        doc.replace_lines(index, index + 1, &updated.to_string())?;
        Ok(updated)
    }

}

pub mod calendar {
    //! Reconciliation of derived events with an external calendar.
    //!
    //! Events are tagged with a scope key (project + page title); a sync makes the
    //! calendar's events under that scope equal to the desired set with as little churn as
    //! possible.

    use crate::core::Event;
    use chrono::NaiveDateTime;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ScopeKey {
        pub project: String,
        pub title: String,
    }

    impl fmt::Display for ScopeKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}/{}", self.project, self.title)
        }
    }

    /// An event as it should appear on the calendar.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DesiredEvent {
        /// Stable identifier chosen by the caller.
        pub key: String,
        pub title: String,
        pub start: NaiveDateTime,
        pub end: NaiveDateTime,
    }

    impl DesiredEvent {
        pub fn from_event(key: impl Into<String>, event: &Event) -> Option<Self> {
            Some(Self {
                key: key.into(),
                title: event.name.clone(),
                start: event.start.to_naive()?,
                end: event.end.to_naive()?,
            })
        }
    }

    /// An event as the calendar currently has it.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CalendarEvent {
        /// Calendar-side identifier.
        pub id: String,
        pub key: Option<String>,
        pub title: String,
        pub start: NaiveDateTime,
        pub end: NaiveDateTime,
    }

    impl CalendarEvent {
        fn same_content(&self, desired: &DesiredEvent) -> bool {
            self.title == desired.title && self.start == desired.start && self.end == desired.end
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "action", rename_all = "kebab-case")]
    pub enum SyncAction {
        Create(DesiredEvent),
        Update { id: String, event: DesiredEvent },
        Delete { id: String },
        Keep { id: String },
    }

    /// Pair existing entries with desired ones by key first, then pair the leftovers by
    /// position (rewriting them in place), and only create or delete for the difference.
    pub fn plan_sync(existing: &[CalendarEvent], desired: &[DesiredEvent]) -> Vec<SyncAction> {
        let mut by_key: IndexMap<&str, &CalendarEvent> = IndexMap::new();
        let mut loose: Vec<&CalendarEvent> = Vec::new();
        for e in existing {
            match e.key.as_deref() {
                Some(k) if !by_key.contains_key(k) => {
                    by_key.insert(k, e);
                }
                _ => loose.push(e),
            }
        }

        let mut actions = Vec::new();
        let mut unmatched: Vec<&DesiredEvent> = Vec::new();
        for d in desired {
            match by_key.shift_remove(d.key.as_str()) {
                Some(e) if e.same_content(d) => actions.push(SyncAction::Keep { id: e.id.clone() }),
                Some(e) => actions.push(SyncAction::Update {
                    id: e.id.clone(),
                    event: d.clone(),
                }),
                None => unmatched.push(d),
            }
        }

        let mut leftovers: Vec<&CalendarEvent> = by_key.into_values().collect();
        leftovers.extend(loose);
        // Restore calendar order so positional pairing is deterministic.
        leftovers.sort_by_key(|e| existing.iter().position(|x| std::ptr::eq(x, *e)));

        let mut leftovers = leftovers.into_iter();
        let mut unmatched = unmatched.into_iter();
        loop {
            match (leftovers.next(), unmatched.next()) {
                (Some(e), Some(d)) if e.same_content(d) => {
                    actions.push(SyncAction::Keep { id: e.id.clone() })
                }
                (Some(e), Some(d)) => actions.push(SyncAction::Update {
                    id: e.id.clone(),
                    event: d.clone(),
                }),
                (Some(e), None) => actions.push(SyncAction::Delete { id: e.id.clone() }),
                (None, Some(d)) => actions.push(SyncAction::Create(d.clone())),
                (None, None) => break,
            }
        }
        actions
    }

    #[derive(Debug, thiserror::Error)]
    pub enum CalendarError {
        #[error("calendar event {0} not found")]
        NotFound(String),
        #[error("calendar backend failed: {0}")]
        Backend(String),
    }

    /// The calendar service, reduced to what reconciliation needs.
    pub trait CalendarSink {
        fn list(&self, scope: &ScopeKey) -> Result<Vec<CalendarEvent>, CalendarError>;
        /// Returns the calendar-side id of the new event.
        fn create(&mut self, scope: &ScopeKey, event: &DesiredEvent)
        -> Result<String, CalendarError>;
        fn update(
            &mut self,
            scope: &ScopeKey,
            id: &str,
            event: &DesiredEvent,
        ) -> Result<(), CalendarError>;
        fn delete(&mut self, scope: &ScopeKey, id: &str) -> Result<(), CalendarError>;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SyncReport {
        pub created: usize,
        pub updated: usize,
        pub deleted: usize,
        pub unchanged: usize,
    }

    /// Make the calendar's events under `scope` match `events`, keyed by the paired ids.
    pub fn sync<S: CalendarSink + ?Sized>(
        sink: &mut S,
        scope: &ScopeKey,
        events: &[(String, Event)],
    ) -> Result<SyncReport, CalendarError> {
        let desired: Vec<DesiredEvent> = events
            .iter()
            .filter_map(|(key, event)| {
                let d = DesiredEvent::from_event(key.clone(), event);
                if d.is_none() {
                    tracing::warn!(key = %key, "skipping event with an invalid date");
                }
                d
            })
            .collect();
        let existing = sink.list(scope)?;

        let mut report = SyncReport::default();
        for action in plan_sync(&existing, &desired) {
            match action {
                SyncAction::Create(event) => {
                    let id = sink.create(scope, &event)?;
                    tracing::debug!(%scope, %id, title = %event.title, "created calendar event");
                    report.created += 1;
                }
                SyncAction::Update { id, event } => {
                    sink.update(scope, &id, &event)?;
                    tracing::debug!(%scope, %id, title = %event.title, "updated calendar event");
                    report.updated += 1;
                }
                SyncAction::Delete { id } => {
                    sink.delete(scope, &id)?;
                    tracing::debug!(%scope, %id, "deleted calendar event");
                    report.deleted += 1;
                }
                SyncAction::Keep { .. } => report.unchanged += 1,
            }
        }
        tracing::info!(%scope, ?report, "calendar synchronised");
        Ok(report)
    }

    /// Calendar held in memory, e.g. for dry runs.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryCalendar {
        events: IndexMap<String, (ScopeKey, CalendarEvent)>,
    }

    impl MemoryCalendar {
        pub fn events(&self) -> impl Iterator<Item = &CalendarEvent> {
            self.events.values().map(|(_, e)| e)
        }
    }

    impl CalendarSink for MemoryCalendar {
        fn list(&self, scope: &ScopeKey) -> Result<Vec<CalendarEvent>, CalendarError> {
            Ok(self
                .events
                .values()
                .filter(|(s, _)| s == scope)
                .map(|(_, e)| e.clone())
                .collect())
        }

        fn create(
            &mut self,
            scope: &ScopeKey,
            event: &DesiredEvent,
        ) -> Result<String, CalendarError> {
            let id = Uuid::new_v4().to_string();
            let entry = CalendarEvent {
                id: id.clone(),
                key: Some(event.key.clone()),
                title: event.title.clone(),
                start: event.start,
                end: event.end,
            };
            self.events.insert(id.clone(), (scope.clone(), entry));
            Ok(id)
        }

        fn update(
            &mut self,
            _scope: &ScopeKey,
            id: &str,
            event: &DesiredEvent,
        ) -> Result<(), CalendarError> {
            let (_, entry) = self
                .events
                .get_mut(id)
                .ok_or_else(|| CalendarError::NotFound(id.to_string()))?;
            entry.key = Some(event.key.clone());
            entry.title = event.title.clone();
            entry.start = event.start;
            entry.end = event.end;
            Ok(())
        }

        fn delete(&mut self, _scope: &ScopeKey, id: &str) -> Result<(), CalendarError> {
            self.events
                .shift_remove(id)
                .map(|_| ())
                .ok_or_else(|| CalendarError::NotFound(id.to_string()))
        }
    }

}

pub use crate::core::{Event, LocalDate, LocalDateTime, Status, TaskError, TaskLink};
pub use crate::event::{Parsed, parse_event};
pub use crate::format::format_task;
pub use crate::freshness::{freshness, freshness_with};
pub use crate::line::{TaskLine, parse_task_line};
pub use crate::parser::parse_task;
pub use crate::period::{Log, Period};
pub use crate::recurrence::{Occurrence, RecurrenceRule, parse_rule};
pub use crate::sort::{compare, sort_agenda};
