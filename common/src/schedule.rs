use std::{fmt, str::FromStr};

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [Self; 7] = [
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
        Self::Sun,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % 7]
    }

    /// ISO weekday number, Monday is 1.
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }

    pub fn from_number(number: u8) -> Option<Self> {
        (1..=7)
            .contains(&number)
            .then(|| Self::from_index(usize::from(number) - 1))
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mon => "mon",
            Self::Tue => "tue",
            Self::Wed => "wed",
            Self::Thu => "thu",
            Self::Fri => "fri",
            Self::Sat => "sat",
            Self::Sun => "sun",
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-empty set of weekdays, stored as a bitmask (bit 0 is Monday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const ALL: Self = Self(0b111_1111);

    pub fn from_days(days: impl IntoIterator<Item = DayOfWeek>) -> Result<Self, ConfigError> {
        let mask = days
            .into_iter()
            .fold(0u8, |mask, day| mask | (1 << day.index()));
        if mask == 0 {
            return Err(ConfigError::InvalidWeekdays(String::new()));
        }
        Ok(Self(mask))
    }

    pub fn from_numbers(numbers: &[u8]) -> Result<Self, ConfigError> {
        let invalid = || {
            let listed: Vec<String> = numbers.iter().map(u8::to_string).collect();
            ConfigError::InvalidWeekdays(listed.join(","))
        };
        let days = numbers
            .iter()
            .map(|number| DayOfWeek::from_number(*number).ok_or_else(invalid))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_days(days).map_err(|_| invalid())
    }

    pub fn contains(self, day: DayOfWeek) -> bool {
        self.0 & (1 << day.index()) != 0
    }

    pub fn iter(self) -> impl Iterator<Item = DayOfWeek> {
        DayOfWeek::ALL
            .into_iter()
            .filter(move |day| self.contains(*day))
    }
}

impl Default for WeekdaySet {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromStr for WeekdaySet {
    type Err = ConfigError;

    /// Accepts comma separated numbers and inclusive ranges: `"1-5"`, `"6,7"`,
    /// `"1-3,5"`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidWeekdays(raw.to_string());
        let parse_day = |token: &str| {
            token
                .trim()
                .parse::<u8>()
                .ok()
                .and_then(DayOfWeek::from_number)
                .ok_or_else(invalid)
        };

        let mut days = Vec::new();
        for token in raw.split(',') {
            match token.split_once('-') {
                Some((first, last)) => {
                    let (first, last) = (parse_day(first)?, parse_day(last)?);
                    if first > last {
                        return Err(invalid());
                    }
                    days.extend((first.index()..=last.index()).map(DayOfWeek::from_index));
                }
                None => days.push(parse_day(token)?),
            }
        }
        Self::from_days(days).map_err(|_| invalid())
    }
}

/// Comma separated short names, e.g. `mon,tue,wed`.
impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(DayOfWeek::as_str).collect();
        f.write_str(&names.join(","))
    }
}

impl Serialize for WeekdaySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(DayOfWeek::number))
    }
}

impl<'de> Deserialize<'de> for WeekdaySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Single(u8),
            Numbers(Vec<u8>),
            Text(String),
        }

        let parsed = match Repr::deserialize(deserializer)? {
            Repr::Single(number) => Self::from_numbers(&[number]),
            Repr::Numbers(numbers) => Self::from_numbers(&numbers),
            Repr::Text(text) => text.parse(),
        };
        parsed.map_err(de::Error::custom)
    }
}

pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

mod time_of_day {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format("%H:%M:%S"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time_of_day(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid time of day '{raw}'")))
    }
}

/// One weekly interval `[start, end)` during which `mode` is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    #[serde(with = "time_of_day")]
    pub start: NaiveTime,
    #[serde(with = "time_of_day")]
    pub end: NaiveTime,
    #[serde(alias = "setmode")]
    pub mode: String,
    #[serde(default)]
    pub weekdays: WeekdaySet,
}

impl ScheduleItem {
    pub fn is_active_at(&self, day: DayOfWeek, time: NaiveTime) -> bool {
        self.weekdays.contains(day) && self.start <= time && time < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    /// `time` lies inside the item; the boundary is its end.
    Current,
    /// The item is still ahead; the boundary is its start.
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NextBoundary<'a> {
    pub kind: BoundaryKind,
    pub item: &'a ScheduleItem,
    pub day_offset: u8,
}

impl NextBoundary<'_> {
    pub fn time(&self) -> NaiveTime {
        match self.kind {
            BoundaryKind::Current => self.item.end,
            BoundaryKind::Next => self.item.start,
        }
    }
}

const LOOKAHEAD_DAYS: u8 = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    name: String,
    items: Vec<ScheduleItem>,
}

impl Schedule {
    /// Builds a schedule without validating it. Items are sorted by start.
    pub fn new(name: impl Into<String>, mut items: Vec<ScheduleItem>) -> Self {
        items.sort_by_key(|item| item.start);
        Self {
            name: name.into(),
            items,
        }
    }

    /// Like [`Schedule::new`], but rejects empty intervals and items that
    /// overlap on a shared weekday.
    pub fn validated(name: impl Into<String>, items: Vec<ScheduleItem>) -> Result<Self, ConfigError> {
        let schedule = Self::new(name, items);

        if let Some(item) = schedule.items.iter().find(|item| item.start >= item.end) {
            return Err(ConfigError::EmptyInterval {
                schedule: schedule.name.clone(),
                start: item.start,
                end: item.end,
            });
        }

        for day in DayOfWeek::ALL {
            let mut previous_end: Option<NaiveTime> = None;
            for item in schedule.items_on(day) {
                if previous_end.is_some_and(|end| end > item.start) {
                    return Err(ConfigError::OverlappingItems {
                        schedule: schedule.name.clone(),
                        day,
                    });
                }
                previous_end = Some(item.end);
            }
        }

        Ok(schedule)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn items(&self) -> &[ScheduleItem] {
        &self.items
    }

    fn items_on(&self, day: DayOfWeek) -> impl Iterator<Item = &ScheduleItem> {
        self.items
            .iter()
            .filter(move |item| item.weekdays.contains(day))
    }

    pub fn current_item(&self, day: DayOfWeek, time: NaiveTime) -> Option<&ScheduleItem> {
        self.items.iter().find(|item| item.is_active_at(day, time))
    }

    pub fn current_item_at(&self, at: NaiveDateTime) -> Option<&ScheduleItem> {
        self.current_item(DayOfWeek::from_chrono(at.weekday()), at.time())
    }

    /// The first item boundary strictly after `(day, time)`, looking at most
    /// a week ahead.
    pub fn next_item(&self, day: DayOfWeek, time: NaiveTime) -> Option<NextBoundary<'_>> {
        for item in self.items_on(day) {
            if time < item.start {
                return Some(NextBoundary {
                    kind: BoundaryKind::Next,
                    item,
                    day_offset: 0,
                });
            }
            if time < item.end {
                return Some(NextBoundary {
                    kind: BoundaryKind::Current,
                    item,
                    day_offset: 0,
                });
            }
        }

        // Later days start at midnight, so their first item is always upcoming.
        // Offset 7 revisits today's weekday for items earlier than `time`.
        (1..=LOOKAHEAD_DAYS).find_map(|day_offset| {
            let candidate = DayOfWeek::from_index(day.index() + usize::from(day_offset));
            self.items_on(candidate).next().map(|item| NextBoundary {
                kind: BoundaryKind::Next,
                item,
                day_offset,
            })
        })
    }

    /// Absolute time of the next boundary after `now`, together with it.
    pub fn next_change(&self, now: NaiveDateTime) -> Option<(NaiveDateTime, NextBoundary<'_>)> {
        let boundary = self.next_item(DayOfWeek::from_chrono(now.weekday()), now.time())?;
        let date = now.date() + Duration::days(i64::from(boundary.day_offset));
        Some((date.and_time(boundary.time()), boundary))
    }
}
