use std::fmt;

use chrono::Weekday;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Repeat days packed into seven bits, bit 0 = Monday through bit 6 = Sunday.
/// An empty set marks a one-shot alarm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DaysOfWeek(u8);

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl DaysOfWeek {
    pub const NONE: Self = Self(0);
    pub const WEEKDAYS: Self = Self(0x1f);
    pub const WEEKENDS: Self = Self(0x60);
    pub const EVERY_DAY: Self = Self(0x7f);

    pub fn from_bits(bits: u8) -> Option<Self> {
        (bits <= Self::EVERY_DAY.0).then_some(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_repeating(self) -> bool {
        self.0 != 0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & day_bit(day) != 0
    }

    pub fn with(self, day: Weekday) -> Self {
        Self(self.0 | day_bit(day))
    }

    pub fn weekdays(self) -> impl Iterator<Item = Weekday> {
        ALL_DAYS.into_iter().filter(move |day| self.contains(*day))
    }
}

fn day_bit(day: Weekday) -> u8 {
    1 << day.num_days_from_monday()
}

impl FromIterator<Weekday> for DaysOfWeek {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, DaysOfWeek::with)
    }
}

impl fmt::Display for DaysOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("never"),
            Self::EVERY_DAY => f.write_str("every day"),
            days => {
                let names = days.weekdays().map(weekday_token).collect::<Vec<_>>();
                f.write_str(&names.join(", "))
            }
        }
    }
}

impl Serialize for DaysOfWeek {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.weekdays().map(weekday_token))
    }
}

/// Accepted on input: a list of day tokens or the raw seven-bit mask.
#[derive(Deserialize)]
#[serde(untagged)]
enum DaysRepr {
    Bits(u8),
    Tokens(Vec<WeekdayToken>),
}

impl<'de> Deserialize<'de> for DaysOfWeek {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match DaysRepr::deserialize(deserializer)? {
            DaysRepr::Bits(bits) => DaysOfWeek::from_bits(bits).ok_or_else(|| {
                serde::de::Error::custom(format!("day mask {bits:#04x} sets bits above Sunday"))
            }),
            DaysRepr::Tokens(tokens) => {
                Ok(tokens.into_iter().map(WeekdayToken::to_chrono).collect())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
enum WeekdayToken {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl WeekdayToken {
    fn to_chrono(self) -> Weekday {
        match self {
            WeekdayToken::Mon => Weekday::Mon,
            WeekdayToken::Tue => Weekday::Tue,
            WeekdayToken::Wed => Weekday::Wed,
            WeekdayToken::Thu => Weekday::Thu,
            WeekdayToken::Fri => Weekday::Fri,
            WeekdayToken::Sat => Weekday::Sat,
            WeekdayToken::Sun => Weekday::Sun,
        }
    }
}

pub fn weekday_token(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}
