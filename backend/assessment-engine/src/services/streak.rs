//! Calendar streaks over "virtual days" that roll over at 04:00 local time.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const DAY_ROLLOVER_HOURS: i64 = 4;
const MAX_WALK_DAYS: u32 = 5000;
const MILESTONE_STREAK: u32 = 7;

/// Day key for `timestamp`: anything before 04:00 belongs to the previous day.
pub fn virtual_day_key<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> NaiveDate {
    (timestamp.clone() - Duration::hours(DAY_ROLLOVER_HOURS)).date_naive()
}

/// Days on which the learner was active. Only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDaySet {
    days: BTreeSet<NaiveDate>,
}

impl ActiveDaySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the virtual day containing `timestamp` as active.
    pub fn record<Tz: TimeZone>(&mut self, timestamp: &DateTime<Tz>) {
        self.days.insert(virtual_day_key(timestamp));
    }

    pub fn insert(&mut self, day: NaiveDate) {
        self.days.insert(day);
    }

    pub fn contains(&self, day: &NaiveDate) -> bool {
        self.days.contains(day)
    }

    pub fn first(&self) -> Option<NaiveDate> {
        self.days.iter().next().copied()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Day keys in ascending order.
    pub fn sorted(&self) -> Vec<NaiveDate> {
        self.days.iter().copied().collect()
    }
}

impl FromIterator<NaiveDate> for ActiveDaySet {
    fn from_iter<I: IntoIterator<Item = NaiveDate>>(iter: I) -> Self {
        Self {
            days: iter.into_iter().collect(),
        }
    }
}

fn is_weekend(day: NaiveDate) -> bool {
    matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Saturday of the weekend `day` falls in.
fn weekend_anchor(day: NaiveDate) -> Option<NaiveDate> {
    match day.weekday() {
        Weekday::Sat => Some(day),
        Weekday::Sun => day.pred_opt(),
        _ => None,
    }
}

/// Walks backwards from `today` counting active days.
///
/// One inactive weekend day per weekend is absorbed. An inactive weekday ends
/// the walk, except when it is the first inactive weekday seen before any
/// activity was counted (today has simply not been studied yet).
pub fn calculate_streak(
    active: &ActiveDaySet,
    first_activity: Option<NaiveDate>,
    today: NaiveDate,
) -> u32 {
    let first_activity = first_activity.or_else(|| active.first());
    let Some(first_activity) = first_activity else {
        return 0;
    };

    let mut streak = 0u32;
    let mut grace_used = false;
    let mut absorbed_weekend: Option<NaiveDate> = None;
    let mut cursor = today;

    for _ in 0..MAX_WALK_DAYS {
        if cursor < first_activity {
            break;
        }

        if active.contains(&cursor) {
            streak += 1;
        } else if is_weekend(cursor) {
            let anchor = weekend_anchor(cursor);
            if anchor.is_some() && anchor == absorbed_weekend {
                break;
            }
            absorbed_weekend = anchor;
        } else if streak == 0 && !grace_used {
            grace_used = true;
        } else {
            break;
        }

        match cursor.pred_opt() {
            Some(previous) => cursor = previous,
            None => break,
        }
    }

    streak
}

/// Streak as of `now`, using the virtual day containing `now` as today.
pub fn current_streak<Tz: TimeZone>(
    active: &ActiveDaySet,
    first_activity: Option<NaiveDate>,
    now: &DateTime<Tz>,
) -> u32 {
    calculate_streak(active, first_activity, virtual_day_key(now))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakMilestones {
    pub max_streak: u32,
    /// Day on which the running streak first reached seven.
    pub first_seven_day: Option<NaiveDate>,
}

/// Single pass over ascending day keys.
pub fn calculate_streak_milestones(days: &[NaiveDate]) -> StreakMilestones {
    let mut max_streak = 0u32;
    let mut running = 0u32;
    let mut first_seven_day = None;
    let mut previous: Option<NaiveDate> = None;

    for &day in days {
        running = match previous {
            None => 1,
            Some(last) => match (day - last).num_days() {
                1 => running + 1,
                2 if last.succ_opt().is_some_and(is_weekend) => running + 1,
                _ => 1,
            },
        };

        max_streak = max_streak.max(running);
        if first_seven_day.is_none() && running >= MILESTONE_STREAK {
            first_seven_day = Some(day);
        }
        previous = Some(day);
    }

    StreakMilestones {
        max_streak,
        first_seven_day,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // 2024-06-03 is a Monday.
    fn monday() -> NaiveDate {
        date(2024, 6, 3)
    }

    #[test]
    fn friday_and_monday_give_one() {
        let active: ActiveDaySet = [date(2024, 5, 31), monday()].into_iter().collect();
        assert_eq!(calculate_streak(&active, None, monday()), 1);
    }

    #[test]
    fn saturday_and_monday_give_two() {
        let active: ActiveDaySet = [date(2024, 6, 1), monday()].into_iter().collect();
        assert_eq!(calculate_streak(&active, None, monday()), 2);
    }

    #[test]
    fn unstudied_today_checks_yesterday() {
        // Tue..Thu active, today is Friday with nothing yet.
        let active: ActiveDaySet = [date(2024, 6, 4), date(2024, 6, 5), date(2024, 6, 6)]
            .into_iter()
            .collect();
        assert_eq!(calculate_streak(&active, None, date(2024, 6, 7)), 3);
    }

    #[test]
    fn two_missed_weekdays_break_the_streak() {
        let active: ActiveDaySet = [date(2024, 6, 4)].into_iter().collect();
        assert_eq!(calculate_streak(&active, None, date(2024, 6, 7)), 0);
    }

    #[test]
    fn weekly_weekend_allowance_spans_multiple_weekends() {
        // Two full weeks Mon-Fri plus Saturday of the first weekend only.
        let mut active = ActiveDaySet::new();
        for day in 27..=31 {
            active.insert(date(2024, 5, day));
        }
        active.insert(date(2024, 6, 1));
        for day in 3..=7 {
            active.insert(date(2024, 6, day));
        }

        assert_eq!(calculate_streak(&active, None, date(2024, 6, 7)), 11);
    }

    #[test]
    fn walk_stops_before_first_activity() {
        let active: ActiveDaySet = [monday()].into_iter().collect();
        assert_eq!(calculate_streak(&active, Some(monday()), monday()), 1);
        assert_eq!(calculate_streak(&ActiveDaySet::new(), None, monday()), 0);
    }

    #[test]
    fn virtual_day_rolls_over_at_four() {
        let tz = FixedOffset::east_opt(3 * 3600).unwrap();
        let early = tz.with_ymd_and_hms(2024, 6, 3, 3, 59, 0).unwrap();
        let later = tz.with_ymd_and_hms(2024, 6, 3, 4, 0, 0).unwrap();

        assert_eq!(virtual_day_key(&early), date(2024, 6, 2));
        assert_eq!(virtual_day_key(&later), date(2024, 6, 3));
    }

    #[test]
    fn current_streak_uses_virtual_today() {
        let mut active = ActiveDaySet::new();
        let now = Utc.with_ymd_and_hms(2024, 6, 4, 2, 30, 0).unwrap();
        active.record(&now);

        // 02:30 on Tuesday still counts as Monday.
        assert!(active.contains(&monday()));
        assert_eq!(current_streak(&active, None, &now), 1);
    }

    #[test]
    fn milestones_bridge_single_weekend_gap() {
        // Thu, Fri, Sun, Mon: the Saturday gap is bridged.
        let days = [
            date(2024, 5, 30),
            date(2024, 5, 31),
            date(2024, 6, 2),
            date(2024, 6, 3),
        ];
        let milestones = calculate_streak_milestones(&days);
        assert_eq!(milestones.max_streak, 4);
        assert_eq!(milestones.first_seven_day, None);
    }

    #[test]
    fn milestones_reset_on_weekday_gap_and_report_first_seven() {
        let mut days: Vec<NaiveDate> = (3..=9).map(|d| date(2024, 6, d)).collect();
        // Skip Tuesday the 11th.
        days.push(date(2024, 6, 12));

        let milestones = calculate_streak_milestones(&days);
        assert_eq!(milestones.max_streak, 7);
        assert_eq!(milestones.first_seven_day, Some(date(2024, 6, 9)));
        assert_eq!(calculate_streak_milestones(&[]).max_streak, 0);
    }
}
