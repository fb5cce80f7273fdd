use chrono::{Datelike, Local, Months, NaiveDate};

/// One calendar month, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn year(&self) -> i32 {
        self.start.year()
    }

    pub fn month(&self) -> u32 {
        self.start.month()
    }
}

/// Monthly windows for `[date_in, date_out)`, relative to the local clock.
pub fn compute_windows(date_in: Option<NaiveDate>, date_out: Option<NaiveDate>) -> Vec<DateWindow> {
    compute_windows_at(date_in, date_out, Local::now().date_naive())
}

/// Split the range into whole calendar months.
///
/// `date_out` is clamped to the first day of the current month so a month
/// still in progress is never captured half-way. A missing `date_in` means
/// the previous month. A month is included when its last day falls inside
/// the range, so `2016-01-01..2016-03-01` yields January and February.
pub fn compute_windows_at(
    date_in: Option<NaiveDate>,
    date_out: Option<NaiveDate>,
    today: NaiveDate,
) -> Vec<DateWindow> {
    let current = first_of_month(today);
    let date_out = match date_out {
        Some(d) if d <= current => d,
        _ => current,
    };
    let date_in = date_in.unwrap_or_else(|| current - Months::new(1));

    let mut windows = Vec::new();
    let mut start = first_of_month(date_in);
    loop {
        let end = start + Months::new(1);
        // last day of `start`'s month must not pass date_out
        if end.pred_opt().map_or(true, |last| last > date_out) {
            break;
        }
        windows.push(DateWindow { start, end });
        start = end;
    }
    windows
}

fn first_of_month(d: NaiveDate) -> NaiveDate {
    d.with_day(1).unwrap_or(d)
}
