//! Recorded tick history in the exchange export format:
//!
//! ```text
//! <TICKER>,<PER>,<DATE>,<TIME>,<LAST>,<VOL>
//! SPFB.RTS,0,20190517,100000,123320.000000000,1
//! ```
//!
//! Dates and times are local to the exchange; `utc_offset_hours` maps them
//! to UTC.

use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tracing::info;

use crate::feed::FeedError;
use crate::models::Tick;

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub rebase_to_today: bool,
    pub utc_offset_hours: i32,
}

pub fn load_files<P: AsRef<Path>>(paths: &[P], options: LoadOptions) -> Result<Vec<Tick>, FeedError> {
    let offset = FixedOffset::east_opt(options.utc_offset_hours * 3600).ok_or(FeedError::Offset(options.utc_offset_hours))?;
    let today = if options.rebase_to_today {
        Some(Utc::now().with_timezone(&offset).date_naive())
    } else {
        None
    };

    let mut ticks = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| FeedError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let before = ticks.len();
        parse_into(&content, path, offset, today, &mut ticks)?;
        info!(path = %path.display(), ticks = ticks.len() - before, "loaded tick history");
    }
    sort_ticks(&mut ticks);
    Ok(ticks)
}

/// Stable sort, so ticks sharing a timestamp keep file order.
pub fn sort_ticks(ticks: &mut [Tick]) {
    ticks.sort_by_key(|tick| tick.timestamp);
}

fn parse_into(
    content: &str,
    path: &Path,
    offset: FixedOffset,
    today: Option<NaiveDate>,
    out: &mut Vec<Tick>,
) -> Result<(), FeedError> {
    // header
    for (idx, line) in content.lines().enumerate().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tick = parse_line(line, offset, today).map_err(|reason| FeedError::Parse {
            path: path.display().to_string(),
            line: idx + 1,
            reason,
        })?;
        out.push(tick);
    }
    Ok(())
}

fn parse_line(line: &str, offset: FixedOffset, today: Option<NaiveDate>) -> Result<Tick, String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 6 {
        return Err(format!("expected 6 fields, found {}", fields.len()));
    }

    let date = match today {
        Some(date) => date,
        None => NaiveDate::parse_from_str(fields[2], "%Y%m%d").map_err(|err| format!("date {:?}: {err}", fields[2]))?,
    };
    let time = NaiveTime::parse_from_str(fields[3], "%H%M%S").map_err(|err| format!("time {:?}: {err}", fields[3]))?;
    let timestamp = to_utc(NaiveDateTime::new(date, time), offset)?;

    // Prices are whole ticks; the fractional part is discarded.
    let whole = fields[4].split('.').next().unwrap_or_default();
    let price = whole.parse().map_err(|err| format!("price {:?}: {err}", fields[4]))?;
    let volume = fields[5].parse().map_err(|err| format!("volume {:?}: {err}", fields[5]))?;

    Ok(Tick {
        instrument: fields[0].to_string(),
        timestamp,
        price,
        volume,
    })
}

fn to_utc(local: NaiveDateTime, offset: FixedOffset) -> Result<DateTime<Utc>, String> {
    offset
        .from_local_datetime(&local)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| format!("ambiguous local time {local}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "<TICKER>,<PER>,<DATE>,<TIME>,<LAST>,<VOL>\n\
        SPFB.RTS,0,20190517,100001,123320.000000000,3\n\
        SPFB.Si,0,20190517,100000,64990.500000000,1\n\
        \n\
        SPFB.RTS,0,20190517,100001,123330.000000000,2\n";

    fn msk() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    #[test]
    fn parses_and_sorts_stably() {
        let mut ticks = Vec::new();
        parse_into(SAMPLE, Path::new("sample"), msk(), None, &mut ticks).unwrap();
        sort_ticks(&mut ticks);

        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].instrument, "SPFB.Si");
        assert_eq!(ticks[0].price, 64990);
        assert_eq!(ticks[0].timestamp, Utc.with_ymd_and_hms(2019, 5, 17, 7, 0, 0).unwrap());
        assert_eq!((ticks[1].price, ticks[1].volume), (123320, 3));
        assert_eq!((ticks[2].price, ticks[2].volume), (123330, 2));
    }

    #[test]
    fn rebases_onto_given_date() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let mut ticks = Vec::new();
        parse_into(SAMPLE, Path::new("sample"), msk(), Some(day), &mut ticks).unwrap();
        assert!(ticks.iter().all(|t| t.timestamp.date_naive() == day));
    }

    #[test]
    fn reports_line_of_bad_field() {
        let bad = "header\nSPFB.RTS,0,20190517,100001,abc,3\n";
        let err = parse_into(bad, Path::new("bad.txt"), msk(), None, &mut Vec::new()).unwrap_err();
        match err {
            FeedError::Parse { path, line, .. } => {
                assert_eq!(path, "bad.txt");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
