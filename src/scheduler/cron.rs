use chrono::{DateTime, Utc};
use croner::{
    Cron, CronIterator, Direction,
    parser::{CronParser, Seconds},
};

use crate::error::EtlError;

/// Normalize a cron expression to five fields. Six-field (seconds-prefixed)
/// expressions drop the seconds field; scheduling below minute granularity
/// is not supported.
pub fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 6 {
        fields[1..].join(" ")
    } else {
        fields.join(" ")
    }
}

pub fn parse_cron(expr: &str) -> Result<Cron, EtlError> {
    let normalized = normalize_cron(expr);
    CronParser::builder()
        .seconds(Seconds::Optional)
        .build()
        .parse(&normalized)
        .map_err(|err| {
            EtlError::ConfigInvalid(format!("{expr} is not a valid cron expression: {err:?}"))
        })
}

/// The next UTC firing strictly after `after`.
pub fn next_occurrence(cron: &Cron, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    CronIterator::new(cron.clone(), after, false, Direction::Forward).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Timelike;

    #[test]
    fn six_field_expressions_drop_the_seconds_field() {
        assert_eq!(normalize_cron("0 0 2 * * *"), "0 2 * * *");
        assert_eq!(normalize_cron("*/30 5 * * * 1"), "5 * * * 1");
    }

    #[test]
    fn five_field_expressions_pass_through() {
        assert_eq!(normalize_cron("0 2 * * *"), "0 2 * * *");
        assert_eq!(normalize_cron("  */5 *  * * *  "), "*/5 * * * *");
    }

    #[test]
    fn invalid_expressions_are_config_errors() {
        assert!(matches!(
            parse_cron("not a cron"),
            Err(EtlError::ConfigInvalid(_))
        ));
        assert!(parse_cron("0 2 * * *").is_ok());
        assert!(parse_cron("0 0 2 * * *").is_ok());
    }

    #[test]
    fn next_occurrence_is_strictly_in_the_future() {
        let cron = parse_cron("0 2 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap();

        let next = next_occurrence(&cron, after).unwrap();
        assert!(next > after);
        assert_eq!(next.hour(), 2);
        assert_eq!(next.minute(), 0);
    }
}
