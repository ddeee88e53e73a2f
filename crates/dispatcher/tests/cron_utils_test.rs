#[cfg(test)]
mod cron_utils_tests {
    use scheduler_dispatcher::cron_utils::*;

    use chrono::{Duration, TimeZone, Timelike, Utc};

    #[test]
    fn test_cron_scheduler_creation() {
        assert!(CronScheduler::new("0 0 0 * * *").is_ok());
        assert!(CronScheduler::new("*/15 * * * *").is_ok());
        assert!(CronScheduler::new("invalid").is_err());
    }

    #[test]
    fn test_five_field_expressions_are_normalized() {
        assert_eq!(normalize_cron_expression("0 3 * * *"), "0 0 3 * * *");
        assert_eq!(normalize_cron_expression(" 0 0 3 * * * "), "0 0 3 * * *");

        let scheduler = CronScheduler::new("30 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = scheduler.next_execution_time(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 2, 30, 0).unwrap());
    }

    #[test]
    fn test_validate_cron_expression() {
        assert!(CronScheduler::validate_cron_expression("0 */5 * * * *").is_ok());
        assert!(CronScheduler::validate_cron_expression("0 9-17 * * 1-5").is_ok());
        assert!(CronScheduler::validate_cron_expression("0 0 0 32 * *").is_err());
        assert!(CronScheduler::validate_cron_expression("").is_err());
    }

    #[test]
    fn test_upcoming_times() {
        let scheduler = CronScheduler::new("0 0 * * * *").unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
        let upcoming = scheduler.upcoming_times(now, 3);

        assert_eq!(upcoming.len(), 3);
        assert_eq!(upcoming[0].hour(), 13);
        assert_eq!(upcoming[2].hour(), 15);
    }

    #[test]
    fn test_deadline_prefers_cron_over_interval() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let deadline = calculate_deadline(
            Some("0 18 * * *"),
            Some(Duration::minutes(5)),
            Duration::days(1),
            now,
        )
        .unwrap();
        assert_eq!(deadline, Utc.with_ymd_and_hms(2024, 1, 1, 18, 0, 0).unwrap());
    }

    #[test]
    fn test_deadline_interval_then_default() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let with_interval =
            calculate_deadline(None, Some(Duration::minutes(30)), Duration::days(1), now).unwrap();
        assert_eq!(with_interval, now + Duration::minutes(30));

        let zero_interval =
            calculate_deadline(None, Some(Duration::zero()), Duration::days(1), now).unwrap();
        assert_eq!(zero_interval, now + Duration::days(1));

        let blank_cron = calculate_deadline(Some("  "), None, Duration::hours(6), now).unwrap();
        assert_eq!(blank_cron, now + Duration::hours(6));
    }

    #[test]
    fn test_deadline_invalid_cron_is_error() {
        let result = calculate_deadline(Some("every day"), None, Duration::days(1), Utc::now());
        assert!(result.is_err());
    }
}
