//! Date-range validation, preset catalogue, and translation of a logical
//! import filter into the query forms the upstream order API understands.
//!
//! Everything here is pure: the clock is passed in as `now`, and the shop time
//! zone is fixed when the [`FilterTranslator`] is built.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Longest range accepted for a single import.
pub const MAX_RANGE_DAYS: i64 = 365;

/// Key of the preset used when a request carries no dates.
pub const DEFAULT_PRESET: &str = "last_30_days";

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// `any` means "no filtering" upstream.
            pub fn is_any(&self) -> bool {
                self.as_str() == "any"
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(DomainError::validation(format!(
                        "unknown {}: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

status_enum!(
    /// Payment state of an upstream order.
    FinancialStatus {
        Pending => "pending",
        Authorized => "authorized",
        PartiallyPaid => "partially_paid",
        Paid => "paid",
        PartiallyRefunded => "partially_refunded",
        Refunded => "refunded",
        Voided => "voided",
        Any => "any",
    }
);

status_enum!(
    /// Shipping state of an upstream order.
    FulfillmentStatus {
        Shipped => "shipped",
        Partial => "partial",
        Unshipped => "unshipped",
        Unfulfilled => "unfulfilled",
        Any => "any",
    }
);

status_enum!(
    /// Open/closed state of an upstream order.
    OrderStatus {
        Open => "open",
        Closed => "closed",
        Cancelled => "cancelled",
        Any => "any",
    }
);

/// An inclusive time range in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn span(&self) -> Duration {
        self.to - self.from
    }
}

/// A labelled range, either from the preset catalogue or a suggested correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedRange {
    pub key: String,
    pub label: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub preset: bool,
}

impl NamedRange {
    fn preset(key: &str, label: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            from,
            to,
            preset: true,
        }
    }

    fn correction(key: &str, label: &str, range: DateRange) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            from: range.from,
            to: range.to,
            preset: false,
        }
    }

    pub fn range(&self) -> DateRange {
        DateRange::new(self.from, self.to)
    }
}

/// Outcome of [`FilterTranslator::validate_date_range`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRangeValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_range: Option<NamedRange>,
    /// The parsed range when `valid`.
    #[serde(skip)]
    pub range: Option<DateRange>,
}

impl DateRangeValidation {
    fn ok(range: DateRange) -> Self {
        Self {
            valid: true,
            error: None,
            corrected_range: None,
            range: Some(range),
        }
    }

    fn rejected(error: impl Into<String>, corrected_range: Option<NamedRange>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            corrected_range,
            range: None,
        }
    }
}

/// Extra knobs for [`FilterTranslator::to_upstream_filter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOptions {
    pub use_created_at: bool,
    pub use_updated_at: bool,
    pub financial_status: Option<FinancialStatus>,
    pub fulfillment_status: Option<FulfillmentStatus>,
    pub status: Option<OrderStatus>,
    pub search: Option<String>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            use_created_at: true,
            use_updated_at: false,
            financial_status: None,
            fulfillment_status: None,
            status: None,
            search: None,
        }
    }
}

/// The logical filter of an import job, as stored in the job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFilter {
    pub range: DateRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub financial_status: Option<FinancialStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfillment_status: Option<FulfillmentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl ImportFilter {
    pub fn new(range: DateRange) -> Self {
        Self {
            range,
            financial_status: None,
            fulfillment_status: None,
            status: None,
            search: None,
        }
    }

    /// Translate into the upstream query form.
    pub fn to_upstream(&self) -> UpstreamFilter {
        FilterTranslator::to_upstream_filter(
            &self.range,
            &FilterOptions {
                financial_status: self.financial_status,
                fulfillment_status: self.fulfillment_status,
                status: self.status,
                search: self.search.clone(),
                ..FilterOptions::default()
            },
        )
    }
}

/// Query parameters understood by the upstream order endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamFilter {
    pub created_at_min: Option<DateTime<Utc>>,
    pub created_at_max: Option<DateTime<Utc>>,
    pub updated_at_min: Option<DateTime<Utc>>,
    pub updated_at_max: Option<DateTime<Utc>>,
    pub financial_status: Option<FinancialStatus>,
    pub fulfillment_status: Option<FulfillmentStatus>,
    pub status: Option<OrderStatus>,
    /// Continue after this upstream record id (fallback pagination).
    pub since_id: Option<String>,
    pub search: Option<String>,
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl UpstreamFilter {
    pub fn with_since_id(mut self, since_id: impl Into<String>) -> Self {
        self.since_id = Some(since_id.into());
        self
    }

    /// REST query pairs for a first-page request.
    ///
    /// `status` and `financial_status` always default to `any`; the upstream
    /// otherwise silently narrows the result set to open/paid orders.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("status", self.status.unwrap_or(OrderStatus::Any).to_string()),
            (
                "financial_status",
                self.financial_status
                    .unwrap_or(FinancialStatus::Any)
                    .to_string(),
            ),
        ];
        if let Some(fulfillment) = self.fulfillment_status {
            pairs.push(("fulfillment_status", fulfillment.to_string()));
        }
        if let Some(v) = &self.created_at_min {
            pairs.push(("created_at_min", timestamp(v)));
        }
        if let Some(v) = &self.created_at_max {
            pairs.push(("created_at_max", timestamp(v)));
        }
        if let Some(v) = &self.updated_at_min {
            pairs.push(("updated_at_min", timestamp(v)));
        }
        if let Some(v) = &self.updated_at_max {
            pairs.push(("updated_at_max", timestamp(v)));
        }
        if let Some(since) = &self.since_id {
            pairs.push(("since_id", since.clone()));
        }
        pairs
    }

    /// Search-syntax query for the bulk export (`field:op'value' AND ...`).
    pub fn to_search_query(&self) -> String {
        let mut conditions = Vec::new();

        if let Some(v) = &self.created_at_min {
            conditions.push(format!("created_at:>='{}'", timestamp(v)));
        }
        if let Some(v) = &self.created_at_max {
            conditions.push(format!("created_at:<='{}'", timestamp(v)));
        }
        if let Some(v) = &self.updated_at_min {
            conditions.push(format!("updated_at:>='{}'", timestamp(v)));
        }
        if let Some(v) = &self.updated_at_max {
            conditions.push(format!("updated_at:<='{}'", timestamp(v)));
        }
        if let Some(s) = self.financial_status.filter(|s| !s.is_any()) {
            conditions.push(format!("financial_status:{s}"));
        }
        if let Some(s) = self.fulfillment_status.filter(|s| !s.is_any()) {
            conditions.push(format!("fulfillment_status:{s}"));
        }
        if let Some(s) = self.status.filter(|s| !s.is_any()) {
            conditions.push(format!("status:{s}"));
        }
        if let Some(since) = &self.since_id {
            conditions.push(format!("id:>{since}"));
        }
        if let Some(term) = self.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let cleaned: String = term.chars().filter(|c| *c != '"' && *c != '\'').collect();
            conditions.push(format!("'{cleaned}'"));
        }

        conditions.join(" AND ")
    }
}

#[derive(Clone, Copy)]
enum Bound {
    Start,
    End,
}

/// Converts user-facing date input into upstream filters, in the shop's time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterTranslator {
    tz: Tz,
}

impl Default for FilterTranslator {
    fn default() -> Self {
        Self::new(chrono_tz::Europe::Berlin)
    }
}

impl FilterTranslator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Parse an RFC 3339 timestamp, or a plain `YYYY-MM-DD` date which expands
    /// to the start (or end) of that day in the shop time zone.
    fn parse_bound(&self, input: &str, bound: Bound) -> Option<DateTime<Utc>> {
        let input = input.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
            return Some(dt.with_timezone(&Utc));
        }
        let date = NaiveDate::parse_from_str(input, "%Y-%m-%d").ok()?;
        Some(match bound {
            Bound::Start => self.start_of_day(date),
            Bound::End => self.end_of_day(date),
        })
    }

    fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        self.tz
            .from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local))
    }

    fn end_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_hms_milli_opt(23, 59, 59, 999).unwrap_or_default();
        self.tz
            .from_local_datetime(&local)
            .latest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local))
    }

    /// Check a user-supplied range. Rejections carry a suggested correction
    /// where one exists (inverted bounds, overlong span).
    pub fn validate_date_range(&self, from: &str, to: &str, now: DateTime<Utc>) -> DateRangeValidation {
        let (Some(from_dt), Some(to_dt)) = (
            self.parse_bound(from, Bound::Start),
            self.parse_bound(to, Bound::End),
        ) else {
            return DateRangeValidation::rejected("invalid date; expected RFC 3339 or YYYY-MM-DD", None);
        };

        if from_dt > to_dt {
            // Re-read the swapped inputs so date-only bounds keep day semantics.
            let swapped = DateRange::new(
                self.parse_bound(to, Bound::Start).unwrap_or(to_dt),
                self.parse_bound(from, Bound::End).unwrap_or(from_dt),
            );
            return DateRangeValidation::rejected(
                "start date must be before end date",
                Some(NamedRange::correction("corrected", "Corrected", swapped)),
            );
        }

        if from_dt > now {
            return DateRangeValidation::rejected("start date cannot be in the future", None);
        }

        let max_span = Duration::days(MAX_RANGE_DAYS);
        if to_dt - from_dt > max_span {
            let trimmed = DateRange::new(to_dt - max_span, to_dt);
            return DateRangeValidation::rejected(
                format!("range is too large (more than {MAX_RANGE_DAYS} days)"),
                Some(NamedRange::correction("last_year", "Last year", trimmed)),
            );
        }

        DateRangeValidation::ok(DateRange::new(from_dt, to_dt))
    }

    /// Fixed catalogue of named ranges relative to `now`.
    pub fn preset_ranges(&self, now: DateTime<Utc>) -> Vec<NamedRange> {
        let today = now.with_timezone(&self.tz).date_naive();

        let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        let week_end = week_start + Duration::days(6);

        let month_start = today.with_day(1).unwrap_or(today);
        let next_month = if today.month() == 12 {
            NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
        };
        let month_end = next_month.map(|d| d - Duration::days(1)).unwrap_or(today);

        let year_start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
        let year_end = NaiveDate::from_ymd_opt(today.year(), 12, 31).unwrap_or(today);

        vec![
            NamedRange::preset("today", "Today", self.start_of_day(today), self.end_of_day(today)),
            NamedRange::preset("last_24_hours", "Last 24 hours", now - Duration::hours(24), now),
            NamedRange::preset(
                "this_week",
                "This week",
                self.start_of_day(week_start),
                self.end_of_day(week_end),
            ),
            NamedRange::preset("last_7_days", "Last 7 days", now - Duration::days(7), now),
            NamedRange::preset(
                "this_month",
                "This month",
                self.start_of_day(month_start),
                self.end_of_day(month_end),
            ),
            NamedRange::preset("last_30_days", "Last 30 days", now - Duration::days(30), now),
            NamedRange::preset(
                "this_year",
                "This year",
                self.start_of_day(year_start),
                self.end_of_day(year_end),
            ),
            NamedRange::preset("last_3_months", "Last 3 months", now - Duration::days(90), now),
        ]
    }

    /// Look up one preset by key.
    pub fn preset(&self, key: &str, now: DateTime<Utc>) -> Option<NamedRange> {
        self.preset_ranges(now).into_iter().find(|r| r.key == key)
    }

    /// Pure mapping of a range plus options to upstream parameters.
    pub fn to_upstream_filter(range: &DateRange, options: &FilterOptions) -> UpstreamFilter {
        let mut filter = UpstreamFilter::default();

        if options.use_created_at {
            filter.created_at_min = Some(range.from);
            filter.created_at_max = Some(range.to);
        }
        if options.use_updated_at {
            filter.updated_at_min = Some(range.from);
            filter.updated_at_max = Some(range.to);
        }
        filter.financial_status = options.financial_status;
        filter.fulfillment_status = options.fulfillment_status;
        filter.status = options.status;
        filter.search = options.search.clone();

        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 12, 10, 30, 0).unwrap()
    }

    #[test]
    fn accepts_a_plain_range() {
        let t = FilterTranslator::default();
        let v = t.validate_date_range("2024-05-01T00:00:00Z", "2024-05-31T23:59:59Z", now());
        assert!(v.valid);
        assert!(v.error.is_none());
        let range = v.range.unwrap();
        assert_eq!(range.from, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn date_only_bounds_cover_whole_days_in_shop_time() {
        let t = FilterTranslator::default();
        let v = t.validate_date_range("2024-05-01", "2024-05-01", now());
        let range = v.range.unwrap();
        // Berlin is UTC+2 in May.
        assert_eq!(range.from, Utc.with_ymd_and_hms(2024, 4, 30, 22, 0, 0).unwrap());
        assert_eq!(
            range.to,
            Utc.with_ymd_and_hms(2024, 5, 1, 21, 59, 59).unwrap() + Duration::milliseconds(999)
        );
    }

    #[test]
    fn inverted_range_suggests_swapped_bounds() {
        let t = FilterTranslator::default();
        let v = t.validate_date_range("2024-05-31T00:00:00Z", "2024-05-01T00:00:00Z", now());
        assert!(!v.valid);
        let suggestion = v.corrected_range.unwrap();
        assert_eq!(suggestion.from, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(suggestion.to, Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap());
        assert!(!suggestion.preset);
    }

    #[test]
    fn future_start_is_rejected_without_suggestion() {
        let t = FilterTranslator::default();
        let v = t.validate_date_range("2024-07-01T00:00:00Z", "2024-07-02T00:00:00Z", now());
        assert!(!v.valid);
        assert!(v.corrected_range.is_none());
    }

    #[test]
    fn overlong_range_is_trimmed_to_one_year() {
        let t = FilterTranslator::default();
        let v = t.validate_date_range("2021-01-01T00:00:00Z", "2024-01-01T00:00:00Z", now());
        assert!(!v.valid);
        let suggestion = v.corrected_range.unwrap();
        assert_eq!(suggestion.to - suggestion.from, Duration::days(MAX_RANGE_DAYS));
    }

    #[test]
    fn unparseable_input_is_rejected() {
        let t = FilterTranslator::default();
        let v = t.validate_date_range("yesterday", "2024-01-01", now());
        assert!(!v.valid);
        assert!(v.corrected_range.is_none());
    }

    #[test]
    fn presets_cover_the_catalogue() {
        let t = FilterTranslator::default();
        let presets = t.preset_ranges(now());
        let keys: Vec<_> = presets.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "today",
                "last_24_hours",
                "this_week",
                "last_7_days",
                "this_month",
                "last_30_days",
                "this_year",
                "last_3_months"
            ]
        );
        assert!(presets.iter().all(|p| p.from <= p.to && p.preset));
    }

    #[test]
    fn this_week_starts_on_monday() {
        let t = FilterTranslator::new(chrono_tz::UTC);
        // 2024-06-12 is a Wednesday.
        let week = t.preset("this_week", now()).unwrap();
        assert_eq!(week.from, Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn december_month_end_rolls_into_next_year() {
        let t = FilterTranslator::new(chrono_tz::UTC);
        let dec = Utc.with_ymd_and_hms(2023, 12, 15, 0, 0, 0).unwrap();
        let month = t.preset("this_month", dec).unwrap();
        assert_eq!(month.to.date_naive(), NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    }

    #[test]
    fn query_pairs_default_statuses_to_any() {
        let range = DateRange::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
        );
        let filter = FilterTranslator::to_upstream_filter(&range, &FilterOptions::default());
        let pairs = filter.to_query_pairs();
        assert!(pairs.contains(&("status", "any".to_string())));
        assert!(pairs.contains(&("financial_status", "any".to_string())));
        assert!(pairs.contains(&("created_at_min", "2024-05-01T00:00:00Z".to_string())));
        assert!(!pairs.iter().any(|(k, _)| *k == "updated_at_min"));
    }

    #[test]
    fn search_query_skips_any_and_joins_with_and() {
        let range = DateRange::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
        );
        let filter = FilterTranslator::to_upstream_filter(
            &range,
            &FilterOptions {
                financial_status: Some(FinancialStatus::Paid),
                status: Some(OrderStatus::Any),
                search: Some("o'brien".into()),
                ..FilterOptions::default()
            },
        );
        assert_eq!(
            filter.to_search_query(),
            "created_at:>='2024-05-01T00:00:00Z' AND created_at:<='2024-05-02T00:00:00Z' \
             AND financial_status:paid AND 'obrien'"
        );
    }

    #[test]
    fn status_parsing_is_case_insensitive_and_strict() {
        assert_eq!("PAID".parse::<FinancialStatus>().unwrap(), FinancialStatus::Paid);
        assert_eq!(
            "partially_refunded".parse::<FinancialStatus>().unwrap(),
            FinancialStatus::PartiallyRefunded
        );
        assert!("settled".parse::<FinancialStatus>().is_err());
        assert!("open".parse::<FulfillmentStatus>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a rejected range's suggestion (if any) is always ordered,
        /// and an accepted range is never inverted or longer than a year.
        #[test]
        fn validation_never_yields_inverted_ranges(
            a in 0i64..(3 * 365 * 24 * 3600),
            b in 0i64..(3 * 365 * 24 * 3600),
        ) {
            let t = FilterTranslator::default();
            let base = now() - Duration::days(3 * 365);
            let from = (base + Duration::seconds(a)).to_rfc3339();
            let to = (base + Duration::seconds(b)).to_rfc3339();

            let v = t.validate_date_range(&from, &to, now());
            if v.valid {
                let r = v.range.unwrap();
                prop_assert!(r.from <= r.to);
                prop_assert!(r.span() <= Duration::days(MAX_RANGE_DAYS));
            } else if let Some(s) = v.corrected_range {
                prop_assert!(s.from <= s.to);
            }
        }
    }
}
