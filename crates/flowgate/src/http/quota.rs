use std::collections::HashMap;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use parking_lot::Mutex;

use crate::expr::{RequestContext, extract_key};
use crate::http::Request;
use crate::proxy::ProxyError;
use crate::types::features::{QuotaConfig, QuotaPeriod};
use crate::*;

/// Per-client quota counters keyed by calendar period. Overflow rejects with 429 and a
/// Retry-After pointing at the period boundary.
pub struct QuotaCounter {
	config: QuotaConfig,
	counters: Mutex<HashMap<(String, i64), u64>>,
}

impl QuotaCounter {
	pub fn new(config: QuotaConfig) -> Self {
		QuotaCounter {
			config,
			counters: Mutex::new(HashMap::new()),
		}
	}

	pub fn check(
		&self,
		ctx: &mut RequestContext,
		req: &Request,
		limit_override: Option<u64>,
	) -> Result<(), ProxyError> {
		let key = extract_key(&self.config.key, ctx, req).unwrap_or_else(|| "anonymous".to_string());
		let now = Utc::now();
		let window = period_start(self.config.period, now);
		let limit = limit_override.unwrap_or(self.config.limit);

		let mut counters = self.counters.lock();
		// Trim counters from previous periods while we hold the lock anyway.
		counters.retain(|(_, w), _| *w == window);
		let count = counters.entry((key, window)).or_insert(0);
		if *count >= limit {
			let retry_after = period_end(self.config.period, now)
				.signed_duration_since(now)
				.num_seconds()
				.max(1) as u64;
			return Err(ProxyError::QuotaExceeded {
				limit,
				reset_seconds: retry_after,
			});
		}
		*count += 1;
		Ok(())
	}

	pub fn usage(&self) -> HashMap<String, u64> {
		self
			.counters
			.lock()
			.iter()
			.map(|((k, _), v)| (k.clone(), *v))
			.collect()
	}
}

fn period_start(period: QuotaPeriod, now: DateTime<Utc>) -> i64 {
	let start = match period {
		QuotaPeriod::Hourly => now
			.date_naive()
			.and_hms_opt(now.hour(), 0, 0)
			.expect("valid time"),
		QuotaPeriod::Daily => now.date_naive().and_hms_opt(0, 0, 0).expect("valid time"),
		QuotaPeriod::Monthly => now
			.date_naive()
			.with_day(1)
			.expect("first of month is valid")
			.and_hms_opt(0, 0, 0)
			.expect("valid time"),
		QuotaPeriod::Yearly => now
			.date_naive()
			.with_ordinal(1)
			.expect("first of year is valid")
			.and_hms_opt(0, 0, 0)
			.expect("valid time"),
	};
	Utc.from_utc_datetime(&start).timestamp()
}

fn period_end(period: QuotaPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
	let start = Utc
		.timestamp_opt(period_start(period, now), 0)
		.single()
		.expect("valid timestamp");
	match period {
		QuotaPeriod::Hourly => start + chrono::Duration::hours(1),
		QuotaPeriod::Daily => start + chrono::Duration::days(1),
		QuotaPeriod::Monthly => {
			let (y, m) = if start.month() == 12 {
				(start.year() + 1, 1)
			} else {
				(start.year(), start.month() + 1)
			};
			Utc
				.with_ymd_and_hms(y, m, 1, 0, 0, 0)
				.single()
				.expect("first of month is valid")
		},
		QuotaPeriod::Yearly => Utc
			.with_ymd_and_hms(start.year() + 1, 1, 1, 0, 0, 0)
			.single()
			.expect("first of year is valid"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;
	use crate::types::features::KeySource;

	fn req() -> Request {
		::http::Request::builder()
			.uri("/")
			.body(Body::empty())
			.unwrap()
	}

	fn ctx() -> RequestContext {
		RequestContext::new("1.2.3.4:1".parse().unwrap(), ::http::Version::HTTP_11)
	}

	#[test]
	fn quota_rejects_after_limit() {
		let q = QuotaCounter::new(QuotaConfig {
			limit: 2,
			period: QuotaPeriod::Daily,
			key: KeySource::Ip,
		});
		let mut c = ctx();
		q.check(&mut c, &req(), None).unwrap();
		q.check(&mut c, &req(), None).unwrap();
		let err = q.check(&mut c, &req(), None).unwrap_err();
		assert!(matches!(err, ProxyError::QuotaExceeded { limit: 2, .. }));
	}

	#[test]
	fn tier_override_takes_precedence() {
		let q = QuotaCounter::new(QuotaConfig {
			limit: 1,
			period: QuotaPeriod::Hourly,
			key: KeySource::Ip,
		});
		let mut c = ctx();
		q.check(&mut c, &req(), Some(3)).unwrap();
		q.check(&mut c, &req(), Some(3)).unwrap();
		q.check(&mut c, &req(), Some(3)).unwrap();
		assert!(q.check(&mut c, &req(), Some(3)).is_err());
	}

	#[test]
	fn period_boundaries() {
		let now = Utc.with_ymd_and_hms(2026, 12, 15, 13, 45, 0).unwrap();
		let end = period_end(QuotaPeriod::Monthly, now);
		assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
		let end = period_end(QuotaPeriod::Hourly, now);
		assert_eq!(end, Utc.with_ymd_and_hms(2026, 12, 15, 14, 0, 0).unwrap());
	}
}
