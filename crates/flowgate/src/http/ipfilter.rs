use std::net::IpAddr;

use crate::expr::RequestContext;
use crate::http::{Request, x_headers};
use crate::proxy::ProxyError;
use crate::types::config::{BotConfig, GeoConfig, IpFilterConfig, TrustedProxiesConfig};
use crate::*;

/// Resolves the real client IP by walking X-Forwarded-For from the right, skipping trusted
/// proxies, up to `max_hops`. The peer address is used when the peer is not a trusted proxy.
pub fn resolve_client_ip(
	trusted: &TrustedProxiesConfig,
	peer: IpAddr,
	req: &Request,
) -> IpAddr {
	let is_trusted = |ip: &IpAddr| trusted.cidrs.iter().any(|net| net.contains(ip));
	if trusted.cidrs.is_empty() || !is_trusted(&peer) {
		return peer;
	}
	let Some(xff) = req
		.headers()
		.get(x_headers::X_FORWARDED_FOR)
		.and_then(|v| v.to_str().ok())
	else {
		return peer;
	};
	let mut hops = 0;
	let mut candidate = peer;
	for entry in xff.rsplit(',') {
		if hops >= trusted.max_hops {
			break;
		}
		let Ok(ip) = entry.trim().parse::<IpAddr>() else {
			break;
		};
		candidate = ip;
		hops += 1;
		if !is_trusted(&ip) {
			break;
		}
	}
	candidate
}

pub fn check_ip_filter(config: &IpFilterConfig, ip: IpAddr) -> Result<(), ProxyError> {
	if !config.allow.is_empty() && !config.allow.iter().any(|net| net.contains(&ip)) {
		return Err(ProxyError::Rejected {
			status: http::StatusCode::FORBIDDEN,
			message: "address not allowed".to_string(),
		});
	}
	if config.deny.iter().any(|net| net.contains(&ip)) {
		return Err(ProxyError::Rejected {
			status: http::StatusCode::FORBIDDEN,
			message: "address denied".to_string(),
		});
	}
	Ok(())
}

/// Country resolution: the configured trusted header wins; otherwise the static CIDR table.
pub fn resolve_country(config: &GeoConfig, ctx: &RequestContext, req: &Request) -> Option<String> {
	if let Some(header) = &config.country_header
		&& let Some(country) = req
			.headers()
			.get(header.as_str())
			.and_then(|v| v.to_str().ok())
	{
		return Some(country.to_ascii_uppercase());
	}
	config
		.networks
		.iter()
		.find(|(_, nets)| nets.iter().any(|net| net.contains(&ctx.client_ip)))
		.map(|(country, _)| country.to_ascii_uppercase())
}

pub fn check_geo(
	config: &GeoConfig,
	ctx: &RequestContext,
	req: &Request,
) -> Result<(), ProxyError> {
	let Some(country) = resolve_country(config, ctx, req) else {
		// Unresolvable origin is only rejected under an explicit allow list.
		if !config.allow_countries.is_empty() {
			return reject_geo(config, "origin country unknown");
		}
		return Ok(());
	};
	if !config.allow_countries.is_empty()
		&& !config
			.allow_countries
			.iter()
			.any(|c| c.eq_ignore_ascii_case(&country))
	{
		return reject_geo(config, "origin country not allowed");
	}
	if config
		.deny_countries
		.iter()
		.any(|c| c.eq_ignore_ascii_case(&country))
	{
		return reject_geo(config, "origin country denied");
	}
	Ok(())
}

fn reject_geo(config: &GeoConfig, message: &str) -> Result<(), ProxyError> {
	if config.shadow {
		info!(message, "geo filter would reject (shadow mode)");
		return Ok(());
	}
	Err(ProxyError::Rejected {
		status: http::StatusCode::FORBIDDEN,
		message: message.to_string(),
	})
}

pub fn check_bot(config: &BotConfig, req: &Request) -> Result<(), ProxyError> {
	let ua = req
		.headers()
		.get(http::header::USER_AGENT)
		.and_then(|v| v.to_str().ok());
	let Some(ua) = ua else {
		if config.block_empty_user_agent {
			return Err(ProxyError::Rejected {
				status: http::StatusCode::FORBIDDEN,
				message: "user agent required".to_string(),
			});
		}
		return Ok(());
	};
	if config.allow_patterns.iter().any(|re| re.is_match(ua)) {
		return Ok(());
	}
	if config.deny_patterns.iter().any(|re| re.is_match(ua)) {
		return Err(ProxyError::Rejected {
			status: http::StatusCode::FORBIDDEN,
			message: "automated clients are not allowed".to_string(),
		});
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn req_with_xff(xff: Option<&str>) -> Request {
		let mut b = ::http::Request::builder().uri("/");
		if let Some(v) = xff {
			b = b.header("x-forwarded-for", v);
		}
		b.body(Body::empty()).unwrap()
	}

	fn trusted(cidrs: &[&str], max_hops: usize) -> TrustedProxiesConfig {
		TrustedProxiesConfig {
			cidrs: cidrs.iter().map(|c| c.parse().unwrap()).collect(),
			max_hops,
		}
	}

	#[test]
	fn untrusted_peer_ignores_xff() {
		let ip = resolve_client_ip(
			&trusted(&["10.0.0.0/8"], 4),
			"203.0.113.7".parse().unwrap(),
			&req_with_xff(Some("198.51.100.1")),
		);
		assert_eq!(ip, "203.0.113.7".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn trusted_peer_walks_to_first_untrusted() {
		let ip = resolve_client_ip(
			&trusted(&["10.0.0.0/8"], 4),
			"10.0.0.1".parse().unwrap(),
			&req_with_xff(Some("198.51.100.1, 10.0.0.2, 10.0.0.3")),
		);
		assert_eq!(ip, "198.51.100.1".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn walk_respects_max_hops() {
		let ip = resolve_client_ip(
			&trusted(&["10.0.0.0/8"], 2),
			"10.0.0.1".parse().unwrap(),
			&req_with_xff(Some("198.51.100.1, 10.0.0.2, 10.0.0.3")),
		);
		// Only two hops examined, both trusted; the walk stops at the hop budget.
		assert_eq!(ip, "10.0.0.2".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn allow_list_excludes_everyone_else() {
		let cfg = IpFilterConfig {
			allow: vec!["192.0.2.0/24".parse().unwrap()],
			deny: vec![],
		};
		assert!(check_ip_filter(&cfg, "192.0.2.55".parse().unwrap()).is_ok());
		assert!(check_ip_filter(&cfg, "203.0.113.1".parse().unwrap()).is_err());
	}

	#[test]
	fn geo_header_resolution() {
		let cfg = GeoConfig {
			deny_countries: vec!["XX".into()],
			country_header: Some("cf-ipcountry".into()),
			..Default::default()
		};
		let ctx = RequestContext::new("1.2.3.4:1".parse().unwrap(), ::http::Version::HTTP_11);
		let bad = ::http::Request::builder()
			.uri("/")
			.header("cf-ipcountry", "xx")
			.body(Body::empty())
			.unwrap();
		assert!(check_geo(&cfg, &ctx, &bad).is_err());
		let ok = ::http::Request::builder()
			.uri("/")
			.header("cf-ipcountry", "DE")
			.body(Body::empty())
			.unwrap();
		assert!(check_geo(&cfg, &ctx, &ok).is_ok());
	}

	#[test]
	fn geo_shadow_mode_passes() {
		let cfg = GeoConfig {
			deny_countries: vec!["XX".into()],
			country_header: Some("cf-ipcountry".into()),
			shadow: true,
			..Default::default()
		};
		let ctx = RequestContext::new("1.2.3.4:1".parse().unwrap(), ::http::Version::HTTP_11);
		let bad = ::http::Request::builder()
			.uri("/")
			.header("cf-ipcountry", "XX")
			.body(Body::empty())
			.unwrap();
		assert!(check_geo(&cfg, &ctx, &bad).is_ok());
	}

	#[test]
	fn bot_deny_with_allow_override() {
		let cfg: BotConfig = crate::serdes::yamlviajson::from_str(
			r#"
deny_patterns: ["(?i)crawler|scraper"]
allow_patterns: ["(?i)goodbot"]
block_empty_user_agent: true
"#,
		)
		.unwrap();
		let ua = |s: &str| {
			::http::Request::builder()
				.uri("/")
				.header("user-agent", s)
				.body(Body::empty())
				.unwrap()
		};
		assert!(check_bot(&cfg, &ua("SuperScraper/1.0")).is_err());
		assert!(check_bot(&cfg, &ua("GoodBot crawler")).is_ok());
		assert!(check_bot(&cfg, &ua("Mozilla/5.0")).is_ok());
		assert!(check_bot(&cfg, &req_with_xff(None)).is_err());
	}
}
