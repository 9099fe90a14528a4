use std::future::Future;
use std::task::{Context, Poll, ready};

use http_body::{Body as HttpBody, SizeHint};
use pin_project_lite::pin_project;
use tokio::time::{Instant as TokioInstant, Sleep, sleep_until};

use crate::types::features::TimeoutConfig;
use crate::*;

/// Effective deadlines for one request. The validator guarantees header <= backend <= request.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
	pub request: Duration,
	pub backend: Duration,
	pub header: Duration,
}

impl From<&TimeoutConfig> for Deadlines {
	fn from(t: &TimeoutConfig) -> Self {
		Deadlines {
			request: t.request,
			backend: t.backend,
			header: t.header,
		}
	}
}

impl Deadlines {
	/// Per-try deadline: the configured per-try timeout when tighter than the backend budget.
	pub fn per_try(&self, per_try: Option<Duration>) -> Duration {
		match per_try {
			Some(t) => t.min(self.backend),
			None => self.backend,
		}
	}
}

pub enum BodyTimeout {
	Deadline(TokioInstant),
	None,
}

impl BodyTimeout {
	pub fn apply(self, r: crate::http::Response) -> crate::http::Response {
		r.map(|b| crate::http::Body::new(TimeoutBody::new(self, b)))
	}
}

pin_project! {
	/// Fails the body stream once the request deadline passes, so slow trailers cannot hold a
	/// connection past its budget.
	pub struct TimeoutBody<B> {
		timeout: BodyTimeout,
		#[pin]
		sleep: Option<Sleep>,
		#[pin]
		body: B,
	}
}

impl<B> TimeoutBody<B> {
	pub fn new(timeout: BodyTimeout, body: B) -> Self {
		TimeoutBody {
			timeout,
			sleep: None,
			body,
		}
	}
}

impl<B> HttpBody for TimeoutBody<B>
where
	B: HttpBody,
	B::Error: Into<axum_core::BoxError>,
{
	type Data = B::Data;
	type Error = Box<dyn std::error::Error + Send + Sync>;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();

		if let BodyTimeout::Deadline(d) = this.timeout {
			let sleep_pinned = if let Some(some) = this.sleep.as_mut().as_pin_mut() {
				some
			} else {
				this.sleep.set(Some(sleep_until(*d)));
				this.sleep.as_mut().as_pin_mut().expect("just set")
			};
			if let Poll::Ready(()) = sleep_pinned.poll(cx) {
				return Poll::Ready(Some(Err(Box::new(TimeoutError(())))));
			}
		}

		let frame = ready!(this.body.poll_frame(cx));
		Poll::Ready(frame.transpose().map_err(Into::into).transpose())
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}

#[derive(Debug)]
pub struct TimeoutError(());

impl std::error::Error for TimeoutError {}

impl std::fmt::Display for TimeoutError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "data was not received within the designated timeout")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn per_try_is_capped_by_backend_budget() {
		let d = Deadlines {
			request: Duration::from_secs(30),
			backend: Duration::from_secs(10),
			header: Duration::from_secs(5),
		};
		assert_eq!(d.per_try(None), Duration::from_secs(10));
		assert_eq!(
			d.per_try(Some(Duration::from_secs(2))),
			Duration::from_secs(2)
		);
		assert_eq!(
			d.per_try(Some(Duration::from_secs(20))),
			Duration::from_secs(10)
		);
	}
}
