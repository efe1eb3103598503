#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use courier_domain::UserId;

/// Window length used by all sliding-window limiters.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
	Allowed,

	/// Denied; `retry_after_secs` is when the oldest event leaves the window.
	Limited { retry_after_secs: u64 },
}

impl RateDecision {
	pub fn is_allowed(&self) -> bool {
		matches!(self, RateDecision::Allowed)
	}
}

/// Sliding window of event timestamps.
#[derive(Debug, Default)]
struct SlidingWindow {
	events: VecDeque<Instant>,
}

impl SlidingWindow {
	fn evict(&mut self, now: Instant) {
		while let Some(front) = self.events.front() {
			if now.duration_since(*front) >= WINDOW {
				self.events.pop_front();
			} else {
				break;
			}
		}
	}

	/// Records the event if under `limit`, otherwise returns a retry hint.
	fn check_and_record(&mut self, now: Instant, limit: u32) -> RateDecision {
		self.evict(now);

		if (self.events.len() as u32) < limit {
			self.events.push_back(now);
			return RateDecision::Allowed;
		}

		let retry_after_secs = match self.events.front() {
			Some(oldest) => {
				let elapsed = now.duration_since(*oldest);
				WINDOW.saturating_sub(elapsed).as_secs().max(1)
			}
			None => 1,
		};

		RateDecision::Limited { retry_after_secs }
	}

	fn is_idle(&self, now: Instant) -> bool {
		match self.events.back() {
			Some(last) => now.duration_since(*last) >= WINDOW,
			None => true,
		}
	}
}

/// Coarse per-IP admission limiter applied before any identity is known.
#[derive(Debug)]
pub struct IpRateLimiter {
	per_ip: HashMap<IpAddr, SlidingWindow>,
	admissions_per_minute: u32,
	max_tracked: usize,
}

impl IpRateLimiter {
	pub fn new(admissions_per_minute: u32) -> Self {
		Self {
			per_ip: HashMap::new(),
			admissions_per_minute,
			max_tracked: 4096,
		}
	}

	/// Checks and records one admission attempt for `ip`.
	pub fn check(&mut self, ip: IpAddr) -> RateDecision {
		self.check_at(ip, Instant::now())
	}

	fn check_at(&mut self, ip: IpAddr, now: Instant) -> RateDecision {
		if self.admissions_per_minute == 0 {
			return RateDecision::Allowed;
		}

		if self.per_ip.len() >= self.max_tracked && !self.per_ip.contains_key(&ip) {
			self.per_ip.retain(|_, w| !w.is_idle(now));
		}

		self.per_ip
			.entry(ip)
			.or_default()
			.check_and_record(now, self.admissions_per_minute)
	}
}

/// Per-user, per-message-type limiter applied after authentication.
///
/// Messages longer than `long_message_chars` get a doubled allowance, so a
/// burst of short messages cannot exhaust the budget for substantive ones.
#[derive(Debug)]
pub struct UserRateLimiter {
	windows: HashMap<(UserId, &'static str), SlidingWindow>,
	events_per_minute: u32,
	long_message_chars: usize,
	max_tracked: usize,
}

impl UserRateLimiter {
	pub fn new(events_per_minute: u32, long_message_chars: usize) -> Self {
		Self {
			windows: HashMap::new(),
			events_per_minute,
			long_message_chars,
			max_tracked: 8192,
		}
	}

	/// Checks one event of `kind` for `user`.
	///
	/// `content_len` applies only to message sends; pass `None` for other
	/// kinds.
	pub fn check(&mut self, user: &UserId, kind: &'static str, content_len: Option<usize>) -> RateDecision {
		self.check_at(user, kind, content_len, Instant::now())
	}

	fn check_at(&mut self, user: &UserId, kind: &'static str, content_len: Option<usize>, now: Instant) -> RateDecision {
		if self.events_per_minute == 0 {
			return RateDecision::Allowed;
		}

		let limit = match content_len {
			Some(len) if len > self.long_message_chars => self.events_per_minute.saturating_mul(2),
			_ => self.events_per_minute,
		};

		let key = (user.clone(), kind);
		if self.windows.len() >= self.max_tracked && !self.windows.contains_key(&key) {
			self.windows.retain(|_, w| !w.is_idle(now));
		}

		self.windows.entry(key).or_default().check_and_record(now, limit)
	}

	/// Drops all state for a user, typically on disconnect.
	pub fn forget(&mut self, user: &UserId) {
		self.windows.retain(|(u, _), _| u != user);
	}
}

/// Tracks live connection counts per source IP.
#[derive(Debug, Default)]
pub struct IpConnectionQuota {
	counts: HashMap<IpAddr, u32>,
}

impl IpConnectionQuota {
	/// Reserves a connection slot for `ip` if under `max`.
	pub fn try_acquire(&mut self, ip: IpAddr, max: u32) -> bool {
		let count = self.counts.entry(ip).or_insert(0);
		if *count >= max {
			return false;
		}
		*count += 1;
		true
	}

	/// Releases a previously acquired slot.
	pub fn release(&mut self, ip: IpAddr) {
		match self.counts.get_mut(&ip) {
			Some(count) if *count > 1 => *count -= 1,
			Some(_) => {
				self.counts.remove(&ip);
			}
			None => {}
		}
	}

	pub fn count(&self, ip: IpAddr) -> u32 {
		self.counts.get(&ip).copied().unwrap_or(0)
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;

	pub fn check_user_at(
		limiter: &mut UserRateLimiter,
		user: &UserId,
		kind: &'static str,
		content_len: Option<usize>,
		now: Instant,
	) -> RateDecision {
		limiter.check_at(user, kind, content_len, now)
	}

	pub fn check_ip_at(limiter: &mut IpRateLimiter, ip: IpAddr, now: Instant) -> RateDecision {
		limiter.check_at(ip, now)
	}
}
