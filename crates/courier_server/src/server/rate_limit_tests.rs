#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use courier_domain::UserId;

use crate::server::rate_limit::test_support::{check_ip_at, check_user_at};
use crate::server::rate_limit::{IpConnectionQuota, IpRateLimiter, RateDecision, UserRateLimiter, WINDOW};

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid user id")
}

#[test]
fn user_limiter_allows_up_to_limit_then_denies() {
	let mut limiter = UserRateLimiter::new(3, 500);
	let alice = user("alice");
	let now = Instant::now();

	for _ in 0..3 {
		assert!(check_user_at(&mut limiter, &alice, "send_private_message", Some(10), now).is_allowed());
	}

	match check_user_at(&mut limiter, &alice, "send_private_message", Some(10), now) {
		RateDecision::Limited { retry_after_secs } => {
			assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
		}
		RateDecision::Allowed => panic!("expected rate limit"),
	}
}

#[test]
fn user_limiter_window_slides() {
	let mut limiter = UserRateLimiter::new(2, 500);
	let alice = user("alice");
	let start = Instant::now();

	assert!(check_user_at(&mut limiter, &alice, "typing", None, start).is_allowed());
	assert!(check_user_at(&mut limiter, &alice, "typing", None, start).is_allowed());
	assert!(!check_user_at(&mut limiter, &alice, "typing", None, start).is_allowed());

	let later = start + WINDOW + Duration::from_secs(1);
	assert!(check_user_at(&mut limiter, &alice, "typing", None, later).is_allowed());
}

#[test]
fn long_messages_get_doubled_allowance() {
	let mut limiter = UserRateLimiter::new(2, 500);
	let alice = user("alice");
	let now = Instant::now();
	let long = Some(501);

	for _ in 0..4 {
		assert!(check_user_at(&mut limiter, &alice, "send_private_message", long, now).is_allowed());
	}
	assert!(!check_user_at(&mut limiter, &alice, "send_private_message", long, now).is_allowed());
}

#[test]
fn kinds_are_limited_independently() {
	let mut limiter = UserRateLimiter::new(1, 500);
	let alice = user("alice");
	let now = Instant::now();

	assert!(check_user_at(&mut limiter, &alice, "typing", None, now).is_allowed());
	assert!(check_user_at(&mut limiter, &alice, "add_reaction", None, now).is_allowed());
	assert!(!check_user_at(&mut limiter, &alice, "typing", None, now).is_allowed());
}

#[test]
fn users_are_limited_independently() {
	let mut limiter = UserRateLimiter::new(1, 500);
	let now = Instant::now();

	assert!(check_user_at(&mut limiter, &user("alice"), "typing", None, now).is_allowed());
	assert!(check_user_at(&mut limiter, &user("bob"), "typing", None, now).is_allowed());
}

#[test]
fn forget_clears_user_state() {
	let mut limiter = UserRateLimiter::new(1, 500);
	let alice = user("alice");
	let now = Instant::now();

	assert!(check_user_at(&mut limiter, &alice, "typing", None, now).is_allowed());
	assert!(!check_user_at(&mut limiter, &alice, "typing", None, now).is_allowed());

	limiter.forget(&alice);
	assert!(check_user_at(&mut limiter, &alice, "typing", None, now).is_allowed());
}

#[test]
fn ip_limiter_denies_after_burst() {
	let mut limiter = IpRateLimiter::new(2);
	let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
	let now = Instant::now();

	assert!(check_ip_at(&mut limiter, ip, now).is_allowed());
	assert!(check_ip_at(&mut limiter, ip, now).is_allowed());
	assert!(!check_ip_at(&mut limiter, ip, now).is_allowed());

	let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8));
	assert!(check_ip_at(&mut limiter, other, now).is_allowed());
}

#[test]
fn zero_limit_disables_limiting() {
	let mut limiter = UserRateLimiter::new(0, 500);
	let alice = user("alice");
	let now = Instant::now();

	for _ in 0..100 {
		assert!(check_user_at(&mut limiter, &alice, "typing", None, now).is_allowed());
	}
}

#[test]
fn connection_quota_acquire_release() {
	let mut quota = IpConnectionQuota::default();
	let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

	assert!(quota.try_acquire(ip, 2));
	assert!(quota.try_acquire(ip, 2));
	assert!(!quota.try_acquire(ip, 2));
	assert_eq!(quota.count(ip), 2);

	quota.release(ip);
	assert!(quota.try_acquire(ip, 2));

	quota.release(ip);
	quota.release(ip);
	assert_eq!(quota.count(ip), 0);
}
