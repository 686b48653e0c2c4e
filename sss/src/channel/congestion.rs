//! Pluggable congestion control (spec.md §4.2): `tx_window`, `reset`, `missed`,
//! `timeout`, `update`, `rtt_update`. [`Reno`] is the minimal conformant
//! implementation spec.md §4.2 allows for: TCP-Reno-style slow start followed by
//! additive-increase/multiplicative-decrease, windowed in packets.

use std::time::Duration;

pub trait CongestionControl {
	/// Current transmit window, in packets.
	fn tx_window(&self) -> u32;

	fn reset(&mut self);

	/// A single packet has been inferred lost — unacked past the missed
	/// threshold, though not yet past its hard expiry.
	fn missed(&mut self, seq: u64);

	/// The retransmission timer fired with packets still in flight.
	fn timeout(&mut self);

	/// `new_acks` packets were newly acknowledged by the same incoming ACK.
	fn update(&mut self, new_acks: u32);

	fn rtt_update(&mut self, pps: u32, rtt: Duration);
}

const INITIAL_WINDOW: f64 = 4.0;
const MIN_WINDOW: f64 = 2.0;

pub struct Reno {
	cwnd: f64,
	ssthresh: f64,
}

impl Default for Reno {
	fn default() -> Self {
		Self { cwnd: INITIAL_WINDOW, ssthresh: f64::MAX }
	}
}

impl CongestionControl for Reno {
	fn tx_window(&self) -> u32 {
		self.cwnd as u32
	}

	fn reset(&mut self) {
		*self = Self::default();
	}

	fn missed(&mut self, _seq: u64) {
		self.ssthresh = (self.cwnd / 2.0).max(MIN_WINDOW);
		self.cwnd = self.ssthresh;
	}

	fn timeout(&mut self) {
		self.ssthresh = (self.cwnd / 2.0).max(MIN_WINDOW);
		self.cwnd = 1.0;
	}

	fn update(&mut self, new_acks: u32) {
		for _ in 0..new_acks {
			if self.cwnd < self.ssthresh {
				self.cwnd += 1.0;
			} else {
				self.cwnd += 1.0 / self.cwnd;
			}
		}
	}

	fn rtt_update(&mut self, _pps: u32, _rtt: Duration) {}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slow_start_grows_the_window_per_ack() {
		let mut reno = Reno::default();
		let start = reno.tx_window();

		reno.update(3);
		assert!(reno.tx_window() > start);
	}

	#[test]
	fn loss_halves_the_window_and_sets_ssthresh() {
		let mut reno = Reno::default();
		reno.update(20);
		let before = reno.cwnd;

		reno.missed(100);
		assert!(reno.cwnd < before);
		assert_eq!(reno.cwnd, reno.ssthresh);
	}

	#[test]
	fn timeout_resets_to_one_segment() {
		let mut reno = Reno::default();
		reno.update(20);

		reno.timeout();
		assert_eq!(reno.tx_window(), 1);
	}

	#[test]
	fn congestion_avoidance_grows_slower_than_slow_start() {
		let mut reno = Reno::default();
		reno.missed(0); // forces ssthresh down so we're immediately past slow start
		let ssthresh = reno.ssthresh;
		reno.cwnd = ssthresh;

		let before = reno.cwnd;
		reno.update(1);
		assert!(reno.cwnd - before < 1.0);
	}
}
