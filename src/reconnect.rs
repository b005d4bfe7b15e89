/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the reconnect strategy interface consulted after non-clean session
terminations, the strategies shipped with the crate, and the controller state that binds a
strategy to the client event loop.
 */

use crate::error::BasaltError;
use crate::mqtt::ConnectReturnCode;

use log::*;
use rand::Rng;

use std::time::Duration;

/// Decision/wait oracle driving automatic reconnection.
///
/// After every non-clean session termination the client asks `should_reconnect`; a true
/// answer consumes one attempt and leads to a `wait`-long pause before a fresh transport is
/// requested and the session re-driven with the original connect options.  `reset` is called
/// on every successful CONNACK.
pub trait ReconnectStrategy: Send {

    /// Returns whether a new connection attempt should be made after a termination with the
    /// given reason
    fn should_reconnect(&mut self, reason: &BasaltError) -> bool;

    /// Returns how long to wait before the next connection attempt
    fn wait(&mut self) -> Duration;

    /// Notifies the strategy that a connection attempt succeeded
    fn reset(&mut self);
}

/// Termination reasons no strategy should retry: the user asked for the disconnect, or the
/// broker rejected the credentials/protocol in a way a retry cannot fix.
pub(crate) fn is_termination_retriable(reason: &BasaltError) -> bool {
    match reason {
        BasaltError::UserInitiatedDisconnect(_) => { false }
        BasaltError::ConnectionRejected(context) => {
            !matches!(context.status,
                ConnectReturnCode::NotAuthorized
                | ConnectReturnCode::UnacceptableProtocolVersion
                | ConnectReturnCode::BadUsernameOrPassword)
        }
        _ => { true }
    }
}

pub(crate) const DEFAULT_RECONNECT_ATTEMPTS: u32 = 60;
pub(crate) const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// The default reconnect strategy: a fixed interval between attempts and a bound on the
/// number of attempts since the last successful CONNACK.
pub struct FixedDelayStrategy {
    max_attempts: u32,
    interval: Duration,
    attempts: u32,
}

impl FixedDelayStrategy {

    /// Creates a fixed-delay strategy with an explicit attempt bound and interval
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        FixedDelayStrategy {
            max_attempts,
            interval,
            attempts: 0,
        }
    }
}

impl Default for FixedDelayStrategy {
    fn default() -> Self {
        FixedDelayStrategy::new(DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL)
    }
}

impl ReconnectStrategy for FixedDelayStrategy {
    fn should_reconnect(&mut self, reason: &BasaltError) -> bool {
        if !is_termination_retriable(reason) {
            info!("FixedDelayStrategy - refusing reconnect: {}", reason);
            return false;
        }

        if self.attempts >= self.max_attempts {
            info!("FixedDelayStrategy - refusing reconnect: attempt limit ({}) reached", self.max_attempts);
            return false;
        }

        self.attempts += 1;
        true
    }

    fn wait(&mut self) -> Duration {
        self.interval
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Reconnect strategy with doubling delays and uniform jitter, for deployments where many
/// clients losing one broker must not stampede it on recovery.
pub struct ExponentialBackoffJitterStrategy {
    base_delay: Duration,
    maximum_delay: Duration,
    current_cap: Duration,
}

impl ExponentialBackoffJitterStrategy {

    /// Creates a jittered exponential backoff strategy ranging between a base delay and a cap
    pub fn new(base_delay: Duration, maximum_delay: Duration) -> Self {
        ExponentialBackoffJitterStrategy {
            base_delay,
            maximum_delay,
            current_cap: base_delay,
        }
    }
}

impl ReconnectStrategy for ExponentialBackoffJitterStrategy {
    fn should_reconnect(&mut self, reason: &BasaltError) -> bool {
        if !is_termination_retriable(reason) {
            info!("ExponentialBackoffJitterStrategy - refusing reconnect: {}", reason);
            return false;
        }

        true
    }

    fn wait(&mut self) -> Duration {
        let delay =
            if self.current_cap > self.base_delay {
                rand::thread_rng().gen_range(self.base_delay..=self.current_cap)
            } else {
                self.base_delay
            };

        self.current_cap = Duration::min(self.current_cap.saturating_mul(2), self.maximum_delay);

        delay
    }

    fn reset(&mut self) {
        self.current_cap = self.base_delay;
    }
}

/// Per-client reconnect state: the configured strategy (if any) plus the pre-first-CONNACK
/// attempt accounting demanded by the `reconnect_unready` policy.
pub(crate) struct ReconnectController {
    strategy: Option<Box<dyn ReconnectStrategy>>,
    reconnect_unready: bool,
    max_unready_attempts: u32,
    unready_attempts: u32,
    has_connected: bool,
}

impl ReconnectController {
    pub(crate) fn new(strategy: Option<Box<dyn ReconnectStrategy>>, reconnect_unready: bool, max_unready_attempts: u32) -> Self {
        ReconnectController {
            strategy,
            reconnect_unready,
            max_unready_attempts,
            unready_attempts: 0,
            has_connected: true,
        }
    }

    /// Marks the beginning of a user-requested connect; pre-CONNACK attempt accounting starts
    /// over from here.
    pub(crate) fn on_connect_requested(&mut self) {
        self.has_connected = false;
        self.unready_attempts = 0;
    }

    /// Called on every successful CONNACK
    pub(crate) fn on_connection_success(&mut self) {
        self.has_connected = true;
        self.unready_attempts = 0;
        if let Some(strategy) = &mut self.strategy {
            strategy.reset();
        }
    }

    /// Consults the strategy about a session termination.  Returns how long to back off
    /// before the next attempt, or None to propagate terminal disconnect.
    pub(crate) fn decide(&mut self, reason: &BasaltError) -> Option<Duration> {
        let strategy = self.strategy.as_mut()?;

        if !self.has_connected && !self.reconnect_unready {
            if self.unready_attempts >= self.max_unready_attempts {
                info!("ReconnectController - refusing pre-CONNACK reconnect: attempt limit ({}) reached", self.max_unready_attempts);
                return None;
            }

            self.unready_attempts += 1;
        }

        if !strategy.should_reconnect(reason) {
            return None;
        }

        Some(strategy.wait())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn transport_loss() -> BasaltError {
        BasaltError::new_connection_closed("transport interrupted")
    }

    #[test]
    fn fixed_delay_refuses_auth_class_rejections() {
        let mut strategy = FixedDelayStrategy::default();

        assert!(!strategy.should_reconnect(&BasaltError::new_connection_rejected(ConnectReturnCode::NotAuthorized)));
        assert!(!strategy.should_reconnect(&BasaltError::new_connection_rejected(ConnectReturnCode::BadUsernameOrPassword)));
        assert!(!strategy.should_reconnect(&BasaltError::new_connection_rejected(ConnectReturnCode::UnacceptableProtocolVersion)));

        assert!(strategy.should_reconnect(&BasaltError::new_connection_rejected(ConnectReturnCode::ServerUnavailable)));
        assert!(strategy.should_reconnect(&BasaltError::new_connection_rejected(ConnectReturnCode::IdentifierRejected)));
    }

    #[test]
    fn fixed_delay_refuses_user_initiated_disconnects() {
        let mut strategy = FixedDelayStrategy::default();

        assert!(!strategy.should_reconnect(&BasaltError::new_user_initiated_disconnect(false)));
        assert!(!strategy.should_reconnect(&BasaltError::new_user_initiated_disconnect(true)));
    }

    #[test]
    fn fixed_delay_bounds_attempts_and_resets() {
        let mut strategy = FixedDelayStrategy::new(2, Duration::from_millis(5));

        assert!(strategy.should_reconnect(&transport_loss()));
        assert!(strategy.should_reconnect(&transport_loss()));
        assert!(!strategy.should_reconnect(&transport_loss()));

        strategy.reset();
        assert!(strategy.should_reconnect(&transport_loss()));
        assert_eq!(Duration::from_millis(5), strategy.wait());
    }

    #[test]
    fn default_strategy_allows_sixty_attempts() {
        let mut strategy = FixedDelayStrategy::default();

        for _ in 0..DEFAULT_RECONNECT_ATTEMPTS {
            assert!(strategy.should_reconnect(&transport_loss()));
        }

        assert!(!strategy.should_reconnect(&transport_loss()));
        assert_eq!(DEFAULT_RECONNECT_INTERVAL, strategy.wait());
    }

    #[test]
    fn exponential_backoff_stays_within_bounds_and_doubles() {
        let base = Duration::from_millis(100);
        let maximum = Duration::from_millis(1000);
        let mut strategy = ExponentialBackoffJitterStrategy::new(base, maximum);

        assert_eq!(base, strategy.wait());

        for _ in 0..16 {
            let delay = strategy.wait();
            assert!(delay >= base);
            assert!(delay <= maximum);
        }

        strategy.reset();
        assert_eq!(base, strategy.wait());
    }

    #[test]
    fn controller_bounds_unready_attempts() {
        let mut controller = ReconnectController::new(
            Some(Box::new(FixedDelayStrategy::new(100, Duration::from_millis(1)))),
            false,
            2,
        );

        controller.on_connect_requested();

        assert!(controller.decide(&transport_loss()).is_some());
        assert!(controller.decide(&transport_loss()).is_some());
        assert!(controller.decide(&transport_loss()).is_none());

        // reaching CONNACK lifts the pre-ready bound
        controller.on_connection_success();
        assert!(controller.decide(&transport_loss()).is_some());
    }

    #[test]
    fn controller_with_unready_policy_follows_strategy_only() {
        let mut controller = ReconnectController::new(
            Some(Box::new(FixedDelayStrategy::new(5, Duration::from_millis(1)))),
            true,
            2,
        );

        controller.on_connect_requested();

        for _ in 0..5 {
            assert!(controller.decide(&transport_loss()).is_some());
        }

        assert!(controller.decide(&transport_loss()).is_none());
    }

    #[test]
    fn controller_without_strategy_never_reconnects() {
        let mut controller = ReconnectController::new(None, true, u32::MAX);
        controller.on_connect_requested();

        assert!(controller.decide(&transport_loss()).is_none());
    }
}
