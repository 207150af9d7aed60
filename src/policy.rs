// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Failure Policy
//!
//! Decides the fate of a delivery once its handler has run. The handler's result is
//! classified into a `DeliveryOutcome`, and the outcome is turned into a `Disposition`
//! telling the channel whether to commit, abort or forward a copy of the wire delivery.
//!
//! Attempt counting: the `x-attempt-count` header holds the number of failed attempts so
//! far. A failure bumps it; once it reaches the configured maximum the delivery is
//! poisoned instead of retried, so `max_attempts = k` yields `k - 1` retries.

use crate::{
    adapter::MessageAdapter,
    address::PublicationAddress,
    configuration::ChannelGroupConfiguration,
    errors::{ChannelError, HandlerError},
    wire::WireMessage,
};
use tracing::{info, warn};

/// Classified result of handling one delivery.
#[derive(Debug)]
pub(crate) enum DeliveryOutcome {
    Delivered,
    /// The transport is gone; the channel must be discarded
    Disconnected(ChannelError),
    /// The delivery can never be processed
    Poison(HandlerError),
    /// Forward without processing
    DeadLetter,
    /// Processing failed; try again later
    Retry(HandlerError),
}

/// What the channel must do to settle a delivery.
#[derive(Debug)]
pub(crate) enum Disposition {
    Commit,
    Abort(ChannelError),
    /// Publish `message` to `destination` in its own transaction; no destination drops it.
    Forward {
        destination: Option<PublicationAddress>,
        message: WireMessage,
    },
}

pub(crate) fn classify(result: Result<(), HandlerError>) -> DeliveryOutcome {
    match result {
        Ok(()) => DeliveryOutcome::Delivered,
        Err(HandlerError::Channel(err)) if err.is_connection() => {
            DeliveryOutcome::Disconnected(err)
        }
        Err(err @ HandlerError::Serialization(_)) => DeliveryOutcome::Poison(err),
        Err(HandlerError::DeadLetter(reason)) => {
            info!(reason, "handler requested dead-lettering");
            DeliveryOutcome::DeadLetter
        }
        Err(err) => DeliveryOutcome::Retry(err),
    }
}

/// Turns an outcome into the action settling the given wire delivery.
pub(crate) fn settle(
    outcome: DeliveryOutcome,
    delivery: &WireMessage,
    config: &ChannelGroupConfiguration,
    adapter: &MessageAdapter,
) -> Disposition {
    match outcome {
        DeliveryOutcome::Delivered => Disposition::Commit,
        DeliveryOutcome::Disconnected(err) => Disposition::Abort(err),
        DeliveryOutcome::DeadLetter => {
            info!(
                message_id = delivery.message_id(),
                "forwarding delivery to the dead-letter exchange"
            );
            Disposition::Forward {
                destination: config.dead_letter_exchange().cloned(),
                message: delivery.clone(),
            }
        }
        DeliveryOutcome::Poison(cause) => poison(delivery, &cause, config, adapter),
        DeliveryOutcome::Retry(cause) => {
            let attempts = delivery.attempt_count().saturating_add(1);
            warn!(
                message_id = delivery.message_id(),
                attempts,
                error = cause.to_string(),
                "delivery failed"
            );

            if attempts >= config.max_attempts() {
                return poison(delivery, &cause, config, adapter);
            }

            let mut retry = delivery.clone();
            retry.set_attempt_count(attempts);
            Disposition::Forward {
                destination: config.input_address(),
                message: retry,
            }
        }
    }
}

fn poison(
    delivery: &WireMessage,
    cause: &HandlerError,
    config: &ChannelGroupConfiguration,
    adapter: &MessageAdapter,
) -> Disposition {
    info!(
        message_id = delivery.message_id(),
        error = cause.to_string(),
        "forwarding delivery to the poison exchange"
    );

    let mut poisoned = delivery.clone();
    poisoned.set_attempt_count(0);
    if let Some(input) = config.input_address() {
        adapter.append_retry_address(&mut poisoned, &input);
    }
    adapter.append_exception(&mut poisoned, cause);

    Disposition::Forward {
        destination: Some(config.poison_message_exchange().clone()),
        message: poisoned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::SerializationError, wire::header_to_string};
    use lapin::BasicProperties;

    fn config() -> ChannelGroupConfiguration {
        ChannelGroupConfiguration::builder()
            .with_input_queue("billing")
            .with_max_attempts(3)
            .unwrap()
            .build()
    }

    fn delivery(attempts: Option<u32>) -> WireMessage {
        let mut wire = WireMessage::new("invoice", BasicProperties::default(), b"[]".to_vec());
        if let Some(attempts) = attempts {
            wire.set_attempt_count(attempts);
        }
        wire
    }

    fn failure() -> HandlerError {
        HandlerError::failed("boom")
    }

    #[test]
    fn classifies_handler_results() {
        assert!(matches!(classify(Ok(())), DeliveryOutcome::Delivered));
        assert!(matches!(
            classify(Err(ChannelError::Connection("reset".to_owned()).into())),
            DeliveryOutcome::Disconnected(_)
        ));
        assert!(matches!(
            classify(Err(SerializationError::new("bad").into())),
            DeliveryOutcome::Poison(_)
        ));
        assert!(matches!(
            classify(Err(HandlerError::DeadLetter("expired".to_owned()))),
            DeliveryOutcome::DeadLetter
        ));
        assert!(matches!(
            classify(Err(ChannelError::Shutdown.into())),
            DeliveryOutcome::Retry(_)
        ));
        assert!(matches!(classify(Err(failure())), DeliveryOutcome::Retry(_)));
    }

    #[test]
    fn failures_are_retried_to_the_input_queue_until_the_last_attempt() {
        let config = config();
        let adapter = config.message_adapter().clone();

        for previous in [None, Some(1)] {
            let disposition = settle(
                DeliveryOutcome::Retry(failure()),
                &delivery(previous),
                &config,
                &adapter,
            );

            let Disposition::Forward { destination, message } = disposition else {
                panic!("expected a forward");
            };
            assert_eq!(destination, Some(PublicationAddress::queue("billing")));
            assert_eq!(message.attempt_count(), previous.unwrap_or(0) + 1);
        }
    }

    #[test]
    fn last_failed_attempt_poisons_with_a_reset_counter() {
        let config = config();
        let adapter = config.message_adapter().clone();

        let disposition = settle(
            DeliveryOutcome::Retry(failure()),
            &delivery(Some(2)),
            &config,
            &adapter,
        );

        let Disposition::Forward { destination, message } = disposition else {
            panic!("expected a forward");
        };
        assert_eq!(
            destination.map(|d| d.exchange().to_owned()),
            Some("poison-messages".to_owned())
        );
        assert_eq!(message.attempt_count(), 0);
        assert_eq!(
            message.header("x-retry-address").and_then(header_to_string),
            Some("direct://default/billing".to_owned())
        );
        assert_eq!(
            message.header("x-exception0-message").and_then(header_to_string),
            Some("handler failure: boom".to_owned())
        );
    }

    #[test]
    fn dead_letters_go_unchanged_to_the_dead_letter_exchange() {
        let config = config();
        let adapter = config.message_adapter().clone();
        let original = delivery(Some(1));

        let Disposition::Forward { destination, message } =
            settle(DeliveryOutcome::DeadLetter, &original, &config, &adapter)
        else {
            panic!("expected a forward");
        };

        assert_eq!(
            destination,
            Some(PublicationAddress::fanout("dead-letters"))
        );
        assert_eq!(message.attempt_count(), 1);
        assert_eq!(message.id(), original.id());
    }

    #[test]
    fn dead_letters_are_dropped_without_a_dead_letter_exchange() {
        let config = ChannelGroupConfiguration::builder()
            .with_input_queue("billing")
            .without_dead_letter_exchange()
            .build();
        let adapter = config.message_adapter().clone();

        let disposition = settle(DeliveryOutcome::DeadLetter, &delivery(None), &config, &adapter);

        assert!(matches!(
            disposition,
            Disposition::Forward {
                destination: None,
                ..
            }
        ));
    }

    #[test]
    fn disconnection_aborts() {
        let config = config();
        let adapter = config.message_adapter().clone();

        let disposition = settle(
            DeliveryOutcome::Disconnected(ChannelError::Connection("reset".to_owned())),
            &delivery(None),
            &config,
            &adapter,
        );

        assert!(matches!(disposition, Disposition::Abort(ChannelError::Connection(_))));
    }
}
