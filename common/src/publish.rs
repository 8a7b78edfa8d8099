use crate::{config::topic, event::Event, rpc::RpcError};

/// Where one event should go. `reply` is only set for RPC-triggered work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Channels<'a> {
    pub reply: bool,
    pub mqtt_topic: Option<&'a str>,
}

impl<'a> Channels<'a> {
    pub fn reply_only() -> Self {
        Self {
            reply: true,
            mqtt_topic: None,
        }
    }

    pub fn mqtt(raw_topic: &'a str) -> Self {
        Self {
            reply: false,
            mqtt_topic: topic(raw_topic),
        }
    }

    pub fn reply_and_mqtt(raw_topic: &'a str) -> Self {
        Self {
            reply: true,
            mqtt_topic: topic(raw_topic),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Reply(Event),
    ReplyError(RpcError),
    Publish { topic: String, event: Event },
}

impl Delivery {
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Reply(_) | Self::ReplyError(_))
    }

    pub fn is_publish(&self) -> bool {
        matches!(self, Self::Publish { .. })
    }
}

/// Fans one event out to the requested channels. The reply always comes
/// first so the RPC caller is answered before telemetry is queued.
pub fn route(event: Event, channels: Channels<'_>) -> Vec<Delivery> {
    match (channels.reply, channels.mqtt_topic) {
        (true, Some(topic)) => vec![
            Delivery::Reply(event.clone()),
            Delivery::Publish {
                topic: topic.to_string(),
                event,
            },
        ],
        (true, None) => vec![Delivery::Reply(event)],
        (false, Some(topic)) => vec![Delivery::Publish {
            topic: topic.to_string(),
            event,
        }],
        (false, None) => Vec::new(),
    }
}

/// Splits deliveries into the RPC answer (if any) and the MQTT publishes.
pub fn split_reply(
    deliveries: Vec<Delivery>,
) -> (Option<Result<Event, RpcError>>, Vec<(String, Event)>) {
    let mut reply = None;
    let mut publishes = Vec::new();

    for delivery in deliveries {
        match delivery {
            Delivery::Reply(event) => reply = Some(Ok(event)),
            Delivery::ReplyError(err) => reply = Some(Err(err)),
            Delivery::Publish { topic, event } => publishes.push((topic, event)),
        }
    }

    (reply, publishes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{build_event, DeviceType, FieldValue};

    fn sample() -> Event {
        build_event(
            "dev1",
            DeviceType::Sonoff,
            None,
            vec![("relay_on", FieldValue::Flag(true))],
        )
    }

    #[test]
    fn reply_and_topic_deliver_twice() {
        let deliveries = route(sample(), Channels::reply_and_mqtt("home/plug"));

        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0], Delivery::Reply(sample()));
        assert_eq!(
            deliveries[1],
            Delivery::Publish {
                topic: "home/plug".to_string(),
                event: sample(),
            }
        );
    }

    #[test]
    fn empty_topic_suppresses_publish() {
        let deliveries = route(sample(), Channels::reply_and_mqtt(""));
        assert_eq!(deliveries, vec![Delivery::Reply(sample())]);

        assert!(route(sample(), Channels::mqtt("")).is_empty());
    }

    #[test]
    fn autonomous_events_never_reply() {
        let deliveries = route(sample(), Channels::mqtt("home/plug"));
        assert!(deliveries.iter().all(Delivery::is_publish));
    }

    #[test]
    fn split_separates_reply_from_publishes() {
        let (reply, publishes) = split_reply(route(sample(), Channels::reply_and_mqtt("t")));

        assert_eq!(reply, Some(Ok(sample())));
        assert_eq!(publishes, vec![("t".to_string(), sample())]);
    }
}
