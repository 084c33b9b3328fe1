//! Event domain: container lifecycle events from the engine.

use super::client::{DockerClient, DockerError};
use crate::runtime::{EventStream, RuntimeEvent, RuntimeEventKind};

use bollard::models::EventMessage;
use futures_util::stream::StreamExt;

impl DockerClient {
    /// Stream container create/start/die/destroy events.
    pub fn stream_container_events(&self, since: Option<i64>) -> EventStream {
        use bollard::query_parameters::EventsOptionsBuilder;
        use std::collections::HashMap;

        let mut filters = HashMap::new();
        filters.insert("type", vec!["container"]);
        filters.insert("event", vec!["create", "start", "die", "destroy"]);

        let since_str = since.map(|s| s.to_string());

        let mut builder = EventsOptionsBuilder::default();
        builder = builder.filters(&filters);
        if let Some(ref s) = since_str {
            builder = builder.since(s);
        }
        let options = builder.build();

        let client = self.client.clone();

        let events = async_stream::stream! {
            let mut messages = Box::pin(client.events(Some(options)));
            while let Some(result) = messages.next().await {
                match result {
                    Ok(message) => {
                        if let Some(event) = runtime_event(message) {
                            yield Ok(event);
                        }
                    }
                    Err(e) => yield Err(DockerError::from(e)),
                }
            }
        };

        Box::pin(events)
    }
}

/// Converts an engine message, dropping actions the gateway does not track.
pub(crate) fn runtime_event(message: EventMessage) -> Option<RuntimeEvent> {
    let kind = RuntimeEventKind::from_action(message.action.as_deref()?)?;
    let actor = message.actor?;
    let container_id = actor.id?;
    let name = actor
        .attributes
        .and_then(|mut attrs| attrs.remove("name"));

    Some(RuntimeEvent {
        container_id,
        name,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EventActor;
    use std::collections::HashMap;

    fn message(action: &str, name: Option<&str>) -> EventMessage {
        let attributes = name.map(|n| HashMap::from([("name".to_string(), n.to_string())]));
        EventMessage {
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some("abc123".to_string()),
                attributes,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_tracked_actions_convert() {
        let event = runtime_event(message("start", Some("simnet_geth_1"))).unwrap();
        assert_eq!(event.kind, RuntimeEventKind::Started);
        assert_eq!(event.container_id, "abc123");
        assert_eq!(event.name.as_deref(), Some("simnet_geth_1"));

        let event = runtime_event(message("destroy", None)).unwrap();
        assert_eq!(event.kind, RuntimeEventKind::Destroyed);
        assert!(event.name.is_none());
    }

    #[test]
    fn test_untracked_actions_are_dropped() {
        assert!(runtime_event(message("exec_start: sh", Some("simnet_geth_1"))).is_none());
        assert!(runtime_event(message("attach", Some("simnet_geth_1"))).is_none());
        assert!(runtime_event(EventMessage::default()).is_none());
    }
}
