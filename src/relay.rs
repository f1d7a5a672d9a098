//! Room relay
//!
//! The route table served by the binary. Every connection on `/rooms` gets
//! its own consumer group on the room topic and shares the pooled producer
//! for it; inbound messages are validated and published, and every event on
//! the topic is forwarded to every connection.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::broker::{bus_handler, BusEvent};
use crate::chain::{handler, Handler, Next};
use crate::connection::Connection;
use crate::error::AppError;
use crate::ledger::BrokerLedger;
use crate::message::ServerMessage;
use crate::router::RouteTable;
use crate::types::Event;

/// Path the relay is served on
pub const ROOMS_PATH: &str = "/rooms";

/// Build the relay route table over `ledger`, publishing on `topic`
pub fn routes(ledger: Arc<BrokerLedger>, topic: &str) -> RouteTable {
    let mut table = RouteTable::new();
    table
        .register(ROOMS_PATH, Event::Connection, [join(ledger.clone(), topic)])
        .register(ROOMS_PATH, Event::Message, [validate_chat(), publish(ledger.clone(), topic)])
        .register(ROOMS_PATH, Event::Close, [leave(ledger, topic)]);
    table
}

fn join(ledger: Arc<BrokerLedger>, topic: &str) -> Handler {
    let topic = topic.to_string();
    handler(move |conn: Connection, _ctx, next: Next| {
        let ledger = ledger.clone();
        let topic = topic.clone();
        async move {
            let group = conn.id.to_string();
            ledger.add_producer(&topic).await?;
            if let Err(e) = ledger.add_consumer(&group, &[topic.clone()]).await {
                ledger.remove_producer(&topic).await?;
                return Err(e);
            }

            let target = conn.clone();
            ledger
                .register_consumer_handler(
                    &group,
                    bus_handler(move |event: BusEvent| {
                        let target = target.clone();
                        async move {
                            target
                                .send(ServerMessage::Event {
                                    key: event.key,
                                    value: event.value,
                                })
                                .await?;
                            Ok(())
                        }
                    }),
                )
                .await?;

            conn.send(ServerMessage::Connected { client_id: group }).await?;
            next.advance()
        }
    })
}

/// Require a JSON object with a non-empty string `content`
fn validate_chat() -> Handler {
    handler(|conn: Connection, ctx: Value, next: Next| async move {
        match ctx.get("content").and_then(Value::as_str) {
            Some(content) if !content.trim().is_empty() => next.replace(json!({
                "from": conn.id.to_string(),
                "content": content,
            })),
            _ => next.fail(AppError::Validation(
                "message must be an object with non-empty string 'content'".to_string(),
            )),
        }
    })
}

fn publish(ledger: Arc<BrokerLedger>, topic: &str) -> Handler {
    let topic = topic.to_string();
    handler(move |conn: Connection, ctx: Value, next: Next| {
        let ledger = ledger.clone();
        let topic = topic.clone();
        async move {
            ledger
                .submit_event(&topic, BusEvent::new(conn.id.to_string(), Some(ctx)))
                .await?;
            next.advance()
        }
    })
}

fn leave(ledger: Arc<BrokerLedger>, topic: &str) -> Handler {
    let topic = topic.to_string();
    handler(move |conn: Connection, _ctx, next: Next| {
        let ledger = ledger.clone();
        let topic = topic.clone();
        async move {
            let group = conn.id.to_string();
            // Only connections that finished joining hold a producer reference
            if !ledger.has_consumer(&group).await {
                return next.advance();
            }
            ledger.remove_consumer(&group).await?;
            ledger.remove_producer(&topic).await?;
            debug!("Connection {} left {}", conn.id, topic);
            next.advance()
        }
    })
}
