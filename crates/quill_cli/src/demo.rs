//! The schema served by `quill serve`.
//!
//! ```graphql
//! type Query { hello(name: String = "world"): String  now: Int }
//! type Mutation { publish(message: String!): Int }
//! type Subscription { messages: String  time(every: Int = 1000): Int }
//! ```

use quill_runtime::{
    FieldDef, InputFieldDef, ObjectDef, Schema, SchemaBuilder, SchemaError, SourceStream, TypeRef,
};
use quill_sdk::PubSub;
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MESSAGES: &str = "messages";

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

pub fn schema(pubsub: &PubSub) -> Result<Schema, SchemaError> {
    let query = ObjectDef::new("Query")
        .with_field(
            FieldDef::new("hello", TypeRef::named("String"))
                .with_argument(
                    InputFieldDef::new("name", TypeRef::named("String"))
                        .with_default(json!("world")),
                )
                .resolve_with(|field| {
                    let name: String = field.args.get_as("name").unwrap_or_default();
                    Ok(json!(format!("Hello, {name}!")))
                }),
        )
        .with_field(
            FieldDef::new("now", TypeRef::named("Int")).resolve_with(|_| Ok(json!(unix_seconds()))),
        );

    let publisher = pubsub.clone();
    let mutation = ObjectDef::new("Mutation").with_field(
        FieldDef::new("publish", TypeRef::named("Int"))
            .with_description("Publishes a message; returns how many subscribers received it.")
            .with_argument(InputFieldDef::new(
                "message",
                TypeRef::non_null(TypeRef::named("String")),
            ))
            .resolve_with(move |field| {
                let message: String = field.args.require("message")?;
                Ok(json!(publisher.publish(MESSAGES, json!(message))))
            }),
    );

    let subscriber = pubsub.clone();
    let subscription = ObjectDef::new("Subscription")
        .with_field(
            FieldDef::new("messages", TypeRef::named("String"))
                .subscribe_with(move |_| Ok(subscriber.subscribe(MESSAGES))),
        )
        .with_field(
            FieldDef::new("time", TypeRef::named("Int"))
                .with_argument(
                    InputFieldDef::new("every", TypeRef::named("Int")).with_default(json!(1000)),
                )
                .subscribe_with(|field| {
                    let every: u64 = field.args.get_as("every").unwrap_or(1000);
                    Ok(ticker(Duration::from_millis(every.max(10))))
                }),
        );

    SchemaBuilder::new()
        .add_type(query)
        .add_type(mutation)
        .add_type(subscription)
        .mutation_type("Mutation")
        .subscription_type("Subscription")
        .build()
}

/// Emits the current unix time every `period` until stopped.
fn ticker(period: Duration) -> SourceStream {
    let (tx, stream) = SourceStream::channel(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if tx.send(json!(unix_seconds())).await.is_err() {
                break;
            }
        }
    });
    stream
}
