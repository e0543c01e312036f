//! Built-in command handlers and the bootstrap list that registers them.

pub mod bookmarks;
pub mod keys;
pub mod system;

use std::future::Future;
use std::sync::Arc;

use ahs_core::{AhsResult, KeyRing};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::info;

use crate::dispatch::CommandRegistry;
use bookmarks::BookmarkStore;

/// Shared state the built-in handlers close over.
pub struct CommandContext {
    pub bookmarks: Arc<BookmarkStore>,
    pub keys: Arc<KeyRing>,
}

/// Register every built-in command whose namespace is enabled.
pub fn register_all(registry: &mut CommandRegistry, ctx: &CommandContext) -> AhsResult<()> {
    if registry.has_namespace(bookmarks::NAMESPACE) {
        bookmarks::register(registry, ctx.bookmarks.clone())?;
    }
    if registry.has_namespace(system::NAMESPACE) {
        system::register(registry)?;
    }
    if registry.has_namespace(keys::NAMESPACE) {
        keys::register(registry, ctx.keys.clone())?;
    }
    info!(commands = registry.len(), "command registry ready");
    Ok(())
}

/// Stream the rows produced by `fetch`, or its error.
pub(crate) fn rows<F>(fetch: F) -> BoxStream<'static, anyhow::Result<Value>>
where
    F: Future<Output = anyhow::Result<Vec<Value>>> + Send + 'static,
{
    stream::once(fetch)
        .flat_map(|result| {
            let items: Vec<anyhow::Result<Value>> = match result {
                Ok(rows) => rows.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::bookmarks::Bookmark;
    use super::*;
    use crate::channel_layer::{ChannelLayer, InMemoryChannelLayer};
    use crate::dispatch::CommandDispatcher;
    use ahs_core::ecc::generate_private_key;
    use ahs_core::{ChannelMessage, CommandRequest, Curve, Identity, MemoryKeyStore, ResponseEnvelope};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    const CATEGORY: &str = "0b0e6a4e-9a0f-4d52-9a57-6a1d55a3c111";

    fn context() -> CommandContext {
        CommandContext {
            bookmarks: Arc::new(BookmarkStore::default()),
            keys: Arc::new(KeyRing::new(
                generate_private_key(Curve::Secp256r1),
                Arc::new(MemoryKeyStore::new()),
            )),
        }
    }

    fn bookmark(id: u64, owner: &str, name: &str) -> Bookmark {
        Bookmark {
            id,
            owner: owner.into(),
            uuid: Uuid::parse_str(CATEGORY).unwrap(),
            name: name.into(),
            url: format!("https://example.com/{id}"),
            icon_url: None,
        }
    }

    #[test]
    fn registers_enabled_namespaces_only() {
        let mut registry = CommandRegistry::new(["system"]);
        register_all(&mut registry, &context()).unwrap();
        assert_eq!(
            registry.names(),
            vec![
                ("system".to_string(), "ping".to_string()),
                ("system".to_string(), "whoami".to_string()),
            ]
        );

        let mut registry = CommandRegistry::new(["bookmarks", "system", "keys"]);
        register_all(&mut registry, &context()).unwrap();
        assert_eq!(registry.len(), 5);
    }

    #[tokio::test]
    async fn get_bookmarks_streams_one_envelope_per_record() {
        let ctx = context();
        ctx.bookmarks.add_bookmark(bookmark(1, "7", "Docs")).await;
        ctx.bookmarks.add_bookmark(bookmark(2, "8", "Someone else's")).await;
        ctx.bookmarks.add_bookmark(bookmark(3, "7", "Crates")).await;

        let mut registry = CommandRegistry::new(["bookmarks"]);
        register_all(&mut registry, &ctx).unwrap();
        let layer = Arc::new(InMemoryChannelLayer::new(16));
        let (channel, mut rx) = layer.new_channel("test").await.unwrap();
        let dispatcher = CommandDispatcher::new(Arc::new(registry), layer);

        let req = CommandRequest::new("bookmarks", "get_bookmarks", Identity::user("7", "t", "k"), &channel)
            .with_kwargs(json!({"uuid": CATEGORY}).as_object().cloned().unwrap())
            .with_correlation_id(42);
        assert_eq!(dispatcher.dispatch(req).await, 2);

        let mut got = Vec::new();
        while let Ok(Some(ChannelMessage::CommandResponse(env))) =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            got.push(env);
        }
        let expected: Vec<ResponseEnvelope> = [(1, "Docs"), (3, "Crates")]
            .into_iter()
            .map(|(id, name)| ResponseEnvelope {
                app: "bookmarks".into(),
                cmd: "get_bookmarks".into(),
                data: json!({
                    "id": id,
                    "name": name,
                    "url": format!("https://example.com/{id}"),
                    "icon_url": null,
                    "uuid": CATEGORY,
                }),
                unique_id: json!(42),
            })
            .collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn rows_surfaces_errors_as_items() {
        let items: Vec<_> = rows(async { Err::<Vec<Value>, _>(anyhow::anyhow!("db down")) }).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());

        let items: Vec<_> = rows(async { Ok::<_, anyhow::Error>(vec![json!(1), json!(2)]) }).collect().await;
        assert_eq!(items.len(), 2);
    }
}
