//! `bookmarks` namespace.

use std::sync::Arc;

use ahs_core::{AhsResult, Identity};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::rows;
use crate::dispatch::{BoundArgs, CommandRegistry, CommandSpec, ParamType};

pub const NAMESPACE: &str = "bookmarks";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    #[serde(default)]
    pub id: u64,
    pub uuid: Uuid,
    pub owner: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Category {
    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "uuid": self.uuid,
            "id": self.id,
            "active": self.active,
        })
    }
}

/// A bookmark filed under the category with the same `uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: u64,
    pub owner: String,
    pub uuid: Uuid,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub icon_url: Option<String>,
}

impl Bookmark {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "url": self.url,
            "icon_url": self.icon_url,
            "uuid": self.uuid,
        })
    }
}

/// In-memory bookmark storage; iteration follows insertion order.
#[derive(Debug, Default)]
pub struct BookmarkStore {
    categories: RwLock<Vec<Category>>,
    bookmarks: RwLock<Vec<Bookmark>>,
}

impl BookmarkStore {
    pub fn new(categories: Vec<Category>, bookmarks: Vec<Bookmark>) -> Self {
        Self {
            categories: RwLock::new(categories),
            bookmarks: RwLock::new(bookmarks),
        }
    }

    pub async fn add_bookmark(&self, bookmark: Bookmark) {
        self.bookmarks.write().await.push(bookmark);
    }

    pub async fn add_category(&self, category: Category) {
        self.categories.write().await.push(category);
    }

    pub async fn bookmarks_for(&self, owner: &str, uuid: Uuid, id: Option<u64>) -> Vec<Bookmark> {
        self.bookmarks
            .read()
            .await
            .iter()
            .filter(|b| b.owner == owner && b.uuid == uuid)
            .filter(|b| id.map_or(true, |id| b.id == id))
            .cloned()
            .collect()
    }

    pub async fn active_categories(&self, owner: &str) -> Vec<Category> {
        self.categories
            .read()
            .await
            .iter()
            .filter(|c| c.owner == owner && c.active)
            .cloned()
            .collect()
    }
}

pub fn register(registry: &mut CommandRegistry, store: Arc<BookmarkStore>) -> AhsResult<()> {
    let bookmarks = store.clone();
    registry.register(
        NAMESPACE,
        CommandSpec::stream("get_bookmarks", move |user, args| {
            rows(get_bookmarks(bookmarks.clone(), user, args))
        })
        .required("uuid", ParamType::Uuid)
        .optional("id", ParamType::Int, Value::Null),
    )?;
    registry.register(
        NAMESPACE,
        CommandSpec::stream("get_bm_categories", move |user, _| {
            rows(get_bm_categories(store.clone(), user))
        }),
    )?;
    Ok(())
}

async fn get_bookmarks(
    store: Arc<BookmarkStore>,
    user: Identity,
    args: BoundArgs,
) -> anyhow::Result<Vec<Value>> {
    let uuid: Uuid = args.get("uuid")?;
    let id: Option<u64> = args.get_opt("id")?;
    let Some(owner) = user.owner() else {
        return Ok(Vec::new());
    };
    let found = store.bookmarks_for(owner, uuid, id).await;
    Ok(found.iter().map(Bookmark::to_json).collect())
}

async fn get_bm_categories(store: Arc<BookmarkStore>, user: Identity) -> anyhow::Result<Vec<Value>> {
    let Some(owner) = user.owner() else {
        return Ok(Vec::new());
    };
    let found = store.active_categories(owner).await;
    Ok(found.iter().map(Category::to_json).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORK: &str = "0b0e6a4e-9a0f-4d52-9a57-6a1d55a3c111";
    const HOME: &str = "5d1b8f7e-31a4-4a77-8a0c-0f9f0e3f2b22";

    fn bookmark(id: u64, owner: &str, uuid: &str, name: &str) -> Bookmark {
        Bookmark {
            id,
            owner: owner.into(),
            uuid: Uuid::parse_str(uuid).unwrap(),
            name: name.into(),
            url: format!("https://example.com/{id}"),
            icon_url: None,
        }
    }

    #[tokio::test]
    async fn filters_by_owner_and_category_in_order() {
        let store = BookmarkStore::new(
            Vec::new(),
            vec![
                bookmark(1, "7", WORK, "Docs"),
                bookmark(2, "8", WORK, "Not mine"),
                bookmark(3, "7", HOME, "Elsewhere"),
                bookmark(4, "7", WORK, "Crates"),
            ],
        );
        let work = Uuid::parse_str(WORK).unwrap();
        let names: Vec<String> = store
            .bookmarks_for("7", work, None)
            .await
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["Docs", "Crates"]);

        let one = store.bookmarks_for("7", work, Some(4)).await;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name, "Crates");
    }

    #[tokio::test]
    async fn only_active_categories() {
        let store = BookmarkStore::default();
        for (id, active) in [(1, true), (2, false)] {
            store
                .add_category(Category {
                    id,
                    uuid: Uuid::new_v4(),
                    owner: "7".into(),
                    name: format!("c{id}"),
                    active,
                })
                .await;
        }
        let found = store.active_categories("7").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].to_json()["name"], "c1");
    }

    #[test]
    fn bookmark_wire_shape() {
        let b = bookmark(1, "7", WORK, "Docs");
        assert_eq!(
            b.to_json(),
            json!({
                "id": 1,
                "name": "Docs",
                "url": "https://example.com/1",
                "icon_url": null,
                "uuid": WORK,
            })
        );
    }
}
